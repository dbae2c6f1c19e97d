//! 3DES secure messaging.
//!
//! For details and examples, see ICAO Doc 9303-11 Section 9.8 and Appendix D.4:
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use core::fmt;

use constant_time_eq::constant_time_eq;
use tracing::{error, trace};

use crate::apdu::{split_response, sw2hex, APDU, SW_SM_OBJECTS_INCORRECT, SW_SM_OBJECTS_MISSING, SW_SUCCESS};
use crate::asn1::{int2asn1len, len2int};
use crate::crypto::{compute_mac, padding_method_2, remove_padding, tdes_cbc_decrypt, tdes_cbc_encrypt, ZERO_IV};
use crate::{bytes2hex, CardChannel, PassportError};

/// Session keys and Send Sequence Counter of an established BAC session.
///
/// Every wrapped command and every unwrapped response advances the counter by one, in
/// lock step with the chip. A session that fell out of step can not be repaired; it
/// has to be replaced by a new handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct SecureSession {
    ks_enc: [u8; 16],
    ks_mac: [u8; 16],
    ssc: u64,
}

impl SecureSession {
    /// Creates a session from the BAC session keys and the initial counter.
    #[must_use]
    pub const fn new(ks_enc: [u8; 16], ks_mac: [u8; 16], ssc: u64) -> Self {
        Self {
            ks_enc,
            ks_mac,
            ssc,
        }
    }

    /// Session encryption key `KS_enc`.
    #[must_use]
    pub const fn ks_enc(&self) -> &[u8; 16] {
        &self.ks_enc
    }

    /// Session MAC key `KS_mac`.
    #[must_use]
    pub const fn ks_mac(&self) -> &[u8; 16] {
        &self.ks_mac
    }

    /// Current value of the Send Sequence Counter.
    #[must_use]
    pub const fn ssc(&self) -> u64 {
        self.ssc
    }

    fn next_ssc(&self) -> Result<u64, PassportError> {
        self.ssc.checked_add(1).ok_or_else(|| {
            error!("SSC overflow");
            PassportError::OverflowSscError()
        })
    }

    fn increment_ssc(&mut self) -> Result<[u8; 8], PassportError> {
        self.ssc = self.next_ssc()?;
        Ok(self.ssc.to_be_bytes())
    }

    /// Protects a plaintext command APDU.
    ///
    /// A protected body of more than 255 bytes is sent as an extended length APDU. The
    /// counter only moves when the protected command is returned.
    ///
    /// # Errors
    ///
    /// * `PassportError::OverflowSscError` if the counter is exhausted.
    ///
    /// # Example
    ///
    /// ```
    /// # use passport_reader::PassportError;
    /// #
    /// # fn main() -> Result<(), PassportError> {
    /// use hex_literal::hex;
    /// use passport_reader::{SecureSession, APDU};
    ///
    /// // ICAO Doc 9303-11 Appendix D.4
    /// let mut session = SecureSession::new(
    ///     hex!("979EC13B1CBFE9DCD01AB0FED307EAE5"),
    ///     hex!("F1CB1F1FB5ADF208806B89DC579DC1F8"),
    ///     0x8870_2212_0C06_C226,
    /// );
    /// let select = APDU::new(0x00, 0xA4, 0x02, 0x0C, Some(vec![0x01, 0x1E]), None)?;
    /// assert_eq!(
    ///     session.wrap_command(&select)?,
    ///     hex!("0CA4020C158709016375432908C044F68E08BF8B92D635FF24F800")
    /// );
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn wrap_command(&mut self, apdu: &APDU) -> Result<Vec<u8>, PassportError> {
        let ssc = self.next_ssc()?;

        let mut header = apdu.get_command_header();
        header[0] |= 0x0C;

        let mut payload = Vec::new();
        if let Some(ref cdata) = apdu.cdata {
            let encrypted_data = tdes_cbc_encrypt(&self.ks_enc, &ZERO_IV, &padding_method_2(cdata))?;
            if apdu.ins % 2 == 0 {
                // For a command with even INS, any command data is encrypted
                // and encapsulated in a Tag 87 with padding indicator (01).
                payload.push(0x87);
                payload.extend(int2asn1len(encrypted_data.len() + 1));
                payload.push(0x01);
            } else {
                // For a command with odd INS, any command data is encrypted
                // and encapsulated in a Tag 85 without padding indicator.
                payload.push(0x85);
                payload.extend(int2asn1len(encrypted_data.len()));
            }
            payload.extend_from_slice(&encrypted_data);
        }

        if let Some(le) = apdu.le {
            // Commands with response have a protected Le-field (Tag 97) in the command data.
            payload.extend_from_slice(&[0x97, 0x01, le]);
        }

        let n = padding_method_2(&[&ssc.to_be_bytes()[..], &padding_method_2(&header), &payload].concat());
        let cc = compute_mac(&self.ks_mac, &n)?;

        payload.extend_from_slice(&[0x8E, 0x08]);
        payload.extend_from_slice(&cc);

        let protected_apdu = match u8::try_from(payload.len()) {
            Ok(lc) => [&header[..], &[lc], &payload, &[0x00]].concat(),
            Err(_) => {
                // Lc = 00 HH LL, Le = 00 00
                let lc = u16::try_from(payload.len()).map_err(PassportError::IntCastError)?;
                [&header[..], &[0x00], &lc.to_be_bytes(), &payload, &[0x00, 0x00]].concat()
            }
        };
        self.ssc = ssc;
        trace!("Protected APDU: {}", bytes2hex(&protected_apdu));
        Ok(protected_apdu)
    }

    /// Verifies and decrypts a protected response APDU, status word included.
    ///
    /// Returns the plaintext data and the protected status word. The MAC is checked
    /// before anything is decrypted.
    ///
    /// # Errors
    ///
    /// * `PassportError::SecureMessagingError` if the MAC is missing or wrong, or the chip
    ///   reports broken secure messaging objects.
    pub fn unwrap_response(&mut self, response: &[u8]) -> Result<(Vec<u8>, [u8; 2]), PassportError> {
        let ssc = self.increment_ssc()?;
        let (rapdu, status) = split_response(response)?;

        if rapdu.is_empty() {
            if status == SW_SM_OBJECTS_MISSING || status == SW_SM_OBJECTS_INCORRECT {
                error!("Chip rejected the protected command: {}", sw2hex(status));
                return Err(PassportError::SecureMessagingError(format!(
                    "chip reported secure messaging error {}",
                    sw2hex(status)
                )));
            }
            if status != SW_SUCCESS {
                // Errors are answered without secure messaging objects.
                trace!("Unprotected error status: {}", sw2hex(status));
                return Ok((Vec::new(), status));
            }
            error!("Protected response carries no MAC");
            return Err(PassportError::SecureMessagingError(
                "response carries no secure messaging objects".to_owned(),
            ));
        }

        let mut do85: Option<&[u8]> = None;
        let mut do87: Option<&[u8]> = None;
        let mut do99: Option<&[u8]> = None;
        let mut do8e: Option<&[u8]> = None;

        let mut rest = rapdu.as_slice();
        while !rest.is_empty() {
            let (tl_len, value_len) = len2int(rest, 1)?;
            let end = tl_len.saturating_add(value_len);
            if rest.len() < end {
                error!("Truncated data object in protected response");
                return Err(PassportError::ParseAsn1DataError(end, rest.len()));
            }
            match rest[0] {
                0x85 => do85 = Some(&rest[..end]),
                0x87 => do87 = Some(&rest[..end]),
                0x99 => do99 = Some(&rest[..end]),
                0x8E => do8e = Some(&rest[tl_len..end]),
                tag => {
                    error!("Tag {tag:02X} not supported in protected response");
                    return Err(PassportError::SecureMessagingError(format!(
                        "unexpected data object {tag:02X} in response"
                    )));
                }
            }
            rest = &rest[end..];
        }

        let Some(mac) = do8e else {
            error!("Protected response carries no MAC");
            return Err(PassportError::SecureMessagingError(
                "response MAC object 8E is missing".to_owned(),
            ));
        };
        let k = padding_method_2(
            &[
                &ssc[..],
                do85.unwrap_or_default(),
                do87.unwrap_or_default(),
                do99.unwrap_or_default(),
            ]
            .concat(),
        );
        let cc = compute_mac(&self.ks_mac, &k)?;
        if !constant_time_eq(&cc, mac) {
            error!("MAC verification failed");
            return Err(PassportError::SecureMessagingError(
                "response MAC is not correct".to_owned(),
            ));
        }

        let status = match do99 {
            Some([0x99, 0x02, sw1, sw2]) => [*sw1, *sw2],
            Some(other) => {
                error!("Malformed status object: {}", bytes2hex(other));
                return Err(PassportError::SecureMessagingError(
                    "malformed protected status word".to_owned(),
                ));
            }
            None => status,
        };

        let encrypted = match (do85, do87) {
            (Some(obj), _) => &obj[len2int(obj, 1)?.0..],
            (None, Some(obj)) => {
                let value = &obj[len2int(obj, 1)?.0..];
                match value.split_first() {
                    Some((&0x01, encrypted)) => encrypted,
                    _ => {
                        error!("Data object 87 lacks the padding indicator");
                        return Err(PassportError::SecureMessagingError(
                            "missing padding indicator".to_owned(),
                        ));
                    }
                }
            }
            (None, None) => return Ok((Vec::new(), status)),
        };

        let decrypted_padded = tdes_cbc_decrypt(&self.ks_enc, &ZERO_IV, encrypted).map_err(|err| {
            error!("Decrypting the response failed: {err}");
            PassportError::SecureMessagingError("response cryptogram is not decryptable".to_owned())
        })?;
        let data = remove_padding(&decrypted_padded)
            .map_err(|_| {
                PassportError::SecureMessagingError("response padding is not correct".to_owned())
            })?
            .to_vec();
        Ok((data, status))
    }
}

impl fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("ssc", &format_args!("{:016X}", self.ssc))
            .finish_non_exhaustive()
    }
}

/// A channel together with the one session that protects its traffic.
///
/// The channel is borrowed mutably for as long as the session lives, so commands are
/// strictly sequential and the session can not outlive the link it was negotiated on.
pub struct SecureChannel<'c, C: CardChannel + ?Sized> {
    channel: &'c mut C,
    session: SecureSession,
}

impl<'c, C: CardChannel + ?Sized> SecureChannel<'c, C> {
    /// Pairs `channel` with the session negotiated on it.
    pub fn new(channel: &'c mut C, session: SecureSession) -> Self {
        Self { channel, session }
    }

    #[must_use]
    pub const fn session(&self) -> &SecureSession {
        &self.session
    }

    /// Wraps `apdu`, exchanges it and unwraps the answer.
    ///
    /// # Errors
    ///
    /// `PassportError` from the channel or the codec. After any error the session must
    /// be abandoned.
    pub fn send(&mut self, apdu: &APDU) -> Result<(Vec<u8>, [u8; 2]), PassportError> {
        let protected = self.session.wrap_command(apdu)?;
        let response = self.channel.transceive(&protected)?;
        let (data, status) = self.session.unwrap_response(&response)?;
        trace!(
            "APDU response ({}): {}",
            sw2hex(status),
            bytes2hex(&data)
        );
        Ok((data, status))
    }
}

impl<C: CardChannel + ?Sized> fmt::Debug for SecureChannel<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
