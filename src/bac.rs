//! Basic Access Control: application selection and the mutual authentication that
//! establishes the secure messaging session keys.
//!
//! See ICAO Doc 9303-11 Section 4.3 and Appendix D.3:
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use constant_time_eq::constant_time_eq;
use rand::{CryptoRng, RngCore};
use tracing::{error, info, trace};

use crate::apdu::{split_response, sw2hex, APDU, SW_SUCCESS};
use crate::crypto::{compute_mac, padding_method_2, tdes_cbc_decrypt, tdes_cbc_encrypt, xor_slices, ZERO_IV};
use crate::keys::BacKeys;
use crate::secure_messaging::SecureSession;
use crate::{bytes2hex, CardChannel, PassportError};

/// Application identifier of the eMRTD LDS1 application.
pub const EMRTD_AID: [u8; 7] = [0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01];

/// Sends an APDU in plaintext and splits the reply.
pub(crate) fn send_plain<C: CardChannel + ?Sized>(
    channel: &mut C,
    apdu: &APDU,
) -> Result<(Vec<u8>, [u8; 2]), PassportError> {
    let response = channel.transceive(&apdu.to_bytes())?;
    split_response(&response)
}

/// Selects the eMRTD application using AID `A0000002471001`.
///
/// # Errors
///
/// * `PassportError::AppletNotFound` if the chip answers with anything but `90 00`.
/// * `PassportError::ChannelLost` if the link drops.
pub fn select_emrtd_application<C: CardChannel + ?Sized>(
    channel: &mut C,
) -> Result<(), PassportError> {
    info!(
        "Selecting eMRTD Application `International AID`: {}...",
        bytes2hex(&EMRTD_AID)
    );
    let apdu = APDU::new(0x00, 0xA4, 0x04, 0x0C, Some(EMRTD_AID.to_vec()), None)?;
    match send_plain(channel, &apdu)? {
        (_, SW_SUCCESS) => Ok(()),
        (_, [sw1, sw2]) => {
            error!("Received invalid SW during Select eMRTD Application command: {sw1:02X} {sw2:02X}");
            Err(PassportError::AppletNotFound(sw1, sw2))
        }
    }
}

/// Requests an 8 byte challenge from the chip.
fn get_challenge<C: CardChannel + ?Sized>(channel: &mut C) -> Result<[u8; 8], PassportError> {
    let apdu = APDU::new(0x00, 0x84, 0x00, 0x00, None, Some(0x08))?;
    let (rnd_ic, status) = send_plain(channel, &apdu)?;
    if status != SW_SUCCESS {
        error!("Received invalid SW during GET CHALLENGE: {}", sw2hex(status));
        return Err(PassportError::AuthenticationFailed(
            "GET CHALLENGE was rejected",
        ));
    }
    rnd_ic.as_slice().try_into().map_err(|_| {
        error!("GET CHALLENGE returned {} bytes instead of 8", rnd_ic.len());
        PassportError::AuthenticationFailed("GET CHALLENGE returned a malformed nonce")
    })
}

/// Performs GET CHALLENGE and EXTERNAL AUTHENTICATE and derives the session.
///
/// The eMRTD application must already be selected. Nothing is retained on failure: the
/// caller either gets a fresh [`SecureSession`] or an error.
///
/// # Errors
///
/// * `PassportError::AuthenticationFailed` if the chip rejects the cryptogram or its
///   answer does not verify (usually wrong credentials).
/// * `PassportError::ChannelLost` if the link drops.
pub fn establish_session<C, R>(
    channel: &mut C,
    rng: &mut R,
    keys: &BacKeys,
) -> Result<SecureSession, PassportError>
where
    C: CardChannel + ?Sized,
    R: RngCore + CryptoRng + ?Sized,
{
    trace!("Establishing session keys...");
    let rnd_ic = get_challenge(channel)?;

    let mut rnd_ifd = [0_u8; 8];
    rng.fill_bytes(&mut rnd_ifd);
    let mut k_ifd = [0_u8; 16];
    rng.fill_bytes(&mut k_ifd);

    let s = [&rnd_ifd[..], &rnd_ic[..], &k_ifd[..]].concat();
    let e_ifd = tdes_cbc_encrypt(&keys.k_enc, &ZERO_IV, &s)?;
    let m_ifd = compute_mac(&keys.k_mac, &padding_method_2(&e_ifd))?;
    let cmd_data = [&e_ifd[..], &m_ifd[..]].concat();

    let apdu = APDU::new(0x00, 0x82, 0x00, 0x00, Some(cmd_data), Some(0x28))?;
    let (resp_data, status) = send_plain(channel, &apdu)?;
    if status != SW_SUCCESS {
        error!(
            "Received invalid SW during EXTERNAL AUTHENTICATE: {}",
            sw2hex(status)
        );
        return Err(PassportError::AuthenticationFailed(
            "EXTERNAL AUTHENTICATE was rejected, check the document number and dates",
        ));
    }
    if resp_data.len() != 40 {
        error!(
            "EXTERNAL AUTHENTICATE response must be 40 bytes, found {}",
            resp_data.len()
        );
        return Err(PassportError::AuthenticationFailed(
            "EXTERNAL AUTHENTICATE response has the wrong length",
        ));
    }

    let (e_ic, m_ic) = resp_data.split_at(32);
    let expected_m_ic = compute_mac(&keys.k_mac, &padding_method_2(e_ic))?;
    if !constant_time_eq(&expected_m_ic, m_ic) {
        error!("MAC verification of the EXTERNAL AUTHENTICATE response failed");
        return Err(PassportError::AuthenticationFailed(
            "EXTERNAL AUTHENTICATE response MAC is not correct",
        ));
    }

    let r = tdes_cbc_decrypt(&keys.k_enc, &ZERO_IV, e_ic)?;
    if !constant_time_eq(&r[..8], &rnd_ic) {
        error!("Chip answered with a different RND.IC");
        return Err(PassportError::AuthenticationFailed(
            "RND.IC in the chip response does not match the challenge",
        ));
    }
    if !constant_time_eq(&r[8..16], &rnd_ifd) {
        error!("Chip answered with a different RND.IFD");
        return Err(PassportError::AuthenticationFailed(
            "RND.IFD in the chip response does not match",
        ));
    }

    let k_ic = &r[16..32];
    let ses_key_seed = xor_slices(&k_ifd, k_ic)?;
    let session_keys = BacKeys::from_seed(&ses_key_seed)?;

    let mut ssc = [0_u8; 8];
    ssc[..4].copy_from_slice(&rnd_ic[4..]);
    ssc[4..].copy_from_slice(&rnd_ifd[4..]);

    info!("BAC session established");
    Ok(SecureSession::new(
        session_keys.k_enc,
        session_keys.k_mac,
        u64::from_be_bytes(ssc),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Credentials;
    use crate::testing::{AppendixDCard, MockRng};
    use hex_literal::hex;

    fn appendix_d_keys() -> Result<BacKeys, PassportError> {
        BacKeys::derive(&Credentials::new("L898902C<", "690806", "940623")?)
    }

    #[test]
    fn test_establish_bac_session_keys() -> Result<(), PassportError> {
        let mut card = AppendixDCard::new();
        let mut rng = MockRng::default();

        select_emrtd_application(&mut card)?;
        let session = establish_session(&mut card, &mut rng, &appendix_d_keys()?)?;

        assert_eq!(session.ks_enc(), &hex!("979EC13B1CBFE9DCD01AB0FED307EAE5"));
        assert_eq!(session.ks_mac(), &hex!("F1CB1F1FB5ADF208806B89DC579DC1F8"));
        assert_eq!(session.ssc(), 0x8870_2212_0C06_C226);
        Ok(())
    }

    #[test]
    fn test_wrong_credentials_fail_authentication() -> Result<(), PassportError> {
        let mut card = AppendixDCard::new();
        let mut rng = MockRng::default();
        let keys = BacKeys::derive(&Credentials::new("L898902C<", "690806", "940624")?)?;

        select_emrtd_application(&mut card)?;
        let result = establish_session(&mut card, &mut rng, &keys);
        assert!(result.is_err_and(|e| matches!(e, PassportError::AuthenticationFailed(_))));
        Ok(())
    }

    #[test]
    fn test_fresh_nonce_is_rejected_by_recorded_card() -> Result<(), PassportError> {
        // The recorded card only accepts the RND.IFD / K.IFD of Appendix D.
        let mut card = AppendixDCard::new();
        let mut rng = rand::rngs::OsRng;
        let result = establish_session(&mut card, &mut rng, &appendix_d_keys()?);
        assert!(result.is_err_and(|e| matches!(e, PassportError::AuthenticationFailed(_))));
        Ok(())
    }

    /// Answers GET CHALLENGE with the Appendix D RND.IC and EXTERNAL AUTHENTICATE
    /// with `answer` and `90 00`, whatever the terminal sent.
    struct ForgedAnswerCard {
        answer: Vec<u8>,
    }

    impl CardChannel for ForgedAnswerCard {
        fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, PassportError> {
            Ok(match command.get(1) {
                Some(0x84) => hex!("4608F919887022129000").to_vec(),
                Some(0x82) => [&self.answer[..], &SW_SUCCESS].concat(),
                _ => SW_SUCCESS.to_vec(),
            })
        }
    }

    const APPENDIX_D_EA_RESPONSE: [u8; 40] = hex!(
        "46B9342A41396CD7386BF5803104D7CEDC122B9132139BAF2EEDC94EE178534F2F2D235D074D7449"
    );

    #[test]
    fn test_forged_answer_card_accepts_appendix_d() -> Result<(), PassportError> {
        let mut card = ForgedAnswerCard {
            answer: APPENDIX_D_EA_RESPONSE.to_vec(),
        };
        let session = establish_session(&mut card, &mut MockRng::default(), &appendix_d_keys()?)?;
        assert_eq!(session.ssc(), 0x8870_2212_0C06_C226);
        Ok(())
    }

    #[test]
    fn test_response_with_bad_mac_fails_authentication() -> Result<(), PassportError> {
        let mut answer = APPENDIX_D_EA_RESPONSE.to_vec();
        answer[39] ^= 0x01;
        let mut card = ForgedAnswerCard { answer };
        let result = establish_session(&mut card, &mut MockRng::default(), &appendix_d_keys()?);
        assert!(result.is_err_and(|e| matches!(
            e,
            PassportError::AuthenticationFailed(reason) if reason.contains("MAC")
        )));
        Ok(())
    }

    #[test]
    fn test_response_with_other_rnd_ifd_fails_authentication() -> Result<(), PassportError> {
        let keys = appendix_d_keys()?;
        // RND.IC || some other RND.IFD || K.IC, correctly encrypted and MACed
        let r = hex!("4608F91988702212 0000000000000000 0B4F80323EB3191CB04970CB4052790B");
        let e_ic = tdes_cbc_encrypt(&keys.k_enc, &ZERO_IV, &r)?;
        let m_ic = compute_mac(&keys.k_mac, &padding_method_2(&e_ic))?;
        let mut card = ForgedAnswerCard {
            answer: [&e_ic[..], &m_ic[..]].concat(),
        };
        let result = establish_session(&mut card, &mut MockRng::default(), &keys);
        assert!(result.is_err_and(|e| matches!(
            e,
            PassportError::AuthenticationFailed(reason) if reason.contains("RND.IFD")
        )));
        Ok(())
    }

    #[test]
    fn test_select_unknown_application() {
        struct NotAPassport;
        impl CardChannel for NotAPassport {
            fn transceive(&mut self, _command: &[u8]) -> Result<Vec<u8>, PassportError> {
                Ok(hex!("6A82").to_vec())
            }
        }
        let result = select_emrtd_application(&mut NotAPassport);
        assert!(result.is_err_and(|e| matches!(e, PassportError::AppletNotFound(0x6A, 0x82))));
    }
}
