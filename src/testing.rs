//! Card doubles shared by the unit tests.

use std::collections::HashMap;

use constant_time_eq::constant_time_eq;
use hex_literal::hex;
use rand::{CryptoRng, RngCore};

use crate::apdu::{split_response, APDU, SW_SUCCESS};
use crate::asn1::{int2asn1len, len2int};
use crate::crypto::{compute_mac, padding_method_2, remove_padding, tdes_cbc_decrypt, tdes_cbc_encrypt, xor_slices, ZERO_IV};
use crate::keys::{BacKeys, Credentials};
use crate::{CardChannel, PassportError};

/// Replays RND.IFD and K.IFD of ICAO Doc 9303-11 Appendix D.3.
#[derive(Clone, Debug)]
pub(crate) struct MockRng {
    data: Vec<u8>,
    index: usize,
}

impl Default for MockRng {
    fn default() -> Self {
        Self {
            data: hex!("781723860C06C226
                        0B795240CB7049B01C19B33E32804F0B")
            .to_vec(),
            index: 0,
        }
    }
}

impl CryptoRng for MockRng {}

impl RngCore for MockRng {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0; 4];
        self.fill_bytes(&mut buf);
        u32::from_be_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0; 8];
        self.fill_bytes(&mut buf);
        u64::from_be_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest.iter_mut() {
            *byte = self.data[self.index];
            self.index = (self.index + 1) % self.data.len();
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// A card that answers with the recorded exchanges of Appendix D.3 and D.4 only.
pub(crate) struct AppendixDCard;

impl AppendixDCard {
    pub(crate) const fn new() -> Self {
        Self
    }
}

impl CardChannel for AppendixDCard {
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, PassportError> {
        let response: &[u8] = match command {
            // Select eMRTD application
            c if c == hex!("00A4040C07A0000002471001") => &hex!("9000"),
            // Request an 8 byte random number
            c if c == hex!("0084000008") => &hex!("4608F91988702212 9000"),
            // EXTERNAL AUTHENTICATE command
            c if c
                == hex!("0082000028 72C29C2371CC9BDB65B779B8E8D37B29ECC154AA
                                   56A8799FAE2F498F76ED92F25F1448EEA8AD90A7 28") =>
            {
                &hex!("46B9342A41396CD7386BF5803104D7CEDC122B91
                       32139BAF2EEDC94EE178534F2F2D235D074D7449 9000")
            }
            [0x00, 0x82, ..] => &hex!("6300"),
            // Select EF.COM
            c if c == hex!("0CA4020C15 8709016375432908C044F6 8E08BF8B92D635FF24F8 00") => {
                &hex!("990290008E08FA855A5D4C50A8ED 9000")
            }
            // Read Binary of first four bytes
            c if c == hex!("0CB000000D 9701048E08ED6705417E96BA55 00") => {
                &hex!("8709019FF0EC34F9922651990290008E08AD55CC17140B2DED 9000")
            }
            // Read Binary of remaining 18 bytes from offset 4
            c if c == hex!("0CB000040D 9701128E082EA28A70F3C7B535 00") => &hex!(
                "871901FB9235F4E4037F2327DCC8964F1F9B8C30F42C8E2FFF224A99
                 0290008E08C8B2787EAEA07D74 9000"
            ),
            [0x0C, ..] => &hex!("6988"),
            _ => &hex!("6D00"),
        };
        Ok(response.to_vec())
    }
}

/// The chip side of 3DES secure messaging.
pub(crate) struct ChipCodec {
    ks_enc: [u8; 16],
    ks_mac: [u8; 16],
    ssc: u64,
}

impl ChipCodec {
    pub(crate) fn new(ks_enc: [u8; 16], ks_mac: [u8; 16], ssc: u64) -> Self {
        Self {
            ks_enc,
            ks_mac,
            ssc,
        }
    }

    fn next_ssc(&mut self) -> [u8; 8] {
        self.ssc += 1;
        self.ssc.to_be_bytes()
    }

    /// Verifies and decrypts a protected command, returning the plain APDU.
    pub(crate) fn unprotect_command(&mut self, command: &[u8]) -> Result<APDU, PassportError> {
        let ssc = self.next_ssc();
        let sm_error = || PassportError::SecureMessagingError("chip rejected command".to_owned());
        if command.len() < 6 || command[0] & 0x0C != 0x0C {
            return Err(sm_error());
        }
        let header = &command[..4];
        let (lc, body_start) = match command[4] {
            // extended length: 00 HH LL
            0x00 if command.len() >= 7 => (usize::from(u16::from_be_bytes([command[5], command[6]])), 7),
            lc => (usize::from(lc), 5),
        };
        let body = command.get(body_start..body_start + lc).ok_or_else(sm_error)?;

        let mut cdata = None;
        let mut le = None;
        let mut mac = None;
        let mut mac_input_end = 0;
        let mut rest = body;
        while !rest.is_empty() {
            let (tl, v) = len2int(rest, 1)?;
            let obj = rest.get(..tl + v).ok_or_else(sm_error)?;
            match obj[0] {
                0x87 => {
                    let encrypted = obj.get(tl + 1..).ok_or_else(sm_error)?;
                    cdata = Some(self.decrypt(encrypted)?);
                }
                0x85 => cdata = Some(self.decrypt(&obj[tl..])?),
                0x97 => le = obj.get(tl).copied(),
                0x8E => {
                    mac = Some(&obj[tl..]);
                    mac_input_end = body.len() - rest.len();
                }
                _ => return Err(sm_error()),
            }
            rest = &rest[tl + v..];
        }

        let mac = mac.ok_or_else(sm_error)?;
        let n = padding_method_2(
            &[&ssc[..], &padding_method_2(header), &body[..mac_input_end]].concat(),
        );
        if !constant_time_eq(&compute_mac(&self.ks_mac, &n)?, mac) {
            return Err(sm_error());
        }
        APDU::new(header[0] & !0x0C, header[1], header[2], header[3], cdata, le)
    }

    fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>, PassportError> {
        let padded = tdes_cbc_decrypt(&self.ks_enc, &ZERO_IV, encrypted)?;
        Ok(remove_padding(&padded)?.to_vec())
    }

    /// Protects response data and status word.
    pub(crate) fn protect_response(
        &mut self,
        data: &[u8],
        status: [u8; 2],
    ) -> Result<Vec<u8>, PassportError> {
        let ssc = self.next_ssc();
        let mut objects = Vec::new();
        if !data.is_empty() {
            let encrypted = tdes_cbc_encrypt(&self.ks_enc, &ZERO_IV, &padding_method_2(data))?;
            objects.push(0x87);
            objects.extend(int2asn1len(encrypted.len() + 1));
            objects.push(0x01);
            objects.extend(encrypted);
        }
        objects.extend_from_slice(&[0x99, 0x02, status[0], status[1]]);
        let mac = compute_mac(
            &self.ks_mac,
            &padding_method_2(&[&ssc[..], &objects].concat()),
        )?;
        objects.extend_from_slice(&[0x8E, 0x08]);
        objects.extend_from_slice(&mac);
        objects.extend_from_slice(&SW_SUCCESS);
        Ok(objects)
    }
}

/// Specimen TD3 MRZ of ICAO Doc 9303-4 Appendix A.
pub(crate) const SPECIMEN_MRZ: &str = concat!(
    "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<",
    "L898902C36UTO7408122F1204159ZE184226B<<<<<10"
);

/// `SubjectPublicKeyInfo` of a toy RSA key, as stored in EF.DG15.
pub(crate) const SPECIMEN_SPKI: [u8; 28] = hex!(
    "301A 300D06092A864886F70D0101010500 0309 00 3006 02010B 020103"
);

pub(crate) fn specimen_credentials() -> Credentials {
    Credentials::new("L898902C3", "740812", "120415").expect("valid specimen credentials")
}

pub(crate) fn specimen_com() -> Vec<u8> {
    hex!("6014 5F0104 30313037 5F3606 303430303030 5C02 616F").to_vec()
}

pub(crate) fn specimen_dg1(mrz: &str) -> Vec<u8> {
    let mut mrz_tlv = vec![0x5F, 0x1F];
    mrz_tlv.extend(int2asn1len(mrz.len()));
    mrz_tlv.extend_from_slice(mrz.as_bytes());
    let mut dg1 = vec![0x61];
    dg1.extend(int2asn1len(mrz_tlv.len()));
    dg1.extend(mrz_tlv);
    dg1
}

pub(crate) fn specimen_dg15() -> Vec<u8> {
    let mut dg15 = vec![0x6F];
    dg15.extend(int2asn1len(SPECIMEN_SPKI.len()));
    dg15.extend_from_slice(&SPECIMEN_SPKI);
    dg15
}

/// Link failure injected by [`SimulatedPassport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// The link drops when the chip receives its `n`-th command of the attempt.
    DropAfter(usize),
    /// The response to the `n`-th command of the attempt is corrupted in transit.
    CorruptResponse(usize),
}

/// A BAC protected chip holding EF.COM, EF.DG1 and EF.DG15.
pub(crate) struct SimulatedPassport {
    keys: BacKeys,
    files: HashMap<[u8; 2], Vec<u8>>,
    applet_present: bool,
    selected_app: bool,
    rnd_ic: Option<[u8; 8]>,
    session: Option<ChipCodec>,
    selected_file: Option<[u8; 2]>,
    challenges: u64,
    commands_this_attempt: usize,
    /// Faults consumed one per attempt, in order.
    pub(crate) faults: Vec<Fault>,
    pub(crate) connects: usize,
    pub(crate) closes: usize,
    pub(crate) open: bool,
    pub(crate) read_offsets: Vec<usize>,
}

impl SimulatedPassport {
    pub(crate) fn specimen() -> Self {
        Self::new(&specimen_credentials(), SPECIMEN_MRZ, Some(specimen_dg15()))
    }

    pub(crate) fn new(credentials: &Credentials, mrz: &str, dg15: Option<Vec<u8>>) -> Self {
        let mut files = HashMap::new();
        files.insert([0x01, 0x1E], specimen_com());
        files.insert([0x01, 0x01], specimen_dg1(mrz));
        if let Some(dg15) = dg15 {
            files.insert([0x01, 0x0F], dg15);
        }
        Self {
            keys: BacKeys::derive(credentials).expect("valid specimen keys"),
            files,
            applet_present: true,
            selected_app: false,
            rnd_ic: None,
            session: None,
            selected_file: None,
            challenges: 0,
            commands_this_attempt: 0,
            faults: Vec::new(),
            connects: 0,
            closes: 0,
            open: false,
            read_offsets: Vec::new(),
        }
    }

    pub(crate) fn without_applet(mut self) -> Self {
        self.applet_present = false;
        self
    }

    pub(crate) fn with_faults(mut self, faults: &[Fault]) -> Self {
        self.faults = faults.to_vec();
        self
    }

    fn current_fault(&self) -> Option<Fault> {
        // attempts are numbered from 1 by `connect`
        self.connects
            .checked_sub(1)
            .and_then(|attempt| self.faults.get(attempt).copied())
    }

    fn reset(&mut self) {
        self.selected_app = false;
        self.rnd_ic = None;
        self.session = None;
        self.selected_file = None;
        self.commands_this_attempt = 0;
    }

    fn plain(&mut self, apdu: &[u8]) -> Result<Vec<u8>, PassportError> {
        match apdu {
            [0x00, 0xA4, 0x04, 0x0C, 0x07, aid @ ..] if aid == hex!("A0000002471001") => {
                if !self.applet_present {
                    return Ok(hex!("6A82").to_vec());
                }
                self.selected_app = true;
                self.session = None;
                Ok(SW_SUCCESS.to_vec())
            }
            [0x00, 0x84, 0x00, 0x00, 0x08] if self.selected_app => {
                self.challenges += 1;
                let mut rnd_ic = hex!("4608F91988702212");
                rnd_ic[7] = rnd_ic[7].wrapping_add(self.challenges as u8);
                self.rnd_ic = Some(rnd_ic);
                Ok([&rnd_ic[..], &SW_SUCCESS].concat())
            }
            [0x00, 0x82, 0x00, 0x00, 0x28, body @ .., 0x28] if body.len() == 40 => {
                self.external_authenticate(body)
            }
            _ => Ok(hex!("6D00").to_vec()),
        }
    }

    fn external_authenticate(&mut self, body: &[u8]) -> Result<Vec<u8>, PassportError> {
        let Some(rnd_ic) = self.rnd_ic.take() else {
            return Ok(hex!("6985").to_vec());
        };
        let (e_ifd, m_ifd) = body.split_at(32);
        let expected = compute_mac(&self.keys.k_mac, &padding_method_2(e_ifd))?;
        if !constant_time_eq(&expected, m_ifd) {
            return Ok(hex!("6300").to_vec());
        }
        let s = tdes_cbc_decrypt(&self.keys.k_enc, &ZERO_IV, e_ifd)?;
        if s[8..16] != rnd_ic {
            return Ok(hex!("6300").to_vec());
        }
        let rnd_ifd = &s[..8];
        let k_ifd = &s[16..32];
        let k_ic = hex!("0B4F80323EB3191CB04970CB4052790B");

        let r = [&rnd_ic[..], rnd_ifd, &k_ic[..]].concat();
        let e_ic = tdes_cbc_encrypt(&self.keys.k_enc, &ZERO_IV, &r)?;
        let m_ic = compute_mac(&self.keys.k_mac, &padding_method_2(&e_ic))?;

        let session_keys = BacKeys::from_seed(&xor_slices(k_ifd, &k_ic)?)?;
        let mut ssc = [0_u8; 8];
        ssc[..4].copy_from_slice(&rnd_ic[4..]);
        ssc[4..].copy_from_slice(&rnd_ifd[4..]);
        self.session = Some(ChipCodec::new(
            session_keys.k_enc,
            session_keys.k_mac,
            u64::from_be_bytes(ssc),
        ));
        Ok([&e_ic[..], &m_ic[..], &SW_SUCCESS].concat())
    }

    fn protected(&mut self, command: &[u8]) -> Result<Vec<u8>, PassportError> {
        let Some(mut codec) = self.session.take() else {
            return Ok(hex!("6988").to_vec());
        };
        let Ok(apdu) = codec.unprotect_command(command) else {
            // the session is gone for good
            return Ok(hex!("6988").to_vec());
        };
        let (data, status) = self.execute(&apdu);
        let response = codec.protect_response(&data, status)?;
        self.session = Some(codec);
        Ok(response)
    }

    fn execute(&mut self, apdu: &APDU) -> (Vec<u8>, [u8; 2]) {
        match (apdu.ins, apdu.p1, &apdu.cdata) {
            (0xA4, 0x02, Some(fid)) if fid.len() == 2 => {
                let fid = [fid[0], fid[1]];
                if self.files.contains_key(&fid) {
                    self.selected_file = Some(fid);
                    (Vec::new(), SW_SUCCESS)
                } else {
                    (Vec::new(), [0x6A, 0x82])
                }
            }
            (0xB0, p1, None) if p1 & 0x80 == 0 => {
                let offset = usize::from(p1) << 8 | usize::from(apdu.p2);
                self.read_offsets.push(offset);
                let Some(file) = self.selected_file.and_then(|fid| self.files.get(&fid)) else {
                    return (Vec::new(), [0x69, 0x86]);
                };
                if offset > file.len() {
                    return (Vec::new(), [0x6B, 0x00]);
                }
                let le = match apdu.le {
                    Some(0) | None => 256,
                    Some(le) => usize::from(le),
                };
                let end = file.len().min(offset + le);
                (file[offset..end].to_vec(), SW_SUCCESS)
            }
            _ => (Vec::new(), [0x6D, 0x00]),
        }
    }
}

impl CardChannel for SimulatedPassport {
    fn connect(&mut self) -> Result<(), PassportError> {
        self.connects += 1;
        self.open = true;
        self.reset();
        Ok(())
    }

    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, PassportError> {
        if !self.open {
            return Err(PassportError::ChannelLost("not connected".to_owned()));
        }
        self.commands_this_attempt += 1;
        let fault = self.current_fault();
        if fault == Some(Fault::DropAfter(self.commands_this_attempt)) {
            self.open = false;
            self.reset();
            return Err(PassportError::ChannelLost("tag was lost".to_owned()));
        }
        let mut response = if command.first() == Some(&0x0C) {
            self.protected(command)?
        } else {
            self.plain(command)?
        };
        if fault == Some(Fault::CorruptResponse(self.commands_this_attempt)) {
            if let Ok((data, _)) = split_response(&response) {
                if let Some(last) = data.len().checked_sub(1) {
                    response[last] ^= 0x01;
                }
            }
        }
        Ok(response)
    }

    fn close(&mut self) {
        self.closes += 1;
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bac::{establish_session, select_emrtd_application};
    use crate::secure_messaging::SecureChannel;

    #[test]
    fn test_simulated_passport_answers_protected_reads() -> Result<(), PassportError> {
        let mut chip = SimulatedPassport::specimen();
        chip.connect()?;
        select_emrtd_application(&mut chip)?;
        let keys = BacKeys::derive(&specimen_credentials())?;
        let session = establish_session(&mut chip, &mut MockRng::default(), &keys)?;

        let mut channel = SecureChannel::new(&mut chip, session);
        let select = APDU::new(0x00, 0xA4, 0x02, 0x0C, Some(vec![0x01, 0x1E]), None)?;
        assert_eq!(channel.send(&select)?, (Vec::new(), SW_SUCCESS));
        let read = APDU::new(0x00, 0xB0, 0x00, 0x00, None, Some(0x04))?;
        assert_eq!(channel.send(&read)?, (hex!("60145F01").to_vec(), SW_SUCCESS));
        Ok(())
    }

    #[test]
    fn test_specimen_files_are_well_formed() -> Result<(), PassportError> {
        let com = specimen_com();
        assert_eq!(len2int(&com, 1)?, (2, com.len() - 2));
        let dg1 = specimen_dg1(SPECIMEN_MRZ);
        assert_eq!(len2int(&dg1, 1)?, (2, dg1.len() - 2));
        let dg15 = specimen_dg15();
        assert_eq!(len2int(&dg15, 1)?, (2, dg15.len() - 2));
        assert_eq!(len2int(&SPECIMEN_SPKI, 1)?, (2, SPECIMEN_SPKI.len() - 2));
        Ok(())
    }
}
