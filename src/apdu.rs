use tracing::error;

use crate::{bytes2hex, PassportError};

/// Status word `90 00`.
pub const SW_SUCCESS: [u8; 2] = [0x90, 0x00];
/// Status word `69 87`, expected secure messaging data objects are missing.
pub const SW_SM_OBJECTS_MISSING: [u8; 2] = [0x69, 0x87];
/// Status word `69 88`, secure messaging data objects are incorrect.
pub const SW_SM_OBJECTS_INCORRECT: [u8; 2] = [0x69, 0x88];

/// A short command APDU (ISO/IEC 7816-4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct APDU {
    /// Class byte of the APDU
    pub(crate) cla: u8,
    /// Instruction byte of the APDU
    pub(crate) ins: u8,
    /// Parameter 1 byte of the APDU
    pub(crate) p1: u8,
    /// Parameter 2 byte of the APDU
    pub(crate) p2: u8,
    /// Command data field of the APDU, Lc is derived from its length
    pub(crate) cdata: Option<Vec<u8>>,
    /// Expected length of the response data field (Le), `0x00` means 256
    pub(crate) le: Option<u8>,
}

impl APDU {
    /// Constructs a new APDU.
    ///
    /// # Errors
    ///
    /// `PassportError` if `cdata` is empty or longer than 255 bytes.
    ///
    /// # Example
    ///
    /// ```
    /// # use passport_reader::PassportError;
    /// #
    /// # fn main() -> Result<(), PassportError> {
    /// use passport_reader::APDU;
    /// use hex_literal::hex;
    ///
    /// let apdu = APDU::new(0x00, 0x84, 0x00, 0x00, None, Some(0x08))?;
    /// assert_eq!(apdu.to_bytes(), hex!("0084000008"));
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn new(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        cdata: Option<Vec<u8>>,
        le: Option<u8>,
    ) -> Result<Self, PassportError> {
        if let Some(ref data) = cdata {
            if data.is_empty() || data.len() > 0xFF {
                error!(
                    "Command data of a short APDU must be 1 to 255 bytes, found {}",
                    data.len()
                );
                return Err(PassportError::InvalidArgument(
                    "Command data of a short APDU must be 1 to 255 bytes",
                ));
            }
        }
        Ok(Self {
            cla,
            ins,
            p1,
            p2,
            cdata,
            le,
        })
    }

    /// Retrieves the command header: CLA, INS, P1 and P2.
    #[must_use]
    pub const fn get_command_header(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    /// Serializes the APDU to its short-length wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut apdu_bytes = self.get_command_header().to_vec();
        if let Some(ref data) = self.cdata {
            // length checked in `new`
            apdu_bytes.push(data.len() as u8);
            apdu_bytes.extend_from_slice(data);
        }
        if let Some(le) = self.le {
            apdu_bytes.push(le);
        }
        apdu_bytes
    }
}

/// Splits a response APDU into its data field and status word.
///
/// # Errors
///
/// `PassportError` if the response is shorter than the two status bytes.
pub(crate) fn split_response(response: &[u8]) -> Result<(Vec<u8>, [u8; 2]), PassportError> {
    let Some(split) = response.len().checked_sub(2) else {
        error!(
            "Card response length should be greater than or equal to 2, found {}",
            response.len()
        );
        return Err(PassportError::InvalidResponseError());
    };
    let (data, sw) = response.split_at(split);
    Ok((data.to_vec(), [sw[0], sw[1]]))
}

/// Formats a status word for logs.
#[must_use]
pub(crate) fn sw2hex(sw: [u8; 2]) -> String {
    bytes2hex(&sw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_apdu_encoding() -> Result<(), PassportError> {
        let select = APDU::new(
            0x00,
            0xA4,
            0x04,
            0x0C,
            Some(hex!("A0000002471001").to_vec()),
            None,
        )?;
        assert_eq!(select.to_bytes(), hex!("00A4040C07A0000002471001"));
        assert_eq!(select.get_command_header(), hex!("00A4040C"));

        let read = APDU::new(0x00, 0xB0, 0x00, 0x04, None, Some(0x12))?;
        assert_eq!(read.to_bytes(), hex!("00B0000412"));
        Ok(())
    }

    #[test]
    fn test_apdu_rejects_bad_data() {
        assert!(APDU::new(0x00, 0xA4, 0x02, 0x0C, Some(vec![]), None).is_err());
        assert!(APDU::new(0x00, 0xA4, 0x02, 0x0C, Some(vec![0; 256]), None).is_err());
    }

    #[test]
    fn test_split_response() -> Result<(), PassportError> {
        let (data, sw) = split_response(&hex!("4608F91988702212 9000"))?;
        assert_eq!(data, hex!("4608F91988702212"));
        assert_eq!(sw, SW_SUCCESS);

        let (data, sw) = split_response(&hex!("6A82"))?;
        assert!(data.is_empty());
        assert_eq!(sw2hex(sw), "6A82");

        assert!(split_response(&hex!("90")).is_err());
        Ok(())
    }
}
