//! Decoding of EF.COM, EF.DG1 and EF.DG15.

use tracing::{error, trace};

use crate::asn1::{get_asn1_child, split_tlv, validate_asn1_tag};
use crate::mrz::MrzInfo;
use crate::{bytes2hex, PassportError};

/// Content of EF.COM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComFile {
    /// LDS version as `aabb`, e.g. `0107` for LDS 1.7.
    pub lds_version: String,
    /// Unicode version as `aabbcc`.
    pub unicode_version: String,
    /// Tags of the data groups present on the chip.
    pub data_groups: Vec<u8>,
}

impl ComFile {
    /// Parses EF.COM.
    ///
    /// # Errors
    ///
    /// `PassportError` if the file is not `60 L { 5F01, 5F36, 5C }`.
    ///
    /// # Example
    ///
    /// ```
    /// # use passport_reader::PassportError;
    /// #
    /// # fn main() -> Result<(), PassportError> {
    /// use hex_literal::hex;
    /// use passport_reader::ComFile;
    ///
    /// let com = ComFile::parse(&hex!("60145F0104303130365F36063034303030305C026175"))?;
    /// assert_eq!(com.lds_version, "0106");
    /// assert_eq!(com.data_groups, hex!("6175"));
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn parse(data: &[u8]) -> Result<Self, PassportError> {
        validate_asn1_tag(data, &[0x60])?;
        let (content, _) = get_asn1_child(data, 1)?;

        validate_asn1_tag(content, &[0x5F, 0x01])?;
        let (lds_version, rest) = get_asn1_child(content, 2)?;
        validate_asn1_tag(rest, &[0x5F, 0x36])?;
        let (unicode_version, rest) = get_asn1_child(rest, 2)?;
        validate_asn1_tag(rest, &[0x5C])?;
        let (data_groups, _) = get_asn1_child(rest, 1)?;

        let text = |bytes: &[u8]| {
            String::from_utf8(bytes.to_vec()).map_err(|_| {
                error!("EF.COM version is not text: {}", bytes2hex(bytes));
                PassportError::InvalidFileStructure("EF.COM version is not text")
            })
        };
        Ok(Self {
            lds_version: text(lds_version)?,
            unicode_version: text(unicode_version)?,
            data_groups: data_groups.to_vec(),
        })
    }

    /// Whether the data group with outer tag `tag` is listed.
    #[must_use]
    pub fn lists(&self, tag: u8) -> bool {
        self.data_groups.contains(&tag)
    }
}

/// Extracts and parses the MRZ from EF.DG1.
///
/// # Errors
///
/// `PassportError` if the file is not `61 L { 5F1F L <mrz> }` or the MRZ does not parse.
/// An MRZ with characters outside the MRZ alphabet is reported as
/// `PassportError::InvalidFileStructure`, like any other damaged file.
pub fn parse_dg1(data: &[u8]) -> Result<MrzInfo, PassportError> {
    validate_asn1_tag(data, &[0x61])?;
    let (content, _) = get_asn1_child(data, 1)?;
    validate_asn1_tag(content, &[0x5F, 0x1F])?;
    let (mrz, _) = get_asn1_child(content, 2)?;
    let Ok(mrz) = core::str::from_utf8(mrz) else {
        error!("MRZ is not ASCII: {}", bytes2hex(mrz));
        return Err(PassportError::InvalidFileStructure("MRZ is not ASCII"));
    };
    trace!("MRZ: {mrz}");
    MrzInfo::parse(mrz).map_err(|err| match err {
        PassportError::ParseMrzCharError(_) | PassportError::ParseMrzFieldError(..) => {
            error!("MRZ in EF.DG1 does not parse: {err}");
            PassportError::InvalidFileStructure("MRZ in EF.DG1 is not valid")
        }
        other => other,
    })
}

/// Extracts the `SubjectPublicKeyInfo` from EF.DG15, complete with its own tag and length.
///
/// The key itself is not validated.
///
/// # Errors
///
/// `PassportError` if the file is not `6F L { 30 L .. }`.
pub fn parse_dg15(data: &[u8]) -> Result<Vec<u8>, PassportError> {
    validate_asn1_tag(data, &[0x6F])?;
    let (content, _) = get_asn1_child(data, 1)?;
    validate_asn1_tag(content, &[0x30])?;
    let (spki, _, _) = split_tlv(content, 1)?;
    Ok(spki.to_vec())
}
