//! The data a successful read produces.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Serialize, Serializer};
use tracing::warn;

use crate::mrz::{date_triplet, CheckDigitMismatch, MrzInfo, Sex};
use crate::PassportError;

/// Identity data read from the chip.
///
/// Dates are `[YY, MM, DD]` as printed in the MRZ; the century is not resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassportRecord {
    pub document_number: String,
    pub date_of_birth: [u8; 3],
    pub date_of_expiry: [u8; 3],
    /// Secondary identifier.
    pub first_name: String,
    /// Primary identifier.
    pub last_name: String,
    pub nationality: String,
    #[serde(rename = "gender", serialize_with = "serialize_sex")]
    pub sex: Sex,
    pub issuing_state: String,
    /// DER `SubjectPublicKeyInfo` of the Active Authentication key.
    #[serde(serialize_with = "serialize_base64")]
    pub pubkey: Vec<u8>,
    /// MRZ check digits that did not match; the affected fields are kept as read.
    #[serde(skip)]
    pub check_digit_mismatches: Vec<CheckDigitMismatch>,
}

fn serialize_sex<S: Serializer>(sex: &Sex, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(sex.as_str())
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

impl PassportRecord {
    /// Assembles a record from the decoded MRZ and the EF.DG15 public key.
    ///
    /// # Errors
    ///
    /// `PassportError::InvalidFileStructure` if an MRZ date is not six digits.
    pub fn from_mrz(info: MrzInfo, pubkey: Vec<u8>) -> Result<Self, PassportError> {
        for mismatch in &info.mismatches {
            warn!("{mismatch}, continuing with the field as read");
        }
        Ok(Self {
            date_of_birth: date_triplet(&info.date_of_birth)?,
            date_of_expiry: date_triplet(&info.date_of_expiry)?,
            document_number: info.document_number,
            first_name: info.secondary_identifier,
            last_name: info.primary_identifier,
            nationality: info.nationality,
            sex: info.sex,
            issuing_state: info.issuing_state,
            pubkey,
            check_digit_mismatches: info.mismatches,
        })
    }

    /// Renders the record as the JSON object handed to downstream consumers.
    ///
    /// # Errors
    ///
    /// `PassportError::JsonError` if serialization fails.
    pub fn to_json(&self) -> Result<String, PassportError> {
        serde_json::to_string(self).map_err(PassportError::JsonError)
    }
}
