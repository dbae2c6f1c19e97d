use core::fmt;
use std::num::TryFromIntError;

use crate::files::FileId;
use crate::mrz::CheckDigitMismatch;

/// Errors raised while reading an ePassport.
#[derive(Debug)]
#[non_exhaustive]
pub enum PassportError {
    /// SELECT of the eMRTD application was answered with a non-success status word.
    AppletNotFound(u8, u8),
    /// Basic Access Control was rejected or could not be verified.
    AuthenticationFailed(&'static str),
    /// A protected response failed MAC verification or decryption.
    SecureMessagingError(String),
    /// A SELECT or READ BINARY on an elementary file returned a non-success status word.
    FileReadError(FileId, u8, u8),
    /// An MRZ check digit does not match the field it protects.
    MrzCheckDigitMismatch(CheckDigitMismatch),
    /// The contactless link dropped or stopped answering.
    ChannelLost(String),
    /// The read was abandoned by the caller.
    Cancelled,
    /// A caller supplied MRZ field holds a character outside the MRZ alphabet.
    ParseMrzCharError(char),
    /// A caller supplied MRZ field has the wrong shape.
    ParseMrzFieldError(&'static str, String),
    /// ASN.1 data is shorter than its length octets claim: (expected, found).
    ParseAsn1DataError(usize, usize),
    /// An ASN.1 tag other than the expected one: (expected, found).
    ParseAsn1TagError(String, String),
    /// An elementary file read from the chip does not have the expected layout.
    InvalidFileStructure(&'static str),
    /// A function was called with an argument it can not work with.
    InvalidArgument(&'static str),
    /// A response APDU is too short to carry a status word.
    InvalidResponseError(),
    /// The Send Sequence Counter can not be incremented any further.
    OverflowSscError(),
    /// Hashing the key information failed.
    CalculateHashError(&'static str),
    /// Decrypted data does not end in ISO/IEC 9797-1 padding method 2.
    UnpadError(cipher::block_padding::UnpadError),
    /// An integer did not fit the target type.
    IntCastError(TryFromIntError),
    /// PC/SC error not tied to the contactless link.
    PcscError(pcsc::Error),
    /// Serializing the record to JSON failed.
    JsonError(serde_json::Error),
}

/// Coarse classification of a [`PassportError`], used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AppletNotFound,
    AuthenticationFailed,
    SecureMessagingError,
    FileReadError,
    MrzCheckDigitMismatch,
    ChannelLost,
    Cancelled,
    /// The card answered with data that does not parse.
    Malformed,
    /// The caller supplied unusable input. Data read from the chip is never
    /// classified here.
    InvalidInput,
    /// A local failure unrelated to the card.
    Internal,
}

impl PassportError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match *self {
            Self::AppletNotFound(..) => ErrorKind::AppletNotFound,
            Self::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            Self::SecureMessagingError(_) | Self::OverflowSscError() => {
                ErrorKind::SecureMessagingError
            }
            Self::FileReadError(..) => ErrorKind::FileReadError,
            Self::MrzCheckDigitMismatch(_) => ErrorKind::MrzCheckDigitMismatch,
            Self::ChannelLost(_) => ErrorKind::ChannelLost,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ParseAsn1DataError(..)
            | Self::ParseAsn1TagError(..)
            | Self::InvalidFileStructure(_)
            | Self::InvalidResponseError()
            | Self::UnpadError(_) => ErrorKind::Malformed,
            Self::ParseMrzCharError(_) | Self::ParseMrzFieldError(..) => ErrorKind::InvalidInput,
            Self::InvalidArgument(_)
            | Self::CalculateHashError(_)
            | Self::IntCastError(_)
            | Self::PcscError(_)
            | Self::JsonError(_) => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for PassportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::AppletNotFound(sw1, sw2) => write!(
                f,
                "eMRTD application not found, SELECT returned: {sw1:02X} {sw2:02X}"
            ),
            Self::AuthenticationFailed(reason) => {
                write!(f, "Basic Access Control failed: {reason}")
            }
            Self::SecureMessagingError(ref reason) => {
                write!(f, "Secure messaging failure: {reason}")
            }
            Self::FileReadError(file, sw1, sw2) => write!(
                f,
                "Reading {file} failed with status code: {sw1:02X} {sw2:02X}"
            ),
            Self::MrzCheckDigitMismatch(ref mismatch) => fmt::Display::fmt(mismatch, f),
            Self::ChannelLost(ref reason) => write!(f, "Card channel lost: {reason}"),
            Self::Cancelled => write!(f, "Passport read was cancelled"),
            Self::ParseMrzCharError(c) => {
                write!(f, "MRZ can not contain the character: {c}")
            }
            Self::ParseMrzFieldError(mrz_field, ref value) => {
                write!(f, "MRZ field {mrz_field} is invalid: {value}")
            }
            Self::ParseAsn1DataError(e_len, f_len) => write!(
                f,
                "ASN.1 data is incomplete, expected len: {e_len}, found len: {f_len}"
            ),
            Self::ParseAsn1TagError(ref expected, ref found) => {
                write!(f, "Invalid ASN.1 tag, expected: {expected}, found: {found}")
            }
            Self::InvalidFileStructure(error_msg) => {
                write!(f, "Invalid EF structure: {error_msg}")
            }
            Self::InvalidArgument(error_msg) => write!(f, "Invalid argument: {error_msg}"),
            Self::InvalidResponseError() => write!(f, "Card response is invalid"),
            Self::OverflowSscError() => write!(f, "SSC overflew error"),
            Self::CalculateHashError(error_msg) => {
                write!(f, "Failure during calculation of hashes: {error_msg}")
            }
            Self::UnpadError(ref e) => fmt::Display::fmt(e, f),
            Self::IntCastError(ref e) => fmt::Display::fmt(e, f),
            Self::PcscError(ref e) => fmt::Display::fmt(e, f),
            Self::JsonError(ref e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for PassportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Self::IntCastError(ref e) => Some(e),
            Self::PcscError(ref e) => Some(e),
            Self::JsonError(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<CheckDigitMismatch> for PassportError {
    fn from(mismatch: CheckDigitMismatch) -> Self {
        Self::MrzCheckDigitMismatch(mismatch)
    }
}
