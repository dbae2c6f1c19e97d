//! A library that reads an ePassport over Basic Access Control.
//!
//! The `passport_reader` crate talks to an ICAO 9303 eMRTD chip through any
//! [`CardChannel`], unlocks it with Basic Access Control (BAC), and reads EF.COM, EF.DG1
//! (the MRZ) and EF.DG15 (the Active Authentication public key) over 3DES secure
//! messaging into a [`PassportRecord`].
//!
//! **NOTE:**
//! Please note that this crate is provided 'as is' and is not considered production-ready. Use at your own risk.
//!
//! Passive Authentication, Active Authentication, PACE, EAC and AES secure messaging
//! are **not** supported. The public key from EF.DG15 is returned unverified.
//!
//! # Quick Start
//!
//! ```no_run
//! use passport_reader::{PassportReader, PcscChannel, ReadFailure, ReaderConfig, TimeoutChannel};
//! use tracing::{error, info};
//!
//! fn main() -> Result<(), ReadFailure> {
//!     tracing_subscriber::fmt()
//!         .with_max_level(tracing::Level::TRACE)
//!         .init();
//!
//!     let doc_no = "DOCUMENT NUMBER";
//!     let birthdate = "BIRTH DATE IN YYMMDD";
//!     let expirydate = "EXPIRY DATE IN YYMMDD";
//!
//!     // Establish a PC/SC context.
//!     let ctx = match pcsc::Context::establish(pcsc::Scope::User) {
//!         Ok(ctx) => ctx,
//!         Err(err) => {
//!             error!("Failed to establish context: {err}");
//!             return Ok(());
//!         }
//!     };
//!
//!     // Use the first reader.
//!     let mut readers_buf = [0; 2048];
//!     let reader = match ctx.list_readers(&mut readers_buf).map(|mut r| r.next()) {
//!         Ok(Some(reader)) => reader,
//!         _ => {
//!             error!("No readers are connected.");
//!             return Ok(());
//!         }
//!     };
//!
//!     // Connect to the card.
//!     let card = match ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY) {
//!         Ok(card) => card,
//!         Err(err) => {
//!             error!("Failed to connect to card: {err}");
//!             return Ok(());
//!         }
//!     };
//!
//!     let config = ReaderConfig::default();
//!     let channel = TimeoutChannel::spawn(PcscChannel::new(card), config.exchange_timeout);
//!     let record = PassportReader::new(channel)
//!         .with_config(config)
//!         .read(doc_no, birthdate, expirydate)?;
//!     info!("Read passport of {} {}", record.first_name, record.last_name);
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

use std::fmt::Write;

mod apdu;
mod asn1;
mod bac;
mod channel;
mod crypto;
mod error;
mod files;
mod keys;
mod lds;
mod mrz;
mod reader;
mod record;
mod secure_messaging;
#[cfg(test)]
mod testing;

pub use apdu::{APDU, SW_SM_OBJECTS_INCORRECT, SW_SM_OBJECTS_MISSING, SW_SUCCESS};
pub use bac::{establish_session, select_emrtd_application, EMRTD_AID};
pub use channel::{CancelToken, CardChannel, PcscChannel, TimeoutChannel, DEFAULT_EXCHANGE_TIMEOUT};
pub use error::{ErrorKind, PassportError};
pub use files::{read_ef, read_file, select_ef, FileId, DEFAULT_READ_CHUNK};
pub use keys::{BacKeys, Credentials};
pub use lds::{parse_dg1, parse_dg15, ComFile};
pub use mrz::{date_triplet, CheckDigitMismatch, MrzFormat, MrzInfo, Sex};
pub use reader::{read_passport, PassportReader, ReadFailure, ReadState, ReaderConfig};
pub use record::PassportRecord;
pub use secure_messaging::{SecureChannel, SecureSession};

/// Helper function that converts a byte slice into a hex string.
///
/// # Example
///
/// ```
/// use passport_reader::bytes2hex;
/// let bytes = vec![0xDE, 0xAD, 0xBE, 0xEF];
/// let hex_string = bytes2hex(&bytes);
/// assert_eq!(hex_string, "DEADBEEF");
/// ```
#[must_use]
pub fn bytes2hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut acc, &byte| {
        // writing to a String does not fail
        let _ = write!(&mut acc, "{byte:02X}");
        acc
    })
}
