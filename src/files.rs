//! Elementary files of the LDS1 application and how to read them over secure messaging.

use core::fmt;

use tracing::{error, info, trace};

use crate::apdu::{APDU, SW_SUCCESS};
use crate::asn1::len2int;
use crate::secure_messaging::SecureChannel;
use crate::{CardChannel, PassportError};

/// Largest chunk requested by a single READ BINARY unless configured otherwise.
pub const DEFAULT_READ_CHUNK: usize = 112;

/// Highest offset a READ BINARY with offset in P1/P2 can address.
const MAX_OFFSET: usize = 0x7FFF;

/// The elementary files this crate reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileId {
    /// EF.COM: LDS version and the list of present data groups.
    Com,
    /// EF.DG1: the MRZ.
    Dg1,
    /// EF.DG15: the Active Authentication public key.
    Dg15,
}

impl FileId {
    /// File identifier used by SELECT.
    #[must_use]
    pub const fn fid(self) -> [u8; 2] {
        match self {
            Self::Com => [0x01, 0x1E],
            Self::Dg1 => [0x01, 0x01],
            Self::Dg15 => [0x01, 0x0F],
        }
    }

    /// Short EF identifier.
    #[must_use]
    pub const fn sfi(self) -> u8 {
        match self {
            Self::Com => 0x1E,
            Self::Dg1 => 0x01,
            Self::Dg15 => 0x0F,
        }
    }

    /// Outer tag of the file content.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Com => 0x60,
            Self::Dg1 => 0x61,
            Self::Dg15 => 0x6F,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Com => "EF.COM",
            Self::Dg1 => "EF.DG1",
            Self::Dg15 => "EF.DG15",
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Selects an elementary file by its file identifier.
///
/// # Errors
///
/// * `PassportError::FileReadError` if the chip does not answer `90 00`.
/// * `PassportError` from the secure channel.
pub fn select_ef<C: CardChannel + ?Sized>(
    channel: &mut SecureChannel<'_, C>,
    file: FileId,
) -> Result<(), PassportError> {
    trace!("Selecting {file}...");
    let apdu = APDU::new(0x00, 0xA4, 0x02, 0x0C, Some(file.fid().to_vec()), None)?;
    match channel.send(&apdu)? {
        (_, SW_SUCCESS) => Ok(()),
        (_, [sw1, sw2]) => {
            error!("Received invalid SW during selecting {file}: {sw1:02X} {sw2:02X}");
            Err(PassportError::FileReadError(file, sw1, sw2))
        }
    }
}

fn read_binary<C: CardChannel + ?Sized>(
    channel: &mut SecureChannel<'_, C>,
    file: FileId,
    offset: usize,
    le: u8,
) -> Result<Vec<u8>, PassportError> {
    if offset > MAX_OFFSET {
        error!("Offset {offset} of {file} is beyond what READ BINARY can address");
        return Err(PassportError::InvalidFileStructure(
            "file is longer than READ BINARY can address",
        ));
    }
    let [_, _, p1, p2] = u32::try_from(offset)
        .map_err(PassportError::IntCastError)?
        .to_be_bytes();
    let apdu = APDU::new(0x00, 0xB0, p1, p2, None, Some(le))?;
    match channel.send(&apdu)? {
        (data, SW_SUCCESS) => Ok(data),
        (_, [sw1, sw2]) => {
            error!("Received invalid SW during reading {file} at offset {offset}: {sw1:02X} {sw2:02X}");
            Err(PassportError::FileReadError(file, sw1, sw2))
        }
    }
}

/// Reads the currently selected file completely.
///
/// The first four bytes are read to learn the total length from the outer TLV, then the
/// rest follows in chunks of at most `chunk_size` bytes.
///
/// # Errors
///
/// * `PassportError::FileReadError` if a READ BINARY does not answer `90 00`.
/// * `PassportError::InvalidResponseError` if the chip returns fewer or more bytes
///   than the file holds.
/// * `PassportError::InvalidArgument` if `chunk_size` is not within 1 to 255.
pub fn read_ef<C: CardChannel + ?Sized>(
    channel: &mut SecureChannel<'_, C>,
    file: FileId,
    chunk_size: usize,
) -> Result<Vec<u8>, PassportError> {
    if !(1..=0xFF).contains(&chunk_size) {
        error!("READ BINARY chunk size must be 1 to 255, found {chunk_size}");
        return Err(PassportError::InvalidArgument(
            "READ BINARY chunk size must be 1 to 255",
        ));
    }

    trace!("Reading first 4 bytes from {file}...");
    let mut data = read_binary(channel, file, 0, 4)?;
    if data.len() != 4 {
        error!(
            "Card response length should be equal to the requested amount 4, found {}",
            data.len()
        );
        return Err(PassportError::InvalidResponseError());
    }

    let (tl, v) = len2int(&data, 1)?;
    let data_len = tl
        .checked_add(v)
        .ok_or(PassportError::InvalidFileStructure("file length overflows"))?;

    trace!("Reading {data_len} bytes from {file}...");
    let mut offset = data.len();
    while offset < data_len {
        let le = u8::try_from((data_len - offset).min(chunk_size))
            .map_err(PassportError::IntCastError)?;
        let chunk = read_binary(channel, file, offset, le)?;
        if chunk.is_empty() {
            error!("Requested bytes while reading {file} but received 0 bytes.");
            return Err(PassportError::InvalidResponseError());
        }
        data.extend_from_slice(&chunk);
        offset += chunk.len();
    }
    if data.len() != data_len {
        error!(
            "{file} should be {data_len} bytes long, received {}",
            data.len()
        );
        return Err(PassportError::InvalidResponseError());
    }

    Ok(data)
}

/// Selects `file` and reads it completely.
///
/// # Errors
///
/// See [`select_ef`] and [`read_ef`].
pub fn read_file<C: CardChannel + ?Sized>(
    channel: &mut SecureChannel<'_, C>,
    file: FileId,
    chunk_size: usize,
) -> Result<Vec<u8>, PassportError> {
    select_ef(channel, file)?;
    let data = read_ef(channel, file, chunk_size)?;
    info!("Read {} bytes from {file}", data.len());
    Ok(data)
}
