//! Minimal BER-TLV handling for LDS files and secure messaging data objects.

use core::mem;

use tracing::error;

use crate::{bytes2hex, PassportError};

/// Parses the BER length field that follows a tag of `tag_len` bytes.
///
/// Returns the offset of the value and the length of the value. For example, if
/// `tag_len` is 1 and the length field is `82 07 E8`, the returned value is `(4, 2024)`.
///
/// # Errors
///
/// * `PassportError` if the data is too short to read the length value.
pub(crate) fn len2int(data: &[u8], tag_len: usize) -> Result<(usize, usize), PassportError> {
    let Some(&first) = data.get(tag_len) else {
        error!(
            "Error during len2int, `data.len()`: `{}` is less than `tag_len + 1`: `{}`",
            data.len(),
            tag_len + 1
        );
        return Err(PassportError::ParseAsn1DataError(tag_len + 1, data.len()));
    };

    if first & 0x80 == 0 {
        return Ok((tag_len + 1, usize::from(first)));
    }

    let length_of_length = usize::from(first & 0x7F);
    if length_of_length == 0 || length_of_length > mem::size_of::<usize>() {
        error!("Unsupported BER length of length: {length_of_length}");
        return Err(PassportError::InvalidFileStructure(
            "Unsupported BER length encoding",
        ));
    }
    if data.len() < tag_len + 1 + length_of_length {
        error!(
            "Error during len2int, `data.len()`: `{}` is less than `tag_len + 1 + length_of_length`: `{}`",
            data.len(),
            tag_len + 1 + length_of_length
        );
        return Err(PassportError::ParseAsn1DataError(
            tag_len + 1 + length_of_length,
            data.len(),
        ));
    }

    let mut buf = [0_u8; mem::size_of::<usize>()];
    buf[mem::size_of::<usize>() - length_of_length..]
        .copy_from_slice(&data[tag_len + 1..tag_len + 1 + length_of_length]);

    Ok((tag_len + 1 + length_of_length, usize::from_be_bytes(buf)))
}

/// Encodes a length in BER definite form.
#[must_use]
pub(crate) fn int2asn1len(length: usize) -> Vec<u8> {
    let be = length.to_be_bytes();
    let skip = be.iter().take_while(|&&b| b == 0).count();
    let significant = &be[skip..];
    match significant {
        [] => vec![0],
        [b] if *b < 0x80 => vec![*b],
        _ => {
            // at most size_of::<usize>() bytes, always fits the low 7 bits
            let mut out = vec![0x80 | significant.len() as u8];
            out.extend_from_slice(significant);
            out
        }
    }
}

/// Checks that `data` begins with `tag`.
///
/// # Errors
///
/// * `PassportError` if the data is incomplete or the tags don't match.
pub(crate) fn validate_asn1_tag(data: &[u8], tag: &[u8]) -> Result<(), PassportError> {
    let Some(found) = data.get(..tag.len()) else {
        error!(
            "Error while validating ASN1 tag, `data.len()`: `{}` is less than `tag.len()`: `{}`",
            data.len(),
            tag.len()
        );
        return Err(PassportError::ParseAsn1DataError(tag.len(), data.len()));
    };
    if found != tag {
        error!(
            "Error while validating ASN1 tag, expected: {}, found {}",
            bytes2hex(tag),
            bytes2hex(found)
        );
        return Err(PassportError::ParseAsn1TagError(
            bytes2hex(tag),
            bytes2hex(found),
        ));
    }
    Ok(())
}

/// Splits the first TLV off `data`.
///
/// Returns the value of the first element and whatever follows it.
///
/// # Errors
///
/// * `PassportError` if the data is incomplete.
pub(crate) fn get_asn1_child(data: &[u8], tag_len: usize) -> Result<(&[u8], &[u8]), PassportError> {
    let (tl, v) = len2int(data, tag_len)?;
    let end = tl.checked_add(v).ok_or(PassportError::ParseAsn1DataError(usize::MAX, data.len()))?;
    if data.len() < end {
        error!(
            "Error during get_asn1_child, `data.len()`: `{}` is less than `tl + v`: `{}`",
            data.len(),
            end
        );
        return Err(PassportError::ParseAsn1DataError(end, data.len()));
    }
    Ok((&data[tl..end], &data[end..]))
}

/// Like [`get_asn1_child`], but also returns the complete encoding of the first element.
pub(crate) fn split_tlv(data: &[u8], tag_len: usize) -> Result<(&[u8], &[u8], &[u8]), PassportError> {
    let (value, rest) = get_asn1_child(data, tag_len)?;
    let whole = &data[..data.len() - rest.len()];
    Ok((whole, value, rest))
}
