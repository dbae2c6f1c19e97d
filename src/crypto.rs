//! Cryptographic primitives used by Basic Access Control and 3DES secure messaging.
//!
//! All algorithms are the ones named in ICAO Doc 9303-11 Section 9.8 and Appendix D:
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use sha1_checked::Sha1;
use tracing::error;

use crate::PassportError;

/// Block size of DES and 3DES in bytes.
pub(crate) const BLOCK_SIZE: usize = 8;

/// An all-zero IV, used for every 3DES-CBC operation of BAC and 3DES secure messaging.
pub(crate) const ZERO_IV: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

type TdesCbcEnc = cbc::Encryptor<des::TdesEde2>;
type TdesCbcDec = cbc::Decryptor<des::TdesEde2>;
type DesEcbEnc = ecb::Encryptor<des::Des>;
type DesEcbDec = ecb::Decryptor<des::Des>;

/// Which of the two keys derived from a key seed is wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyType {
    Encryption,
    Mac,
}

impl KeyType {
    const fn counter(self) -> [u8; 4] {
        match self {
            Self::Encryption => [0x00, 0x00, 0x00, 0x01],
            Self::Mac => [0x00, 0x00, 0x00, 0x02],
        }
    }
}

/// SHA-1 of `data`, refusing inputs that trigger the SHA-1 collision detector.
fn sha1(data: &[u8], context: &'static str) -> Result<[u8; 20], PassportError> {
    let hash_result = Sha1::try_digest(data);
    if hash_result.has_collision() {
        error!("SHA1 hash calculation during {context} had collision");
        return Err(PassportError::CalculateHashError(context));
    }
    let mut out = [0; 20];
    out.copy_from_slice(hash_result.hash().as_slice());
    Ok(out)
}

/// Generates the 16 byte key seed from the MRZ key information.
///
/// Calculation is explained at ICAO Doc 9303-11 Section 4.3.2.
///
/// # Errors
///
/// `PassportError` if SHA-1 reports a collision attack.
pub(crate) fn generate_key_seed(secret: &[u8]) -> Result<[u8; 16], PassportError> {
    let hash = sha1(secret, "generate_key_seed")?;
    let mut seed = [0; 16];
    seed.copy_from_slice(&hash[..16]);
    Ok(seed)
}

/// Computes a 2-key 3DES key from a key seed.
///
/// For calculation examples see ICAO Doc 9303-11 Appendix D.1.
///
/// # Errors
///
/// `PassportError` if SHA-1 reports a collision attack.
pub(crate) fn compute_key(key_seed: &[u8], key_type: KeyType) -> Result<[u8; 16], PassportError> {
    let d = [key_seed, &key_type.counter()[..]].concat();
    let hash = sha1(&d, "3DES compute_key")?;
    let mut key = [0; 16];
    key.copy_from_slice(&hash[..16]);
    des3_adjust_parity_bits(&mut key);
    Ok(key)
}

/// Sets the least significant bit of every key byte so that the byte has odd parity.
pub(crate) fn des3_adjust_parity_bits(key: &mut [u8]) {
    for byte in key {
        let mut bitmask = 1;
        let mut b = *byte;
        for _ in 0..8 {
            bitmask ^= b & 0x1;
            b >>= 1;
        }
        *byte ^= bitmask;
    }
}

/// Encrypts block-aligned `data` with 2-key 3DES in CBC mode.
///
/// # Errors
///
/// `PassportError` if the key, IV or data length is wrong.
pub(crate) fn tdes_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, PassportError> {
    check_lengths(key, 16, Some(iv), data, "3DES encryption")?;
    Ok(TdesCbcEnc::new(key.into(), iv.into())
        .encrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data))
}

/// Decrypts block-aligned `data` with 2-key 3DES in CBC mode.
///
/// # Errors
///
/// `PassportError` if the key, IV or data length is wrong.
pub(crate) fn tdes_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, PassportError> {
    check_lengths(key, 16, Some(iv), data, "3DES decryption")?;
    TdesCbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data)
        .map_err(PassportError::UnpadError)
}

fn des_ecb_encrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>, PassportError> {
    check_lengths(key, 8, None, data, "DES encryption")?;
    Ok(DesEcbEnc::new(key.into()).encrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data))
}

fn des_ecb_decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>, PassportError> {
    check_lengths(key, 8, None, data, "DES decryption")?;
    DesEcbDec::new(key.into())
        .decrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data)
        .map_err(PassportError::UnpadError)
}

fn check_lengths(
    key: &[u8],
    key_len: usize,
    iv: Option<&[u8]>,
    data: &[u8],
    operation: &'static str,
) -> Result<(), PassportError> {
    if key.len() != key_len {
        error!(
            "Wrong key size for {operation}, expected {key_len}, found {}",
            key.len()
        );
        return Err(PassportError::InvalidArgument("Wrong key size for cipher"));
    }
    if let Some(iv) = iv {
        if iv.len() != BLOCK_SIZE {
            error!(
                "Wrong IV size for {operation}, expected {BLOCK_SIZE}, found {}",
                iv.len()
            );
            return Err(PassportError::InvalidArgument("Wrong IV size for cipher"));
        }
    }
    if data.len() % BLOCK_SIZE != 0 {
        error!(
            "Wrong data size for {operation}, expected a multiple of {BLOCK_SIZE}, found {}",
            data.len()
        );
        return Err(PassportError::InvalidArgument("Wrong data size for cipher"));
    }
    Ok(())
}

/// Computes the ISO/IEC 9797-1 MAC algorithm 3 ("retail MAC") of already padded data.
///
/// Single DES CBC-MAC under the first key half, finished by a decrypt with the second
/// half and an encrypt with the first.
///
/// # Errors
///
/// `PassportError` if `key` is not 16 bytes or `data` is not block-aligned.
pub(crate) fn compute_mac(key: &[u8], data: &[u8]) -> Result<[u8; 8], PassportError> {
    if key.len() != 16 {
        error!("Can not compute MAC, MAC key is invalid.");
        return Err(PassportError::InvalidArgument("MAC key must be 16 bytes"));
    }
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        error!(
            "Can not compute MAC, data length {} is not a multiple of 8.",
            data.len()
        );
        return Err(PassportError::InvalidArgument(
            "MAC input must be a non-empty multiple of 8",
        ));
    }

    let (key1, key2) = key.split_at(8);

    let mut h = des_ecb_encrypt(key1, &data[..BLOCK_SIZE])?;
    for block in data[BLOCK_SIZE..].chunks(BLOCK_SIZE) {
        h = des_ecb_encrypt(key1, &xor_slices(&h, block)?)?;
    }
    let mac_x = des_ecb_encrypt(key1, &des_ecb_decrypt(key2, &h)?)?;

    let mut mac = [0; 8];
    mac.copy_from_slice(&mac_x);
    Ok(mac)
}

/// XORs two equally long byte slices.
///
/// # Errors
///
/// `PassportError` if `a` and `b` have different lengths.
pub(crate) fn xor_slices(a: &[u8], b: &[u8]) -> Result<Vec<u8>, PassportError> {
    if a.len() != b.len() {
        error!(
            "XORed slices must have the same length, found {}, {}",
            a.len(),
            b.len()
        );
        return Err(PassportError::InvalidArgument(
            "XORed slices must have the same length",
        ));
    }
    Ok(a.iter().zip(b).map(|(&x, &y)| x ^ y).collect())
}

/// Pads data using ISO/IEC 9797-1 padding method 2 to a multiple of the DES block size.
///
/// <https://en.wikipedia.org/wiki/ISO/IEC_9797-1#Padding_method_2>
#[must_use]
pub(crate) fn padding_method_2(data: &[u8]) -> Vec<u8> {
    let mut data = data.to_vec();
    data.push(0x80);
    while data.len() % BLOCK_SIZE != 0 {
        data.push(0x00);
    }
    data
}

/// Removes padding method 2 from decrypted data.
///
/// # Errors
///
/// `PassportError` if the data does not end in `80 00..00`.
pub(crate) fn remove_padding(data: &[u8]) -> Result<&[u8], PassportError> {
    let unpadded = data.iter().rposition(|&b| b != 0x00);
    match unpadded {
        Some(i) if data[i] == 0x80 && data.len() - i <= BLOCK_SIZE => Ok(&data[..i]),
        _ => {
            error!("Decrypted data does not end with padding method 2");
            Err(PassportError::InvalidResponseError())
        }
    }
}
