//! Derivation of the Basic Access Control keys from the printed MRZ data.

use core::fmt;

use tracing::{error, trace};

use crate::crypto::{compute_key, generate_key_seed, KeyType};
use crate::mrz::{calculate_check_digit, MRZ_ALPHABET};
use crate::PassportError;

/// Width of the document number field in a TD3 MRZ.
const DOCUMENT_NUMBER_FIELD_LEN: usize = 9;

/// The three MRZ fields a reader needs to unlock the chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    document_number: String,
    date_of_birth: String,
    date_of_expiry: String,
}

impl Credentials {
    /// Validates and normalizes the credentials.
    ///
    /// Whitespace is removed and letters are uppercased. A document number shorter than
    /// the nine character MRZ field is right-padded with `<`, the way it is printed.
    ///
    /// # Errors
    ///
    /// * `PassportError::ParseMrzFieldError` if a field has the wrong length or contains
    ///   characters outside the MRZ alphabet.
    ///
    /// # Example
    ///
    /// ```
    /// # use passport_reader::PassportError;
    /// #
    /// # fn main() -> Result<(), PassportError> {
    /// use passport_reader::Credentials;
    /// let credentials = Credentials::new("L898902C", "690806", "940623")?;
    /// assert_eq!(credentials.document_number(), "L898902C<");
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn new(
        document_number: &str,
        date_of_birth: &str,
        date_of_expiry: &str,
    ) -> Result<Self, PassportError> {
        let mut document_number = clean(document_number);
        let date_of_birth = clean(date_of_birth);
        let date_of_expiry = clean(date_of_expiry);

        // Document number can be up to 9 characters on TD3 sized eMRTDs (https://www.icao.int/publications/Documents/9303_p4_cons_en.pdf Appendix B)
        // Document number can be up to 22 characters on TD1 sized eMRTDs (https://www.icao.int/publications/Documents/9303_p5_cons_en.pdf 4.2.2)
        if document_number.is_empty()
            || document_number.len() > 22
            || document_number.chars().any(|c| !MRZ_ALPHABET.contains(c))
        {
            error!("Document number length must be 1 to 22 and should not contain illegal characters, received {document_number}");
            return Err(PassportError::ParseMrzFieldError(
                "Document number",
                document_number,
            ));
        }
        for (name, date) in [("Birth date", &date_of_birth), ("Expiry date", &date_of_expiry)] {
            if date.len() != 6 || !date.chars().all(|c| c.is_ascii_digit()) {
                error!("{name} must be 6 digits in YYMMDD format, received {date}");
                return Err(PassportError::ParseMrzFieldError(name, date.clone()));
            }
        }

        while document_number.len() < DOCUMENT_NUMBER_FIELD_LEN {
            document_number.push('<');
        }

        Ok(Self {
            document_number,
            date_of_birth,
            date_of_expiry,
        })
    }

    /// Document number, upper case and padded with `<` to at least nine characters.
    #[must_use]
    pub fn document_number(&self) -> &str {
        &self.document_number
    }

    /// Date of birth as `YYMMDD`.
    #[must_use]
    pub fn date_of_birth(&self) -> &str {
        &self.date_of_birth
    }

    /// Date of expiry as `YYMMDD`.
    #[must_use]
    pub fn date_of_expiry(&self) -> &str {
        &self.date_of_expiry
    }

    /// Builds the MRZ key information: every field followed by its check digit.
    ///
    /// # Errors
    ///
    /// Never for credentials built through [`Credentials::new`].
    ///
    /// # Example
    ///
    /// ```
    /// # use passport_reader::PassportError;
    /// #
    /// # fn main() -> Result<(), PassportError> {
    /// use passport_reader::Credentials;
    /// let credentials = Credentials::new("L898902C3", "740812", "120415")?;
    /// assert_eq!(credentials.key_info()?, "L898902C3674081221204159");
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn key_info(&self) -> Result<String, PassportError> {
        Ok(format!(
            "{}{}{}{}{}{}",
            self.document_number,
            calculate_check_digit(&self.document_number)?,
            self.date_of_birth,
            calculate_check_digit(&self.date_of_birth)?,
            self.date_of_expiry,
            calculate_check_digit(&self.date_of_expiry)?
        ))
    }
}

fn clean(field: &str) -> String {
    field
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// The document basic access keys `K_enc` and `K_mac` (2-key 3DES).
#[derive(Clone, PartialEq, Eq)]
pub struct BacKeys {
    pub(crate) k_enc: [u8; 16],
    pub(crate) k_mac: [u8; 16],
}

impl BacKeys {
    /// Derives the keys from the MRZ key information.
    ///
    /// See ICAO Doc 9303-11 Section 9.7.1 and Appendix D.1.
    ///
    /// # Errors
    ///
    /// `PassportError` if SHA-1 reports a collision attack.
    pub fn derive(credentials: &Credentials) -> Result<Self, PassportError> {
        let key_info = credentials.key_info()?;
        trace!("Computing basic access keys...");
        let key_seed = generate_key_seed(key_info.as_bytes())?;
        Self::from_seed(&key_seed)
    }

    /// Derives `K_enc` (counter 1) and `K_mac` (counter 2) from a 16 byte key seed.
    pub(crate) fn from_seed(key_seed: &[u8]) -> Result<Self, PassportError> {
        Ok(Self {
            k_enc: compute_key(key_seed, KeyType::Encryption)?,
            k_mac: compute_key(key_seed, KeyType::Mac)?,
        })
    }

    #[must_use]
    pub const fn k_enc(&self) -> &[u8; 16] {
        &self.k_enc
    }

    #[must_use]
    pub const fn k_mac(&self) -> &[u8; 16] {
        &self.k_mac
    }
}

impl fmt::Debug for BacKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BacKeys").finish_non_exhaustive()
    }
}
