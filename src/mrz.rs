//! Machine Readable Zone decoding.
//!
//! Field positions follow ICAO Doc 9303 Parts 4 (TD3), 5 (TD1) and 6 (TD2):
//!
//! ```plain
//! TD3  PPSSSNNNNNNNNNNNNNNNNNNNNNNNNNNNNNNNNNNNNNNN
//!      DDDDDDDDDCAAABBBBBBbXEEEEEEeOOOOOOOOOOOOOOoG
//!
//! TD2  PPSSSNNNNNNNNNNNNNNNNNNNNNNNNNNNNNNN
//!      DDDDDDDDDCAAABBBBBBbXEEEEEEeOOOOOOOG
//!
//! TD1  PPSSSDDDDDDDDDCOOOOOOOOOOOOOOO
//!      BBBBBBbXEEEEEEeAAAOOOOOOOOOOOG
//!      NNNNNNNNNNNNNNNNNNNNNNNNNNNNNN
//! ```
//!
//! `P` document code, `S` issuing state, `N` name, `D` document number and `C` its check
//! digit, `A` nationality, `B`/`b` date of birth and check digit, `X` sex, `E`/`e` date
//! of expiry and check digit, `O`/`o` optional data and check digit, `G` composite check
//! digit.

use core::fmt;

use tracing::error;

use crate::PassportError;

/// Characters allowed in an MRZ.
pub(crate) const MRZ_ALPHABET: &str = "0123456789<ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Calculates the check digit of an MRZ field.
///
/// Calculation is explained at ICAO Doc 9303-3 Section 4.9:
/// <https://www.icao.int/publications/Documents/9303_p3_cons_en.pdf>
///
/// # Errors
///
/// * `PassportError::ParseMrzCharError` if an invalid character is given.
pub(crate) fn calculate_check_digit(data: &str) -> Result<char, PassportError> {
    const WEIGHTS: [u32; 3] = [7, 3, 1];

    let mut total = 0;
    for (counter, c) in data.chars().enumerate() {
        let value = match c {
            '0'..='9' => u32::from(c) - u32::from('0'),
            'A'..='Z' => u32::from(c) - u32::from('A') + 10,
            '<' => 0,
            _ => {
                error!("Can not calculate check digit for invalid character: `{c}`");
                return Err(PassportError::ParseMrzCharError(c));
            }
        };
        total += WEIGHTS[counter % 3] * value;
    }

    // total % 10 is a single decimal digit
    Ok(char::from(b'0' + (total % 10) as u8))
}

/// Size class of the document the MRZ was printed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MrzFormat {
    /// Three lines of 30 characters (ID cards).
    Td1,
    /// Two lines of 36 characters.
    Td2,
    /// Two lines of 44 characters (passport books).
    Td3,
}

impl MrzFormat {
    fn from_len(len: usize) -> Option<Self> {
        match len {
            90 => Some(Self::Td1),
            72 => Some(Self::Td2),
            88 => Some(Self::Td3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sex {
    Male,
    Female,
    Unspecified,
}

impl Sex {
    fn from_mrz(c: char) -> Self {
        match c {
            'M' => Self::Male,
            'F' => Self::Female,
            _ => Self::Unspecified,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Male => "MALE",
            Self::Female => "FEMALE",
            Self::Unspecified => "UNSPECIFIED",
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An MRZ check digit that disagrees with the field it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckDigitMismatch {
    pub field: &'static str,
    /// Check digit computed over the field as read.
    pub expected: char,
    /// Check digit printed in the MRZ.
    pub found: char,
}

impl fmt::Display for CheckDigitMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MRZ check digit mismatch for {}: computed {}, found {}",
            self.field, self.expected, self.found
        )
    }
}

/// Fields decoded from an MRZ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MrzInfo {
    pub format: MrzFormat,
    pub document_code: String,
    pub issuing_state: String,
    pub document_number: String,
    /// Surname(s).
    pub primary_identifier: String,
    /// Given name(s).
    pub secondary_identifier: String,
    pub nationality: String,
    pub sex: Sex,
    /// `YYMMDD`
    pub date_of_birth: String,
    /// `YYMMDD`
    pub date_of_expiry: String,
    pub optional_data: String,
    /// Every check digit that failed, in MRZ order. Fields are kept as read.
    pub mismatches: Vec<CheckDigitMismatch>,
}

impl MrzInfo {
    /// Parses an MRZ given as one string without line breaks.
    ///
    /// Check digit failures do not make parsing fail; they are collected in
    /// [`MrzInfo::mismatches`] and reported by [`MrzInfo::verify`].
    ///
    /// # Errors
    ///
    /// * `PassportError::InvalidFileStructure` if the length matches no MRZ format.
    /// * `PassportError::ParseMrzCharError` if a character is outside the MRZ alphabet.
    pub fn parse(mrz: &str) -> Result<Self, PassportError> {
        let Some(format) = MrzFormat::from_len(mrz.len()) else {
            error!("MRZ length {} matches no TD1, TD2 or TD3 layout", mrz.len());
            return Err(PassportError::InvalidFileStructure(
                "MRZ must be 90 (TD1), 72 (TD2) or 88 (TD3) characters",
            ));
        };
        if let Some(c) = mrz.chars().find(|&c| !MRZ_ALPHABET.contains(c)) {
            error!("MRZ contains the invalid character: `{c}`");
            return Err(PassportError::ParseMrzCharError(c));
        }

        let mut parser = Parser {
            mrz,
            mismatches: Vec::new(),
        };
        let info = match format {
            MrzFormat::Td1 => parser.td1()?,
            MrzFormat::Td2 => parser.two_line(format, 36)?,
            MrzFormat::Td3 => parser.two_line(format, 44)?,
        };
        Ok(Self {
            mismatches: parser.mismatches,
            ..info
        })
    }

    /// Reports the first check digit mismatch, if any.
    ///
    /// # Errors
    ///
    /// `PassportError::MrzCheckDigitMismatch` for the first failed check digit.
    pub fn verify(&self) -> Result<(), PassportError> {
        match self.mismatches.first() {
            Some(mismatch) => Err(PassportError::MrzCheckDigitMismatch(mismatch.clone())),
            None => Ok(()),
        }
    }
}

/// Splits `YYMMDD` into `[YY, MM, DD]`.
///
/// # Errors
///
/// `PassportError::InvalidFileStructure` if the date is not six digits.
pub fn date_triplet(date: &str) -> Result<[u8; 3], PassportError> {
    let digits = date.as_bytes();
    if digits.len() != 6 || !digits.iter().all(u8::is_ascii_digit) {
        error!("MRZ date `{date}` is not in YYMMDD format");
        return Err(PassportError::InvalidFileStructure(
            "MRZ date is not in YYMMDD format",
        ));
    }
    let pair = |i: usize| (digits[i] - b'0') * 10 + (digits[i + 1] - b'0');
    Ok([pair(0), pair(2), pair(4)])
}

struct Parser<'a> {
    mrz: &'a str,
    mismatches: Vec<CheckDigitMismatch>,
}

impl<'a> Parser<'a> {
    fn at(&self, start: usize, end: usize) -> &'a str {
        &self.mrz[start..end]
    }

    fn char_at(&self, i: usize) -> char {
        char::from(self.mrz.as_bytes()[i])
    }

    fn check(&mut self, field: &'static str, data: &str, found: char) -> Result<(), PassportError> {
        let expected = calculate_check_digit(data)?;
        // An unused optional data field may carry a filler instead of '0'.
        let filler_ok = found == '<' && expected == '0' && data.chars().all(|c| c == '<');
        if expected != found && !filler_ok {
            self.mismatches.push(CheckDigitMismatch {
                field,
                expected,
                found,
            });
        }
        Ok(())
    }

    /// Document number with its check digit, following the long number extension into
    /// the optional data when the check digit position holds a filler.
    fn document_number(
        &mut self,
        number: &str,
        check: char,
        optional: &str,
    ) -> Result<(String, String), PassportError> {
        if check != '<' {
            self.check("document number", number, check)?;
            return Ok((trim_filler(number), optional.to_owned()));
        }
        let extension_len = optional.find('<').unwrap_or(optional.len());
        if extension_len == 0 {
            error!("Document number extension is empty");
            return Err(PassportError::InvalidFileStructure(
                "Document number extension is empty",
            ));
        }
        let (extension, rest) = optional.split_at(extension_len);
        let (digits, long_check) = extension.split_at(extension.len() - 1);
        let full = format!("{number}{digits}");
        self.check("document number", &full, long_check.chars().next().unwrap_or('<'))?;
        Ok((full, rest.to_owned()))
    }

    fn two_line(&mut self, format: MrzFormat, width: usize) -> Result<MrzInfo, PassportError> {
        let line1 = self.at(0, width);
        let line2 = self.at(width, 2 * width);
        let l2 = width;

        let optional_end = if format == MrzFormat::Td3 { 42 } else { width - 1 };
        let (document_number, optional_data) = self.document_number(
            &line2[..9],
            self.char_at(l2 + 9),
            &line2[28..optional_end],
        )?;
        self.check("date of birth", &line2[13..19], self.char_at(l2 + 19))?;
        self.check("date of expiry", &line2[21..27], self.char_at(l2 + 27))?;
        if format == MrzFormat::Td3 {
            self.check("optional data", &line2[28..42], self.char_at(l2 + 42))?;
        }
        let composite = [&line2[..10], &line2[13..20], &line2[21..width - 1]].concat();
        self.check("composite", &composite, self.char_at(l2 + width - 1))?;

        let (primary_identifier, secondary_identifier) = split_name(&line1[5..]);
        Ok(MrzInfo {
            format,
            document_code: trim_filler(&line1[..2]),
            issuing_state: trim_filler(&line1[2..5]),
            document_number,
            primary_identifier,
            secondary_identifier,
            nationality: trim_filler(&line2[10..13]),
            sex: Sex::from_mrz(self.char_at(l2 + 20)),
            date_of_birth: line2[13..19].to_owned(),
            date_of_expiry: line2[21..27].to_owned(),
            optional_data: trim_filler(&optional_data),
            mismatches: Vec::new(),
        })
    }

    fn td1(&mut self) -> Result<MrzInfo, PassportError> {
        let line1 = self.at(0, 30);
        let line2 = self.at(30, 60);
        let line3 = self.at(60, 90);

        let (document_number, optional_data_1) =
            self.document_number(&line1[5..14], self.char_at(14), &line1[15..30])?;
        self.check("date of birth", &line2[..6], self.char_at(36))?;
        self.check("date of expiry", &line2[8..14], self.char_at(44))?;
        let composite = [&line1[5..30], &line2[..7], &line2[8..15], &line2[18..29]].concat();
        self.check("composite", &composite, self.char_at(59))?;

        let (primary_identifier, secondary_identifier) = split_name(line3);
        let optional_data = format!("{}{}", trim_filler(&optional_data_1), &line2[18..29]);
        Ok(MrzInfo {
            format: MrzFormat::Td1,
            document_code: trim_filler(&line1[..2]),
            issuing_state: trim_filler(&line1[2..5]),
            document_number,
            primary_identifier,
            secondary_identifier,
            nationality: trim_filler(&line2[15..18]),
            sex: Sex::from_mrz(self.char_at(37)),
            date_of_birth: line2[..6].to_owned(),
            date_of_expiry: line2[8..14].to_owned(),
            optional_data: trim_filler(&optional_data),
            mismatches: Vec::new(),
        })
    }
}

fn trim_filler(field: &str) -> String {
    field.trim_end_matches('<').to_owned()
}

/// Splits the name field into primary and secondary identifier, `<` becoming a space.
fn split_name(name: &str) -> (String, String) {
    let name = name.trim_end_matches('<');
    let (primary, secondary) = name.split_once("<<").unwrap_or((name, ""));
    let readable = |part: &str| {
        part.split('<')
            .filter(|word| !word.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    };
    (readable(primary), readable(secondary))
}
