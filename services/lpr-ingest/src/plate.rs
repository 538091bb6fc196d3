//! Numeric plate encoding.
//!
//! Plates arrive as `NN<letter>NNNNN` where the letter is one token of the
//! plate alphabet. The token is replaced in place by its two-digit code and
//! the result parsed as an integer, giving a stable numeric key for search.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlateError {
    #[error("plate {plate:?} transliterates to non-numeric {encoded:?}")]
    NonNumeric { plate: String, encoded: String },

    #[error("plate is empty")]
    Empty,
}

/// Plate alphabet. Multi-character tokens must precede any single letter
/// they contain.
const PLATE_ALPHABET: &[(&str, &str)] = &[
    ("الف", "01"),
    ("ب", "02"),
    ("پ", "03"),
    ("ت", "04"),
    ("ث", "05"),
    ("ج", "06"),
    ("چ", "07"),
    ("ح", "08"),
    ("خ", "09"),
    ("د", "10"),
    ("ذ", "11"),
    ("ر", "12"),
    ("ز", "13"),
    ("ژ", "14"),
    ("س", "15"),
    ("ش", "16"),
    ("ص", "17"),
    ("ض", "18"),
    ("ط", "19"),
    ("ظ", "20"),
    ("ع", "21"),
    ("غ", "22"),
    ("ف", "23"),
    ("ق", "24"),
    ("ک", "25"),
    ("گ", "26"),
    ("ل", "27"),
    ("م", "28"),
    ("ن", "29"),
    ("و", "30"),
    ("ه", "31"),
    ("ی", "32"),
    ("D", "33"),
    ("S", "34"),
];

/// Replace the plate's alphabet token with its two-digit code.
///
/// Only the first token found is replaced; Arabic kaf/yeh are folded to
/// their Persian forms first.
pub fn transliterate(plate: &str) -> String {
    let normalized: String = plate
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            'ك' => 'ک',
            'ي' => 'ی',
            other => other,
        })
        .collect();

    for (token, code) in PLATE_ALPHABET {
        if normalized.contains(token) {
            return normalized.replacen(token, code, 1);
        }
    }

    normalized
}

/// Numeric encoding of a plate string.
pub fn encode_plate(plate: &str) -> Result<i64, PlateError> {
    let encoded = transliterate(plate);
    if encoded.is_empty() {
        return Err(PlateError::Empty);
    }

    if !encoded.chars().all(|c| c.is_ascii_digit()) {
        return Err(PlateError::NonNumeric {
            plate: plate.to_string(),
            encoded,
        });
    }

    encoded.parse::<i64>().map_err(|_| PlateError::NonNumeric {
        plate: plate.to_string(),
        encoded,
    })
}
