// 🧹 Normalization - Cell value typing for rule workbooks
//
// Blank is never zero and never false: numeric and boolean cells parse to
// Option so "absent" / "unspecified" stay distinct from a real value.

use rust_decimal::Decimal;
use std::str::FromStr;

// ============================================================================
// TEXT
// ============================================================================

/// Trim, turn embedded newlines into spaces and collapse whitespace runs
pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case-folded matching key for synonym tables.
///
/// "S-Corp", "s_corp" and "S  CORP" all fold to "S CORP"; periods are dropped
/// so "L.L.C." folds to "LLC".
pub fn fold_label(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .filter(|c| *c != '.')
        .map(|c| if c == '_' || c == '-' { ' ' } else { c })
        .collect();
    collapse_whitespace(&replaced).to_uppercase()
}

// ============================================================================
// NUMBERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NumberError {
    /// Parenthesized or minus-signed value
    Negative,
    NotANumber,
}

impl NumberError {
    pub fn describe(&self) -> &'static str {
        match self {
            NumberError::Negative => "negative values are not allowed",
            NumberError::NotANumber => "not a number",
        }
    }
}

/// Parse a rate or threshold cell.
///
/// Accepts thousands separators, surrounding whitespace, a leading `$` and a
/// trailing `%` (divided by 100). Blank parses to `Ok(None)`.
pub fn parse_decimal(raw: &str) -> Result<Option<Decimal>, NumberError> {
    let trimmed = collapse_whitespace(raw);
    if trimmed.is_empty() {
        return Ok(None);
    }

    if trimmed.starts_with('(') && trimmed.ends_with(')') {
        return Err(NumberError::Negative);
    }

    let (body, percent) = match trimmed.strip_suffix('%') {
        Some(rest) => (rest.trim_end(), true),
        None => (trimmed.as_str(), false),
    };
    let body = body.strip_prefix('$').unwrap_or(body).trim();

    if body.starts_with('-') {
        return Err(NumberError::Negative);
    }

    let digits: String = body.chars().filter(|c| *c != ',').collect();
    if digits.is_empty() || digits.contains(' ') {
        return Err(NumberError::NotANumber);
    }

    let value = Decimal::from_str(&digits).map_err(|_| NumberError::NotANumber)?;
    if value.is_sign_negative() && !value.is_zero() {
        return Err(NumberError::Negative);
    }

    let value = if percent {
        value / Decimal::ONE_HUNDRED
    } else {
        value
    };

    Ok(Some(value.normalize()))
}

// ============================================================================
// BOOLEANS
// ============================================================================

const AFFIRMATIVE: [&str; 8] = ["YES", "Y", "TRUE", "T", "1", "X", "MANDATORY", "REQUIRED"];
const NEGATIVE: [&str; 8] = ["NO", "N", "FALSE", "F", "0", "OPTIONAL", "NOT REQUIRED", "NONE"];

/// Parse a mandatory-filing cell. Blank = `Ok(None)` ("unspecified").
pub fn parse_flag(raw: &str) -> Result<Option<bool>, String> {
    let folded = fold_label(raw);
    if folded.is_empty() {
        return Ok(None);
    }
    if AFFIRMATIVE.contains(&folded.as_str()) {
        return Ok(Some(true));
    }
    if NEGATIVE.contains(&folded.as_str()) {
        return Ok(Some(false));
    }
    Err(format!("unrecognized yes/no value: {}", raw.trim()))
}

// ============================================================================
// TESTS
// ============================================================================
