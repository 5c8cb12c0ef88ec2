//! Identifier canonicalization.
//!
//! Requested entity keys arrive as strings, integers or float-like numbers
//! (spreadsheet exports love `10.0`). Every input either normalizes to a
//! non-empty [`CanonicalId`] or is rejected with a [`ValidationError`];
//! normalization never panics and is idempotent.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ValidationError;

/// Largest float that still converts to an `i64` without saturating.
const MAX_INTEGRAL_FLOAT: f64 = 9_223_372_036_854_775_807.0;

/// Raw identifier as supplied by a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum RawIdentifier {
    Text(String),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
}

impl RawIdentifier {
    /// Convert a JSON scalar into a raw identifier.
    pub fn from_json(value: &Value) -> Result<Self, ValidationError> {
        match value {
            Value::String(text) => Ok(Self::Text(text.clone())),
            Value::Number(number) => {
                if let Some(value) = number.as_i64() {
                    Ok(Self::Integer(value))
                } else if let Some(value) = number.as_u64() {
                    Ok(Self::Unsigned(value))
                } else {
                    Ok(Self::Float(number.as_f64().unwrap_or(f64::NAN)))
                }
            }
            Value::Null => Err(ValidationError::UnsupportedIdentifierType { kind: "null" }),
            Value::Bool(_) => Err(ValidationError::UnsupportedIdentifierType { kind: "bool" }),
            Value::Array(_) => Err(ValidationError::UnsupportedIdentifierType { kind: "array" }),
            Value::Object(_) => Err(ValidationError::UnsupportedIdentifierType { kind: "object" }),
        }
    }
}

impl Display for RawIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Unsigned(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for RawIdentifier {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for RawIdentifier {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for RawIdentifier {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for RawIdentifier {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u64> for RawIdentifier {
    fn from(value: u64) -> Self {
        Self::Unsigned(value)
    }
}

impl From<u32> for RawIdentifier {
    fn from(value: u32) -> Self {
        Self::Unsigned(u64::from(value))
    }
}

impl From<f64> for RawIdentifier {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Case folding applied to non-numeric identifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseFolding {
    #[default]
    Preserve,
    Upper,
    Lower,
}

/// Normalized identifier.
///
/// Ordering is deterministic: all-digit identifiers compare numerically and
/// sort before everything else; other identifiers compare lexically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalId(String);

impl CanonicalId {
    /// Normalize text with the default normalizer.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        IdentifierNormalizer::default().normalize_text(input)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_unsigned_numeric(&self) -> bool {
        self.0.bytes().all(|byte| byte.is_ascii_digit())
    }
}

impl Ord for CanonicalId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_unsigned_numeric(), other.is_unsigned_numeric()) {
            // Canonical numbers carry no leading zeros, so length orders magnitude.
            (true, true) => self
                .0
                .len()
                .cmp(&other.0.len())
                .then_with(|| self.0.cmp(&other.0)),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for CanonicalId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for CanonicalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for CanonicalId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CanonicalId> for String {
    fn from(value: CanonicalId) -> Self {
        value.0
    }
}

/// Identifier that failed normalization, kept for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidIdentifier {
    pub raw: String,
    pub error: ValidationError,
}

/// Result of normalizing a whole request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedIds {
    /// Unique canonical identifiers, sorted.
    pub ids: Vec<CanonicalId>,
    pub invalid: Vec<InvalidIdentifier>,
    /// Number of valid inputs that collapsed onto an already seen identifier.
    pub duplicates: usize,
}

/// Turns raw identifiers into canonical ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentifierNormalizer {
    case: CaseFolding,
}

impl IdentifierNormalizer {
    pub const fn new(case: CaseFolding) -> Self {
        Self { case }
    }

    pub fn normalize(&self, raw: &RawIdentifier) -> Result<CanonicalId, ValidationError> {
        match raw {
            RawIdentifier::Text(text) => self.normalize_text(text),
            RawIdentifier::Integer(value) => Ok(CanonicalId(value.to_string())),
            RawIdentifier::Unsigned(value) => Ok(CanonicalId(value.to_string())),
            RawIdentifier::Float(value) => normalize_float(*value),
        }
    }

    pub fn normalize_text(&self, input: &str) -> Result<CanonicalId, ValidationError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyIdentifier);
        }

        for (index, ch) in trimmed.chars().enumerate() {
            if ch.is_control() {
                return Err(ValidationError::IdentifierControlChar { index });
            }
            // Identifiers travel comma-joined in a single filter parameter.
            if ch == ',' {
                return Err(ValidationError::IdentifierReservedChar { ch, index });
            }
        }

        if let Some(numeric) = canonical_integer_text(trimmed) {
            return Ok(CanonicalId(numeric));
        }

        let folded = match self.case {
            CaseFolding::Preserve => trimmed.to_owned(),
            CaseFolding::Upper => trimmed.to_uppercase(),
            CaseFolding::Lower => trimmed.to_lowercase(),
        };
        Ok(CanonicalId(folded))
    }

    /// Normalize, drop invalid entries and collapse duplicates.
    pub fn normalize_all<I>(&self, raw_ids: I) -> NormalizedIds
    where
        I: IntoIterator,
        I::Item: Into<RawIdentifier>,
    {
        let mut unique = BTreeSet::new();
        let mut invalid = Vec::new();
        let mut duplicates = 0;

        for raw in raw_ids {
            let raw = raw.into();
            match self.normalize(&raw) {
                Ok(id) => {
                    if !unique.insert(id) {
                        duplicates += 1;
                    }
                }
                Err(error) => invalid.push(InvalidIdentifier {
                    raw: raw.to_string(),
                    error,
                }),
            }
        }

        NormalizedIds {
            ids: unique.into_iter().collect(),
            invalid,
            duplicates,
        }
    }
}

fn normalize_float(value: f64) -> Result<CanonicalId, ValidationError> {
    let integral = value.is_finite()
        && value.fract() == 0.0
        && value >= -MAX_INTEGRAL_FLOAT
        && value < MAX_INTEGRAL_FLOAT;
    if !integral {
        return Err(ValidationError::NonIntegralIdentifier {
            value: value.to_string(),
        });
    }

    Ok(CanonicalId((value as i64).to_string()))
}

/// Returns the canonical integer spelling of `text` (`"+010.00"` → `"10"`),
/// or `None` if the text is not an integer literal.
fn canonical_integer_text(text: &str) -> Option<String> {
    let (negative, unsigned) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    let (digits, fraction) = match unsigned.split_once('.') {
        Some((digits, fraction)) => (digits, Some(fraction)),
        None => (unsigned, None),
    };

    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    if let Some(fraction) = fraction {
        if !fraction.bytes().all(|byte| byte == b'0') {
            return None;
        }
    }

    let stripped = digits.trim_start_matches('0');
    if stripped.is_empty() {
        return Some(String::from("0"));
    }

    if negative {
        Some(format!("-{stripped}"))
    } else {
        Some(stripped.to_owned())
    }
}
