//! Incoming progress reports and their validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MAX_FIELD_LENGTH;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidReport {
    #[error("wallet address is missing")]
    MissingAddress,
    #[error("{field} too long (len={len}, max={max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{field} must not be negative (got {value})")]
    Negative { field: &'static str, value: i64 },
}

/// Progress deltas as sent by a client. Every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub punches: Option<i64>,
    #[serde(
        default,
        rename = "referredBy",
        skip_serializing_if = "Option::is_none"
    )]
    pub referred_by: Option<String>,
    #[serde(
        default,
        rename = "characterName",
        skip_serializing_if = "Option::is_none"
    )]
    pub character_name: Option<String>,
}

/// A report whose deltas are known to be non-negative.
///
/// Empty strings mean "not provided".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidatedReport {
    pub tokens: u64,
    pub punches: u64,
    pub referred_by: String,
    pub character_name: String,
}

impl ProgressReport {
    pub fn validate(&self) -> Result<ValidatedReport, InvalidReport> {
        let tokens = non_negative("tokens", self.tokens)?;
        let punches = non_negative("punches", self.punches)?;
        let referred_by = bounded("referredBy", self.referred_by.as_deref())?;
        let character_name = bounded("characterName", self.character_name.as_deref())?;
        Ok(ValidatedReport {
            tokens,
            punches,
            referred_by,
            character_name,
        })
    }
}

/// Validate a non-negative delta (absent counts as zero).
pub fn non_negative(field: &'static str, value: Option<i64>) -> Result<u64, InvalidReport> {
    match value.unwrap_or(0) {
        value if value < 0 => Err(InvalidReport::Negative { field, value }),
        value => Ok(value as u64),
    }
}

/// Trim and length-check an address, rejecting empty ones.
pub fn validate_address(address: &str) -> Result<&str, InvalidReport> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(InvalidReport::MissingAddress);
    }
    if trimmed.len() > MAX_FIELD_LENGTH {
        return Err(InvalidReport::TooLong {
            field: "wallet_address",
            len: trimmed.len(),
            max: MAX_FIELD_LENGTH,
        });
    }
    Ok(trimmed)
}

fn bounded(field: &'static str, value: Option<&str>) -> Result<String, InvalidReport> {
    let value = value.map(str::trim).unwrap_or_default();
    if value.len() > MAX_FIELD_LENGTH {
        return Err(InvalidReport::TooLong {
            field,
            len: value.len(),
            max: MAX_FIELD_LENGTH,
        });
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_default_to_zero_and_empty() {
        let report: ProgressReport = serde_json::from_str(r#"{"tokens": 20}"#).unwrap();
        let validated = report.validate().unwrap();
        assert_eq!(validated.tokens, 20);
        assert_eq!(validated.punches, 0);
        assert!(validated.referred_by.is_empty());
        assert!(validated.character_name.is_empty());
    }

    #[test]
    fn rejects_negative_deltas() {
        let report = ProgressReport {
            tokens: Some(-5),
            ..Default::default()
        };
        assert_eq!(
            report.validate(),
            Err(InvalidReport::Negative {
                field: "tokens",
                value: -5
            })
        );

        let report = ProgressReport {
            punches: Some(-1),
            ..Default::default()
        };
        assert!(matches!(
            report.validate(),
            Err(InvalidReport::Negative {
                field: "punches",
                ..
            })
        ));
    }

    #[test]
    fn rejects_oversized_strings() {
        let report = ProgressReport {
            character_name: Some("x".repeat(MAX_FIELD_LENGTH + 1)),
            ..Default::default()
        };
        assert!(matches!(
            report.validate(),
            Err(InvalidReport::TooLong {
                field: "characterName",
                ..
            })
        ));
    }

    #[test]
    fn address_is_trimmed_and_required() {
        assert_eq!(validate_address("  A  "), Ok("A"));
        assert_eq!(validate_address("   "), Err(InvalidReport::MissingAddress));
        assert!(validate_address(&"a".repeat(MAX_FIELD_LENGTH + 1)).is_err());
    }

    #[test]
    fn parses_client_casing() {
        let report: ProgressReport = serde_json::from_str(
            r#"{"tokens":100,"punches":50,"referredBy":"B","characterName":"Hero"}"#,
        )
        .unwrap();
        assert_eq!(report.referred_by.as_deref(), Some("B"));
        assert_eq!(report.character_name.as_deref(), Some("Hero"));
    }
}
