//! Validation rules for producer input

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A required field is missing or malformed
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type ValidationResult = std::result::Result<(), ValidationError>;

pub(crate) fn require_timestamp(value: i64) -> ValidationResult {
    if value < 0 {
        return Err(ValidationError::new(
            "timestamp",
            format!("must be a non-negative epoch-millisecond value, got {}", value),
        ));
    }
    Ok(())
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> ValidationResult {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(())
}

/// Sizes are stored in signed 64-bit columns
pub(crate) fn require_storable_size(field: &str, value: u64) -> ValidationResult {
    if i64::try_from(value).is_err() {
        return Err(ValidationError::new(
            field,
            format!("{} exceeds the largest storable size {}", value, i64::MAX),
        ));
    }
    Ok(())
}

/// 0 means "unknown", otherwise a valid HTTP status class
pub(crate) fn require_http_status(status: u16) -> ValidationResult {
    if status == 0 || (100..=599).contains(&status) {
        Ok(())
    } else {
        Err(ValidationError::new(
            "status",
            format!("{} is not an HTTP status code", status),
        ))
    }
}

/// Three dot-separated base64url segments, the first decoding to a JSON header.
pub(crate) fn looks_like_raw_jwt(value: &str) -> bool {
    let segments: Vec<&str> = value.split('.').collect();
    if segments.len() != 3 {
        return false;
    }
    let is_b64url = |s: &str| {
        !s.is_empty()
            && s.bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    };
    // "eyJ" is the base64 encoding of `{"`
    segments[0].starts_with("eyJ") && segments.iter().all(|s| is_b64url(s))
}
