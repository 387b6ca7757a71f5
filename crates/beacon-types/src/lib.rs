//! Beacon Types - Record schemas shared by every storage backend
//!
//! This crate contains only pure data types and validation rules,
//! with no async runtime dependencies.

pub mod entity;
pub mod page;
pub mod record;
pub mod validation;

pub use entity::*;
pub use page::*;
pub use record::*;
pub use validation::*;

/// Engine-assigned record identifier. Always positive.
pub type RecordId = i64;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Current wall-clock time as a [`Timestamp`].
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}
