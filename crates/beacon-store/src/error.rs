//! Error types for the storage subsystem

use beacon_types::ValidationError;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Input rejected before reaching an engine. Never retried.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The worker channel could not deliver the request within its retry budget
    #[error("Storage temporarily unreachable after {attempts} attempt(s): {reason}")]
    ChannelUnavailable { attempts: u32, reason: String },

    /// The active engine reported a failure unrelated to the input
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Discriminator for callers that branch on failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    ChannelUnavailable,
    Engine,
    Config,
    Io,
}

impl StorageError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::Validation(_) => ErrorClass::Validation,
            StorageError::ChannelUnavailable { .. } => ErrorClass::ChannelUnavailable,
            StorageError::Engine(_) => ErrorClass::Engine,
            StorageError::Config(_) => ErrorClass::Config,
            StorageError::Io(_) | StorageError::Serialization(_) => ErrorClass::Io,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.class() == ErrorClass::Validation
    }

    pub fn is_channel_unavailable(&self) -> bool {
        self.class() == ErrorClass::ChannelUnavailable
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Engine(e.to_string())
    }
}

impl From<config::ConfigError> for StorageError {
    fn from(e: config::ConfigError) -> Self {
        StorageError::Config(e.to_string())
    }
}
