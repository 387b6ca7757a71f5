//! Entity kinds

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::validation::ValidationError;

/// The four fixed record shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    CapturedCall,
    LoggedError,
    TokenEvent,
    ScriptAsset,
}

impl EntityKind {
    /// Every entity, in a fixed order
    pub const ALL: [EntityKind; 4] = [
        EntityKind::CapturedCall,
        EntityKind::LoggedError,
        EntityKind::TokenEvent,
        EntityKind::ScriptAsset,
    ];

    /// Table (or collection) name used by the engines
    pub fn table_name(self) -> &'static str {
        match self {
            EntityKind::CapturedCall => "captured_calls",
            EntityKind::LoggedError => "logged_errors",
            EntityKind::TokenEvent => "token_events",
            EntityKind::ScriptAsset => "script_assets",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::CapturedCall => "captured_call",
            EntityKind::LoggedError => "logged_error",
            EntityKind::TokenEvent => "token_event",
            EntityKind::ScriptAsset => "script_asset",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "captured_call" | "captured_calls" | "api-call" | "api_call" => {
                Ok(EntityKind::CapturedCall)
            }
            "logged_error" | "logged_errors" | "error" => Ok(EntityKind::LoggedError),
            "token_event" | "token_events" | "token" => Ok(EntityKind::TokenEvent),
            "script_asset" | "script_assets" | "script" => Ok(EntityKind::ScriptAsset),
            other => Err(ValidationError::new(
                "entity",
                format!("unknown entity kind: {}", other),
            )),
        }
    }
}
