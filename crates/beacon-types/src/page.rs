//! Read-side result types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::entity::EntityKind;
use crate::record::{Severity, StoredRecord};
use crate::validation::ValidationError;

/// One page of records, newest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub records: Vec<StoredRecord>,
    /// Total records matching the query, ignoring limit/offset
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub fn ids(&self) -> Vec<crate::RecordId> {
        self.records.iter().map(|r| r.id).collect()
    }

    /// Whether another page exists after this one
    pub fn has_more(&self) -> bool {
        (self.offset.saturating_add(self.records.len()) as u64) < self.total
    }
}

/// Which backend is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Embedded relational engine in its own worker
    Primary,
    /// In-process transactional key-value store
    Fallback,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Primary => write!(f, "primary"),
            EngineKind::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub engine_kind: EngineKind,
    pub approximate_size_bytes: u64,
}

/// Result of a delete-by-id. A missing record is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

impl DeleteOutcome {
    pub fn is_deleted(self) -> bool {
        matches!(self, DeleteOutcome::Deleted)
    }
}

/// Rows removed from one entity by a prune pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPruneStats {
    /// Removed because older than the cutoff
    pub expired: u64,
    /// Removed because the entity was over its cap
    pub over_cap: u64,
    /// Records left afterwards
    pub remaining: u64,
}

impl EntityPruneStats {
    pub fn removed(&self) -> u64 {
        self.expired + self.over_cap
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub entities: BTreeMap<EntityKind, EntityPruneStats>,
}

impl PruneReport {
    pub fn total_removed(&self) -> u64 {
        self.entities.values().map(|s| s.removed()).sum()
    }
}

/// Secondary-index filters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "by", content = "value")]
pub enum QueryFilter {
    /// Exact url match on captured calls
    Url(String),
    /// Severity match on logged errors
    Severity(Severity),
    /// Exact domain match on script assets
    Domain(String),
}

impl QueryFilter {
    /// The only entity this filter applies to
    pub fn entity(&self) -> EntityKind {
        match self {
            QueryFilter::Url(_) => EntityKind::CapturedCall,
            QueryFilter::Severity(_) => EntityKind::LoggedError,
            QueryFilter::Domain(_) => EntityKind::ScriptAsset,
        }
    }

    pub fn check(&self, kind: EntityKind) -> Result<(), ValidationError> {
        if self.entity() == kind {
            Ok(())
        } else {
            Err(ValidationError::new(
                "filter",
                format!("{:?} does not apply to {}", self, kind),
            ))
        }
    }

    pub fn matches(&self, record: &StoredRecord) -> bool {
        use crate::record::Record;
        match (self, &record.record) {
            (QueryFilter::Url(url), Record::CapturedCall(r)) => &r.url == url,
            (QueryFilter::Severity(s), Record::LoggedError(r)) => r.severity == *s,
            (QueryFilter::Domain(d), Record::ScriptAsset(r)) => &r.domain == d,
            _ => false,
        }
    }
}
