//! Backend contract shared by the primary and fallback engines

use async_trait::async_trait;
use beacon_types::{
    DeleteOutcome, EngineKind, EntityKind, EntityPruneStats, Page, QueryFilter, Record, RecordId,
    Timestamp,
};

use crate::error::Result;

/// One CRUD + pagination contract, implemented by exactly two engines.
///
/// Implementations assume input was validated by the caller. Ordering of
/// `query` is timestamp descending with id descending as the tie-break.
#[async_trait]
pub trait StoreEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Append a record and return its newly assigned id
    async fn insert(&self, record: Record) -> Result<RecordId>;

    async fn query(
        &self,
        kind: EntityKind,
        filter: Option<QueryFilter>,
        limit: usize,
        offset: usize,
    ) -> Result<Page>;

    async fn delete_by_id(&self, kind: EntityKind, id: RecordId) -> Result<DeleteOutcome>;

    /// Two-phase retention for one entity: age cutoff, then count cap.
    async fn prune(
        &self,
        kind: EntityKind,
        cutoff: Timestamp,
        max_records: u64,
    ) -> Result<EntityPruneStats>;

    async fn count(&self, kind: EntityKind) -> Result<u64>;

    /// Delete every record of one entity
    async fn clear(&self, kind: EntityKind) -> Result<u64>;

    async fn approximate_size_bytes(&self) -> Result<u64>;

    /// Persist anything buffered. No-op for engines that write through.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Release engine resources. Further calls may fail.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
