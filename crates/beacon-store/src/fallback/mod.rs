//! Fallback store engine: in-process transactional key-value tables
//!
//! Used when the primary engine cannot be initialized. Each entity lives in
//! its own [`KvTable`]; every operation holds that table's exclusive guard for
//! its whole duration, so a reader never observes a half-applied write.

mod snapshot;
mod table;

use async_trait::async_trait;
use beacon_types::{
    DeleteOutcome, EngineKind, EntityKind, EntityPruneStats, Page, QueryFilter, Record, RecordId,
    Timestamp,
};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::config::FallbackConfig;
use crate::engine::StoreEngine;
use crate::error::Result;
use snapshot::{Snapshot, TableSnapshot};
use table::KvTable;

pub struct FallbackEngine {
    tables: DashMap<EntityKind, KvTable>,
    snapshot_path: Option<PathBuf>,
    /// Set by mutations, cleared once a snapshot is written
    dirty: AtomicBool,
}

impl FallbackEngine {
    /// Purely in-memory, nothing persisted
    pub fn new() -> Self {
        let tables = DashMap::new();
        for kind in EntityKind::ALL {
            tables.insert(kind, KvTable::default());
        }
        Self {
            tables,
            snapshot_path: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Open the engine, restoring the snapshot if one is configured and present
    pub async fn open(config: &FallbackConfig) -> Result<Self> {
        let mut engine = Self::new();
        let Some(path) = config.snapshot_path.clone() else {
            info!("Fallback engine opened in memory");
            return Ok(engine);
        };

        if let Some(snapshot) = snapshot::load(&path).await? {
            for (kind, table) in snapshot.tables {
                engine
                    .tables
                    .insert(kind, KvTable::restore(table.next_id, table.records));
            }
        }
        info!("Fallback engine opened with snapshot {}", path.display());
        engine.snapshot_path = Some(path);
        Ok(engine)
    }

    fn capture(&self) -> Snapshot {
        let tables = self
            .tables
            .iter()
            .map(|entry| {
                let table = entry.value();
                (
                    *entry.key(),
                    TableSnapshot {
                        next_id: table.next_id(),
                        records: table.records().cloned().collect(),
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        Snapshot::new(tables)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

impl Default for FallbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreEngine for FallbackEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Fallback
    }

    async fn insert(&self, record: Record) -> Result<RecordId> {
        let id = self.tables.entry(record.kind()).or_default().insert(record);
        self.mark_dirty();
        Ok(id)
    }

    async fn query(
        &self,
        kind: EntityKind,
        filter: Option<QueryFilter>,
        limit: usize,
        offset: usize,
    ) -> Result<Page> {
        if let Some(filter) = &filter {
            filter.check(kind)?;
        }
        // Exclusive: the cursor cache is updated by reads too
        Ok(self.tables.entry(kind).or_default().query(filter, limit, offset))
    }

    async fn delete_by_id(&self, kind: EntityKind, id: RecordId) -> Result<DeleteOutcome> {
        let outcome = self.tables.entry(kind).or_default().delete(id);
        if outcome.is_deleted() {
            self.mark_dirty();
        }
        Ok(outcome)
    }

    async fn prune(
        &self,
        kind: EntityKind,
        cutoff: Timestamp,
        max_records: u64,
    ) -> Result<EntityPruneStats> {
        let stats = self
            .tables
            .entry(kind)
            .or_default()
            .prune(cutoff, max_records);
        if stats.removed() > 0 {
            self.mark_dirty();
        }
        debug!("Fallback pruned {}: {:?}", kind, stats);
        Ok(stats)
    }

    async fn count(&self, kind: EntityKind) -> Result<u64> {
        Ok(self.tables.get(&kind).map(|t| t.len()).unwrap_or(0))
    }

    async fn clear(&self, kind: EntityKind) -> Result<u64> {
        let removed = self.tables.entry(kind).or_default().clear();
        self.mark_dirty();
        Ok(removed)
    }

    async fn approximate_size_bytes(&self) -> Result<u64> {
        Ok(self.tables.iter().map(|t| t.bytes()).sum())
    }

    async fn flush(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let snapshot = self.capture();
        if let Err(e) = snapshot::save(path, &snapshot).await {
            self.mark_dirty();
            return Err(e);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.flush().await?;
        info!("Fallback engine shut down");
        Ok(())
    }
}
