//! Storage coordinator
//!
//! The single entry point for producers, consumers and administrative callers.
//! It decides once, at open time, which engine serves the process and routes
//! every call to it. It owns no record state itself.

use beacon_types::{
    BackendInfo, CapturedCall, DeleteOutcome, EngineKind, EntityKind, LoggedError, Page,
    PruneReport, QueryFilter, Record, RecordId, ScriptAsset, Timestamp, TokenEvent,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::engine::StoreEngine;
use crate::error::Result;
use crate::fallback::FallbackEngine;
use crate::primary::PrimaryEngine;
use crate::pruner::{self, PrunerHandle, RetentionPolicy, RetentionPruner};

/// Cheap, cloneable handle to the active storage engine
#[derive(Clone)]
pub struct StorageCoordinator {
    engine: Arc<dyn StoreEngine>,
    policy: RetentionPolicy,
    pruner: Arc<Mutex<Option<PrunerHandle>>>,
}

impl StorageCoordinator {
    /// Select the backend and open it. Primary initialization failures are
    /// logged and answered with the fallback engine, never surfaced.
    /// The pruner starts here unless `retention.enabled` is off.
    pub async fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;

        let engine: Arc<dyn StoreEngine> = if !config.primary.enabled {
            info!("Primary engine disabled by configuration");
            Arc::new(FallbackEngine::open(&config.fallback).await?)
        } else {
            match PrimaryEngine::start(&config.primary, &config.channel).await {
                Ok(primary) => Arc::new(primary),
                Err(e) => {
                    warn!("Primary engine unavailable, using fallback: {}", e);
                    Arc::new(FallbackEngine::open(&config.fallback).await?)
                }
            }
        };
        info!("Storage coordinator using {} engine", engine.kind());

        let coordinator = Self::with_engine(engine, config.retention.policy());
        if config.retention.enabled {
            coordinator.start_retention().await;
        }
        Ok(coordinator)
    }

    /// Wrap an already opened engine
    pub fn with_engine(engine: Arc<dyn StoreEngine>, policy: RetentionPolicy) -> Self {
        Self {
            engine,
            policy,
            pruner: Arc::new(Mutex::new(None)),
        }
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.engine.kind()
    }

    pub async fn insert(&self, record: Record) -> Result<RecordId> {
        record.validate()?;
        let kind = record.kind();
        let id = self.engine.insert(record).await?;
        debug!("Inserted {} #{}", kind, id);
        Ok(id)
    }

    pub async fn insert_captured_call(&self, call: CapturedCall) -> Result<RecordId> {
        self.insert(call.into()).await
    }

    pub async fn insert_logged_error(&self, error: LoggedError) -> Result<RecordId> {
        self.insert(error.into()).await
    }

    pub async fn insert_token_event(&self, event: TokenEvent) -> Result<RecordId> {
        self.insert(event.into()).await
    }

    pub async fn insert_script_asset(&self, asset: ScriptAsset) -> Result<RecordId> {
        self.insert(asset.into()).await
    }

    /// Decode untyped producer input, validate it and insert it
    pub async fn insert_json(&self, kind: EntityKind, value: serde_json::Value) -> Result<RecordId> {
        let record = Record::from_json(kind, value)?;
        self.insert(record).await
    }

    /// One page of `kind`, newest first
    pub async fn query(&self, kind: EntityKind, limit: usize, offset: usize) -> Result<Page> {
        self.engine.query(kind, None, limit, offset).await
    }

    pub async fn query_filtered(
        &self,
        kind: EntityKind,
        filter: QueryFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Page> {
        filter.check(kind)?;
        self.engine.query(kind, Some(filter), limit, offset).await
    }

    pub async fn get_counts(&self) -> Result<BTreeMap<EntityKind, u64>> {
        let mut counts = BTreeMap::new();
        for kind in EntityKind::ALL {
            counts.insert(kind, self.engine.count(kind).await?);
        }
        Ok(counts)
    }

    pub async fn get_backend_info(&self) -> Result<BackendInfo> {
        Ok(BackendInfo {
            engine_kind: self.engine.kind(),
            approximate_size_bytes: self.engine.approximate_size_bytes().await?,
        })
    }

    pub async fn delete_by_id(&self, kind: EntityKind, id: RecordId) -> Result<DeleteOutcome> {
        let outcome = self.engine.delete_by_id(kind, id).await?;
        debug!("Delete {} #{}: {:?}", kind, id, outcome);
        Ok(outcome)
    }

    /// Delete everything older than `cutoff`, then cap each entity at
    /// `max_records_per_entity`, keeping the newest
    pub async fn prune_older_than(
        &self,
        cutoff: Timestamp,
        max_records_per_entity: u64,
    ) -> Result<PruneReport> {
        let report = pruner::prune_all(self.engine.as_ref(), |_| {
            (cutoff, max_records_per_entity)
        })
        .await?;
        info!(
            "Pruned {} record(s) (cutoff {}, cap {})",
            report.total_removed(),
            cutoff,
            max_records_per_entity
        );
        Ok(report)
    }

    pub async fn clear(&self, kind: EntityKind) -> Result<u64> {
        let removed = self.engine.clear(kind).await?;
        self.engine.flush().await?;
        info!("Cleared {} {} record(s)", removed, kind);
        Ok(removed)
    }

    /// Start the background pruner with the configured policy, replacing
    /// any pruner already running
    pub async fn start_retention(&self) {
        self.start_retention_with(self.policy.clone()).await
    }

    pub async fn start_retention_with(&self, policy: RetentionPolicy) {
        let handle = RetentionPruner::new(self.engine.clone(), policy).spawn();
        let previous = self.pruner.lock().await.replace(handle);
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
    }

    /// One retention pass with the configured policy
    pub async fn run_retention_once(&self) -> Result<PruneReport> {
        RetentionPruner::new(self.engine.clone(), self.policy.clone())
            .run_once()
            .await
    }

    pub async fn retention_running(&self) -> bool {
        self.pruner
            .lock()
            .await
            .as_ref()
            .map(|h| h.is_running())
            .unwrap_or(false)
    }

    /// Stop the pruner, persist buffered state and release the engine
    pub async fn close(&self) -> Result<()> {
        let handle = self.pruner.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.engine.flush().await?;
        self.engine.shutdown().await?;
        info!("Storage coordinator closed");
        Ok(())
    }
}
