//! Primary store engine: SQLite behind an isolated worker
//!
//! Every call is turned into an [`EngineRequest`] and sent over a
//! [`RetryingChannel`] to the worker task that owns the connection.

mod schema;
mod worker;

use async_trait::async_trait;
use beacon_types::{
    DeleteOutcome, EngineKind, EntityKind, EntityPruneStats, Page, QueryFilter, Record, RecordId,
    Timestamp,
};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channel::{EngineReply, EngineRequest, MailboxTransport, RetryingChannel, Transport};
use crate::config::{ChannelConfig, PrimaryConfig};
use crate::engine::StoreEngine;
use crate::error::{Result, StorageError};

pub struct PrimaryEngine {
    channel: RetryingChannel,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PrimaryEngine {
    /// Spawn the worker and return immediately. The worker may still be
    /// booting; requests sent before it is ready are retried by the channel.
    pub fn launch(primary: &PrimaryConfig, channel: &ChannelConfig) -> Self {
        let (transport, mailbox) =
            MailboxTransport::pair(channel.mailbox_capacity, channel.request_timeout());
        let handle = worker::spawn(primary.clone(), mailbox);
        Self {
            channel: RetryingChannel::new(Arc::new(transport), channel.retry_policy()),
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Use an arbitrary transport, with no worker task of its own
    pub fn with_transport(transport: Arc<dyn Transport>, channel: &ChannelConfig) -> Self {
        Self {
            channel: RetryingChannel::new(transport, channel.retry_policy()),
            worker: Mutex::new(None),
        }
    }

    /// Launch and initialize in one step
    pub async fn start(primary: &PrimaryConfig, channel: &ChannelConfig) -> Result<Self> {
        let engine = Self::launch(primary, channel);
        if let Err(e) = engine.initialize().await {
            // Best effort; the worker may never have come up
            let _ = engine.shutdown().await;
            return Err(e);
        }
        Ok(engine)
    }

    /// Run the capability probe and create the schema. Returns the SQLite version.
    pub async fn initialize(&self) -> Result<String> {
        match self.channel.call(EngineRequest::Initialize).await? {
            EngineReply::Initialized { sqlite_version } => Ok(sqlite_version),
            other => Err(unexpected("initialize", other)),
        }
    }
}

fn unexpected(operation: &str, reply: EngineReply) -> StorageError {
    StorageError::Engine(format!("unexpected reply to {}: {:?}", operation, reply))
}

#[async_trait]
impl StoreEngine for PrimaryEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Primary
    }

    async fn insert(&self, record: Record) -> Result<RecordId> {
        match self.channel.call(EngineRequest::Insert { record }).await? {
            EngineReply::Inserted(id) => Ok(id),
            other => Err(unexpected("insert", other)),
        }
    }

    async fn query(
        &self,
        kind: EntityKind,
        filter: Option<QueryFilter>,
        limit: usize,
        offset: usize,
    ) -> Result<Page> {
        let request = EngineRequest::Query {
            entity: kind,
            filter,
            limit,
            offset,
        };
        match self.channel.call(request).await? {
            EngineReply::Page(page) => Ok(page),
            other => Err(unexpected("query", other)),
        }
    }

    async fn delete_by_id(&self, kind: EntityKind, id: RecordId) -> Result<DeleteOutcome> {
        match self
            .channel
            .call(EngineRequest::DeleteById { entity: kind, id })
            .await?
        {
            EngineReply::Deleted(outcome) => Ok(outcome),
            other => Err(unexpected("delete_by_id", other)),
        }
    }

    async fn prune(
        &self,
        kind: EntityKind,
        cutoff: Timestamp,
        max_records: u64,
    ) -> Result<EntityPruneStats> {
        let request = EngineRequest::Prune {
            entity: kind,
            cutoff,
            max_records,
        };
        match self.channel.call(request).await? {
            EngineReply::Pruned(stats) => Ok(stats),
            other => Err(unexpected("prune", other)),
        }
    }

    async fn count(&self, kind: EntityKind) -> Result<u64> {
        match self.channel.call(EngineRequest::Count { entity: kind }).await? {
            EngineReply::Count(count) => Ok(count),
            other => Err(unexpected("count", other)),
        }
    }

    async fn clear(&self, kind: EntityKind) -> Result<u64> {
        match self.channel.call(EngineRequest::Clear { entity: kind }).await? {
            EngineReply::Cleared(count) => Ok(count),
            other => Err(unexpected("clear", other)),
        }
    }

    async fn approximate_size_bytes(&self) -> Result<u64> {
        match self.channel.call(EngineRequest::Size).await? {
            EngineReply::Size(bytes) => Ok(bytes),
            other => Err(unexpected("size", other)),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let handle = self.worker.lock().ok().and_then(|mut guard| guard.take());
        let Some(handle) = handle else {
            return Ok(());
        };

        if let Err(e) = self.channel.call(EngineRequest::Shutdown).await {
            warn!("Primary worker did not acknowledge shutdown: {}", e);
            handle.abort();
            return Ok(());
        }
        if let Err(e) = handle.await {
            warn!("Primary worker ended abnormally: {}", e);
        }
        info!("Primary engine shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_types::{CapturedCall, LoggedError, ScriptAsset, Severity};
    use std::time::Duration;

    fn channel_config() -> ChannelConfig {
        ChannelConfig {
            base_delay_ms: 5,
            ..ChannelConfig::default()
        }
    }

    async fn engine() -> PrimaryEngine {
        PrimaryEngine::start(&PrimaryConfig::default(), &channel_config())
            .await
            .unwrap()
    }

    fn call(url: &str, timestamp: Timestamp) -> Record {
        Record::from(CapturedCall {
            url: url.to_string(),
            method: "GET".into(),
            headers: "{}".into(),
            payload_size: 12,
            status: 200,
            response_body: String::new(),
            timestamp,
        })
    }

    fn script(name: &str, source_map: bool, timestamp: Timestamp) -> Record {
        Record::from(ScriptAsset {
            domain: "cdn.example.com".into(),
            name: name.into(),
            version: "1.0.0".into(),
            size_bytes: 2048,
            source_map_available: source_map,
            url: format!("https://cdn.example.com/{}.js", name),
            timestamp,
        })
    }

    #[tokio::test]
    async fn test_query_returns_every_row_of_the_page() {
        let engine = engine().await;
        for ts in 0..10 {
            engine.insert(call("https://a.io", ts)).await.unwrap();
        }

        let page = engine
            .query(EntityKind::CapturedCall, None, 7, 0)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 7);
        assert_eq!(page.total, 10);
        let timestamps: Vec<_> = page.records.iter().map(|r| r.timestamp()).collect();
        assert_eq!(timestamps, vec![9, 8, 7, 6, 5, 4, 3]);
    }

    #[tokio::test]
    async fn test_ids_are_positive_and_increasing() {
        let engine = engine().await;
        let first = engine.insert(call("https://a.io", 5)).await.unwrap();
        let second = engine.insert(call("https://a.io", 1)).await.unwrap();
        assert!(first > 0);
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_boolean_is_coerced_back() {
        let engine = engine().await;
        engine.insert(script("with-map", true, 2)).await.unwrap();
        engine.insert(script("without-map", false, 1)).await.unwrap();

        let page = engine
            .query(EntityKind::ScriptAsset, None, 10, 0)
            .await
            .unwrap();
        let flags: Vec<bool> = page
            .records
            .iter()
            .map(|r| match &r.record {
                Record::ScriptAsset(s) => s.source_map_available,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(flags, vec![true, false]);
    }

    #[tokio::test]
    async fn test_filter_by_severity() {
        let engine = engine().await;
        for (i, severity) in [Severity::Error, Severity::Info, Severity::Error]
            .into_iter()
            .enumerate()
        {
            engine
                .insert(Record::from(LoggedError {
                    message: format!("e{}", i),
                    stack: None,
                    timestamp: i as Timestamp,
                    severity,
                    origin_url: "https://a.io".into(),
                }))
                .await
                .unwrap();
        }

        let page = engine
            .query(
                EntityKind::LoggedError,
                Some(QueryFilter::Severity(Severity::Error)),
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.records.len(), 2);

        let err = engine
            .query(
                EntityKind::CapturedCall,
                Some(QueryFilter::Severity(Severity::Error)),
                10,
                0,
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_delete_and_not_found() {
        let engine = engine().await;
        let id = engine.insert(call("https://a.io", 1)).await.unwrap();
        assert_eq!(
            engine
                .delete_by_id(EntityKind::CapturedCall, id)
                .await
                .unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            engine
                .delete_by_id(EntityKind::CapturedCall, id)
                .await
                .unwrap(),
            DeleteOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_prune_phases() {
        let engine = engine().await;
        for ts in 0..20 {
            engine.insert(call("https://a.io", ts)).await.unwrap();
        }

        let stats = engine.prune(EntityKind::CapturedCall, 5, 10).await.unwrap();
        assert_eq!(stats.expired, 5);
        assert_eq!(stats.over_cap, 5);
        assert_eq!(stats.remaining, 10);

        let page = engine
            .query(EntityKind::CapturedCall, None, 100, 0)
            .await
            .unwrap();
        assert_eq!(page.records.last().unwrap().timestamp(), 10);
    }

    #[tokio::test]
    async fn test_size_is_reported() {
        let engine = engine().await;
        assert!(engine.approximate_size_bytes().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_rejects_old_sqlite() {
        let primary = PrimaryConfig {
            min_sqlite_version: "99.0.0".into(),
            ..PrimaryConfig::default()
        };
        let err = PrimaryEngine::start(&primary, &channel_config())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Engine(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_unopenable_database_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a database file
        let primary = PrimaryConfig {
            database_path: Some(dir.path().to_path_buf()),
            ..PrimaryConfig::default()
        };
        let started = std::time::Instant::now();
        let err = PrimaryEngine::start(&primary, &channel_config())
            .await
            .err()
            .unwrap();
        assert!(err.is_channel_unavailable(), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_file_database_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let primary = PrimaryConfig {
            database_path: Some(dir.path().join("nested").join("beacon.db")),
            ..PrimaryConfig::default()
        };

        let engine = PrimaryEngine::start(&primary, &channel_config())
            .await
            .unwrap();
        let id = engine.insert(call("https://a.io", 3)).await.unwrap();
        engine.shutdown().await.unwrap();

        let engine = PrimaryEngine::start(&primary, &channel_config())
            .await
            .unwrap();
        let page = engine
            .query(EntityKind::CapturedCall, None, 10, 0)
            .await
            .unwrap();
        assert_eq!(page.ids(), vec![id]);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_are_unavailable() {
        let engine = engine().await;
        engine.shutdown().await.unwrap();
        let err = engine.count(EntityKind::TokenEvent).await.unwrap_err();
        assert!(err.is_channel_unavailable());
    }
}
