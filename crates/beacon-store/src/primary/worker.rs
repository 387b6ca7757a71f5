//! SQLite worker task
//!
//! The worker exclusively owns one connection. It is reachable only through
//! its [`Mailbox`] and executes requests one at a time.

use beacon_types::{
    DeleteOutcome, EntityKind, EntityPruneStats, Page, QueryFilter, Record, RecordId, Timestamp,
    ValidationError,
};
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Connection, SqliteConnection};
use std::str::FromStr;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::schema::{columns, decode_row, filter_clause, MIGRATIONS};
use crate::channel::{
    EngineFailure, EngineReply, EngineRequest, EngineResponse, Envelope, Mailbox, WorkerState,
};
use crate::config::{parse_version, PrimaryConfig};

type EngineResult<T> = std::result::Result<T, EngineFailure>;

pub(crate) fn spawn(config: PrimaryConfig, mailbox: Mailbox) -> JoinHandle<()> {
    tokio::spawn(run(config, mailbox))
}

async fn run(config: PrimaryConfig, mailbox: Mailbox) {
    let Mailbox {
        mut receiver,
        state,
    } = mailbox;

    let conn = match open(&config).await {
        Ok(conn) => conn,
        Err(e) => {
            error!("Primary worker failed to open database: {}", e);
            state.send_replace(WorkerState::Failed(e.to_string()));
            return;
        }
    };

    let mut worker = SqliteWorker {
        conn,
        min_version: config.min_sqlite_version.clone(),
        initialized: false,
    };
    state.send_replace(WorkerState::Ready);
    debug!("Primary worker ready");

    while let Some(Envelope { request, reply }) = receiver.recv().await {
        let shutdown = matches!(request, EngineRequest::Shutdown);
        let response = worker.handle(request).await;
        // The caller may have given up waiting; the work is done either way
        let _ = reply.send(response);
        if shutdown {
            break;
        }
    }

    state.send_replace(WorkerState::Stopped);
    if let Err(e) = worker.conn.close().await {
        error!("Failed to close primary database: {}", e);
    }
    info!("Primary worker stopped");
}

async fn open(config: &PrimaryConfig) -> Result<SqliteConnection, sqlx::Error> {
    let options = match &config.database_path {
        Some(path) => {
            info!("Opening SQLite database at: {}", path.display());
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        }
        None => {
            info!("Opening in-memory SQLite database");
            SqliteConnectOptions::from_str("sqlite::memory:")?
        }
    };
    SqliteConnection::connect_with(&options).await
}

struct SqliteWorker {
    conn: SqliteConnection,
    min_version: String,
    initialized: bool,
}

impl SqliteWorker {
    async fn handle(&mut self, request: EngineRequest) -> EngineResponse {
        debug!("Primary worker handling {}", request.operation());

        if !self.initialized
            && !matches!(request, EngineRequest::Initialize | EngineRequest::Shutdown)
        {
            return Err(EngineFailure::Engine(
                "schema not initialized".to_string(),
            ));
        }

        match request {
            EngineRequest::Initialize => self
                .initialize()
                .await
                .map(|sqlite_version| EngineReply::Initialized { sqlite_version }),
            EngineRequest::Insert { record } => self.insert(record).await.map(EngineReply::Inserted),
            EngineRequest::Query {
                entity,
                filter,
                limit,
                offset,
            } => self
                .query(entity, filter, limit, offset)
                .await
                .map(EngineReply::Page),
            EngineRequest::DeleteById { entity, id } => {
                self.delete(entity, id).await.map(EngineReply::Deleted)
            }
            EngineRequest::Prune {
                entity,
                cutoff,
                max_records,
            } => self
                .prune(entity, cutoff, max_records)
                .await
                .map(EngineReply::Pruned),
            EngineRequest::Count { entity } => {
                let total = count(&mut self.conn, entity).await?;
                Ok(EngineReply::Count(total))
            }
            EngineRequest::Clear { entity } => self.clear(entity).await.map(EngineReply::Cleared),
            EngineRequest::Size => self.size().await.map(EngineReply::Size),
            EngineRequest::Shutdown => Ok(EngineReply::ShutDown),
        }
    }

    /// Capability probe, then schema
    async fn initialize(&mut self) -> EngineResult<String> {
        let version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&mut self.conn)
            .await?;

        let required = parse_version(&self.min_version);
        let actual = parse_version(&version);
        match (actual, required) {
            (Some(actual), Some(required)) if actual >= required => {}
            _ => {
                return Err(EngineFailure::Engine(format!(
                    "SQLite {} does not meet the required minimum {}",
                    version, self.min_version
                )))
            }
        }

        let mut tx = self.conn.begin().await?;
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        self.initialized = true;
        info!("Primary engine initialized (SQLite {})", version);
        Ok(version)
    }

    async fn insert(&mut self, record: Record) -> EngineResult<RecordId> {
        let result = match &record {
            Record::CapturedCall(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO captured_calls
                        (url, method, headers, payload_size, status, response_body, timestamp)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                )
                .bind(&r.url)
                .bind(&r.method)
                .bind(&r.headers)
                .bind(to_i64("payload_size", r.payload_size)?)
                .bind(i64::from(r.status))
                .bind(&r.response_body)
                .bind(r.timestamp)
                .execute(&mut self.conn)
                .await?
            }
            Record::LoggedError(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO logged_errors (message, stack, timestamp, severity, origin_url)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                )
                .bind(&r.message)
                .bind(&r.stack)
                .bind(r.timestamp)
                .bind(r.severity.to_string())
                .bind(&r.origin_url)
                .execute(&mut self.conn)
                .await?
            }
            Record::TokenEvent(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO token_events (kind, value_digest, timestamp, source_url, expires_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                )
                .bind(r.kind.to_string())
                .bind(&r.value_digest)
                .bind(r.timestamp)
                .bind(&r.source_url)
                .bind(r.expires_at)
                .execute(&mut self.conn)
                .await?
            }
            Record::ScriptAsset(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO script_assets
                        (domain, name, version, size_bytes, source_map_available, url, timestamp)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                )
                .bind(&r.domain)
                .bind(&r.name)
                .bind(&r.version)
                .bind(to_i64("size_bytes", r.size_bytes)?)
                .bind(if r.source_map_available { 1_i64 } else { 0_i64 })
                .bind(&r.url)
                .bind(r.timestamp)
                .execute(&mut self.conn)
                .await?
            }
        };
        Ok(result.last_insert_rowid())
    }

    async fn query(
        &mut self,
        kind: EntityKind,
        filter: Option<QueryFilter>,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Page> {
        if let Some(filter) = &filter {
            filter.check(kind).map_err(EngineFailure::Rejected)?;
        }
        let (clause, bound) = match &filter {
            Some(filter) => {
                let (clause, value) = filter_clause(filter);
                (clause, Some(value))
            }
            None => ("", None),
        };
        let table = kind.table_name();

        // Page and total from the same snapshot
        let mut tx = self.conn.begin().await?;

        let select = format!(
            "SELECT {} FROM {} {} ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?",
            columns(kind),
            table,
            clause
        );
        let mut records = Vec::with_capacity(limit.min(1024));
        {
            let mut query = sqlx::query(&select);
            if let Some(value) = &bound {
                query = query.bind(value);
            }
            let mut rows = query
                .bind(saturating_i64(limit as u64))
                .bind(saturating_i64(offset as u64))
                .fetch(&mut *tx);
            // Step the cursor until it is exhausted
            while let Some(row) = rows.try_next().await? {
                records.push(decode_row(kind, &row)?);
            }
        }

        let count_sql = format!("SELECT COUNT(*) FROM {} {}", table, clause);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(value) = &bound {
            count_query = count_query.bind(value);
        }
        let total = count_query.fetch_one(&mut *tx).await?;
        tx.commit().await?;

        Ok(Page {
            records,
            total: total.max(0) as u64,
            limit,
            offset,
        })
    }

    async fn delete(&mut self, kind: EntityKind, id: RecordId) -> EngineResult<DeleteOutcome> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", kind.table_name());
        let result = sqlx::query(&sql).bind(id).execute(&mut self.conn).await?;
        Ok(if result.rows_affected() > 0 {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        })
    }

    async fn prune(
        &mut self,
        kind: EntityKind,
        cutoff: Timestamp,
        max_records: u64,
    ) -> EngineResult<EntityPruneStats> {
        let table = kind.table_name();
        let mut tx = self.conn.begin().await?;

        let expired = sqlx::query(&format!("DELETE FROM {} WHERE timestamp < ?1", table))
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        // Always runs, even when nothing expired
        let over_cap = sqlx::query(&format!(
            "DELETE FROM {table} WHERE id IN (
                SELECT id FROM {table} ORDER BY timestamp DESC, id DESC LIMIT -1 OFFSET ?1
            )",
            table = table
        ))
        .bind(saturating_i64(max_records))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let remaining: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(EntityPruneStats {
            expired,
            over_cap,
            remaining: remaining.max(0) as u64,
        })
    }

    async fn clear(&mut self, kind: EntityKind) -> EngineResult<u64> {
        let result = sqlx::query(&format!("DELETE FROM {}", kind.table_name()))
            .execute(&mut self.conn)
            .await?;
        Ok(result.rows_affected())
    }

    async fn size(&mut self) -> EngineResult<u64> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&mut self.conn)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&mut self.conn)
            .await?;
        Ok((page_count.max(0) as u64) * (page_size.max(0) as u64))
    }
}

async fn count(conn: &mut SqliteConnection, kind: EntityKind) -> EngineResult<u64> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", kind.table_name()))
        .fetch_one(conn)
        .await?;
    Ok(count.max(0) as u64)
}

/// Bounds past i64::MAX behave like "no bound" on SQLite
fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_i64(field: &str, value: u64) -> EngineResult<i64> {
    i64::try_from(value).map_err(|_| {
        EngineFailure::Rejected(ValidationError::new(
            field,
            format!("{} does not fit in a 64-bit signed column", value),
        ))
    })
}
