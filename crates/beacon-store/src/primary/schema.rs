//! Table layout and row mapping for the SQLite engine

use beacon_types::{
    CapturedCall, EntityKind, LoggedError, QueryFilter, Record, ScriptAsset, Severity,
    StoredRecord, TokenEvent, TokenKind,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Applied in order, each statement idempotent
pub(crate) const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS captured_calls (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url TEXT NOT NULL,
        method TEXT NOT NULL,
        headers TEXT NOT NULL DEFAULT '',
        payload_size INTEGER NOT NULL DEFAULT 0,
        status INTEGER NOT NULL DEFAULT 0,
        response_body TEXT NOT NULL DEFAULT '',
        timestamp INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_captured_calls_timestamp ON captured_calls (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_captured_calls_url ON captured_calls (url)",
    r#"
    CREATE TABLE IF NOT EXISTS logged_errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message TEXT NOT NULL,
        stack TEXT,
        timestamp INTEGER NOT NULL,
        severity TEXT NOT NULL CHECK (severity IN ('error', 'warn', 'info')),
        origin_url TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_logged_errors_timestamp ON logged_errors (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_logged_errors_severity ON logged_errors (severity)",
    r#"
    CREATE TABLE IF NOT EXISTS token_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL CHECK (kind IN ('jwt', 'session', 'api-key', 'oauth')),
        value_digest TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        source_url TEXT NOT NULL,
        expires_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_token_events_timestamp ON token_events (timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS script_assets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        domain TEXT NOT NULL,
        name TEXT NOT NULL,
        version TEXT NOT NULL,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        source_map_available INTEGER NOT NULL CHECK (source_map_available IN (0, 1)),
        url TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_script_assets_timestamp ON script_assets (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_script_assets_domain ON script_assets (domain)",
];

/// Column list in the order `decode_row` expects
pub(crate) fn columns(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::CapturedCall => {
            "id, url, method, headers, payload_size, status, response_body, timestamp"
        }
        EntityKind::LoggedError => "id, message, stack, timestamp, severity, origin_url",
        EntityKind::TokenEvent => "id, kind, value_digest, timestamp, source_url, expires_at",
        EntityKind::ScriptAsset => {
            "id, domain, name, version, size_bytes, source_map_available, url, timestamp"
        }
    }
}

/// WHERE clause and bound value for a secondary-index filter
pub(crate) fn filter_clause(filter: &QueryFilter) -> (&'static str, String) {
    match filter {
        QueryFilter::Url(url) => ("WHERE url = ?", url.clone()),
        QueryFilter::Severity(severity) => ("WHERE severity = ?", severity.to_string()),
        QueryFilter::Domain(domain) => ("WHERE domain = ?", domain.clone()),
    }
}

fn decode_err(e: beacon_types::ValidationError) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

fn unsigned(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub(crate) fn decode_row(kind: EntityKind, row: &SqliteRow) -> Result<StoredRecord, sqlx::Error> {
    let id: i64 = row.try_get("id")?;
    let record = match kind {
        EntityKind::CapturedCall => Record::CapturedCall(CapturedCall {
            url: row.try_get("url")?,
            method: row.try_get("method")?,
            headers: row.try_get("headers")?,
            payload_size: unsigned(row.try_get("payload_size")?),
            status: u16::try_from(row.try_get::<i64, _>("status")?).unwrap_or(0),
            response_body: row.try_get("response_body")?,
            timestamp: row.try_get("timestamp")?,
        }),
        EntityKind::LoggedError => Record::LoggedError(LoggedError {
            message: row.try_get("message")?,
            stack: row.try_get("stack")?,
            timestamp: row.try_get("timestamp")?,
            severity: row
                .try_get::<String, _>("severity")?
                .parse::<Severity>()
                .map_err(decode_err)?,
            origin_url: row.try_get("origin_url")?,
        }),
        EntityKind::TokenEvent => Record::TokenEvent(TokenEvent {
            kind: row
                .try_get::<String, _>("kind")?
                .parse::<TokenKind>()
                .map_err(decode_err)?,
            value_digest: row.try_get("value_digest")?,
            timestamp: row.try_get("timestamp")?,
            source_url: row.try_get("source_url")?,
            expires_at: row.try_get("expires_at")?,
        }),
        EntityKind::ScriptAsset => Record::ScriptAsset(ScriptAsset {
            domain: row.try_get("domain")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            size_bytes: unsigned(row.try_get("size_bytes")?),
            // Stored as 0/1
            source_map_available: row.try_get::<i64, _>("source_map_available")? != 0,
            url: row.try_get("url")?,
            timestamp: row.try_get("timestamp")?,
        }),
    };
    Ok(StoredRecord { id, record })
}
