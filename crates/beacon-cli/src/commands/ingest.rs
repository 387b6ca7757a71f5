//! Ingest command - Insert records from a JSON Lines file

use anyhow::{Context, Result};
use beacon_store::{StorageCoordinator, StorageError};
use beacon_types::{EntityKind, RecordId};
use serde::Serialize;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Debug, Default, Serialize)]
pub struct IngestSummary {
    pub entity: Option<EntityKind>,
    pub inserted: usize,
    pub rejected: Vec<Rejection>,
    pub first_id: Option<RecordId>,
    pub last_id: Option<RecordId>,
}

#[derive(Debug, Serialize)]
pub struct Rejection {
    pub line: usize,
    pub reason: String,
}

pub async fn run(coordinator: &StorageCoordinator, kind: EntityKind, file: &Path) -> Result<()> {
    let handle = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let summary = ingest_lines(coordinator, kind, BufReader::new(handle)).await?;
    super::print_json(&summary)
}

/// Invalid lines are reported and skipped; any other failure aborts.
pub async fn ingest_lines<R>(
    coordinator: &StorageCoordinator,
    kind: EntityKind,
    reader: R,
) -> Result<IngestSummary>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut summary = IngestSummary {
        entity: Some(kind),
        ..IngestSummary::default()
    };
    let mut lines = reader.lines();
    let mut number = 0;

    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let outcome = match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(value) => coordinator.insert_json(kind, value).await,
            Err(e) => Err(StorageError::Serialization(e.to_string())),
        };
        match outcome {
            Ok(id) => {
                summary.inserted += 1;
                summary.first_id.get_or_insert(id);
                summary.last_id = Some(id);
            }
            Err(e @ (StorageError::Validation(_) | StorageError::Serialization(_))) => {
                warn!("Line {} rejected: {}", number, e);
                summary.rejected.push(Rejection {
                    line: number,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to insert line {}", number));
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_store::StorageConfig;

    #[tokio::test]
    async fn test_bad_lines_are_skipped() {
        let mut config = StorageConfig::in_memory();
        config.primary.enabled = false;
        config.retention.enabled = false;
        let coordinator = StorageCoordinator::open(config).await.unwrap();

        let input = br#"{"message": "boom", "timestamp": 10, "severity": "error", "origin_url": "https://a.io"}

{"message": "no timestamp", "severity": "warn", "origin_url": "https://a.io"}
not json
{"message": "late", "timestamp": 20, "severity": "info", "origin_url": "https://a.io"}
"#;
        let summary = ingest_lines(&coordinator, EntityKind::LoggedError, &input[..])
            .await
            .unwrap();

        assert_eq!(summary.inserted, 2);
        let lines: Vec<_> = summary.rejected.iter().map(|r| r.line).collect();
        assert_eq!(lines, vec![3, 4]);
        assert!(summary.rejected[0].reason.contains("timestamp"));
        assert_eq!(summary.first_id, Some(1));
        assert_eq!(summary.last_id, Some(2));
    }
}
