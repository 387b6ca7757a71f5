//! JSON snapshot of the fallback engine's tables

use beacon_types::{EntityKind, RecordId, StoredRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::Result;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub version: u32,
    pub tables: BTreeMap<EntityKind, TableSnapshot>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct TableSnapshot {
    pub next_id: RecordId,
    pub records: Vec<StoredRecord>,
}

impl Snapshot {
    pub(crate) fn new(tables: BTreeMap<EntityKind, TableSnapshot>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            tables,
        }
    }
}

/// Read a snapshot; a missing file is an empty store
pub(crate) async fn load(path: &Path) -> Result<Option<Snapshot>> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No snapshot at {}", path.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let snapshot: Snapshot = serde_json::from_slice(&content)?;
    info!(
        "Loaded snapshot from {} ({} tables)",
        path.display(),
        snapshot.tables.len()
    );
    Ok(Some(snapshot))
}

/// Write next to the target, then rename over it
pub(crate) async fn save(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_vec(snapshot)?;
    let temp = temp_path(path);
    tokio::fs::write(&temp, content).await?;
    tokio::fs::rename(&temp, path).await?;
    debug!("Snapshot written to {}", path.display());
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_types::{Record, ScriptAsset};

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("absent.json")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("fallback.json");

        let mut tables = BTreeMap::new();
        tables.insert(
            EntityKind::ScriptAsset,
            TableSnapshot {
                next_id: 8,
                records: vec![StoredRecord {
                    id: 7,
                    record: Record::from(ScriptAsset {
                        domain: "cdn.example.com".into(),
                        name: "app".into(),
                        version: "2.1.0".into(),
                        size_bytes: 1 << 20,
                        source_map_available: true,
                        url: "https://cdn.example.com/app.js".into(),
                        timestamp: 1_700_000_000_000,
                    }),
                }],
            },
        );
        save(&path, &Snapshot::new(tables)).await.unwrap();
        assert!(!temp_path(&path).exists());

        let loaded = load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.version, SNAPSHOT_VERSION);
        let table = &loaded.tables[&EntityKind::ScriptAsset];
        assert_eq!(table.next_id, 8);
        assert_eq!(table.records[0].id, 7);
        assert_eq!(table.records[0].kind(), EntityKind::ScriptAsset);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let err = load(&path).await.unwrap_err();
        assert!(matches!(err, crate::error::StorageError::Serialization(_)));
    }
}
