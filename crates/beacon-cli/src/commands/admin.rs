//! Administrative commands: delete, prune, clear, retain

use anyhow::{Context, Result};
use beacon_store::StorageCoordinator;
use beacon_types::{now_millis, EntityKind, RecordId};
use serde_json::json;
use std::time::Duration;
use tracing::info;

pub async fn delete(coordinator: &StorageCoordinator, kind: EntityKind, id: RecordId) -> Result<()> {
    let outcome = coordinator.delete_by_id(kind, id).await?;
    super::print_json(&json!({ "entity": kind, "id": id, "outcome": outcome }))
}

pub async fn prune(
    coordinator: &StorageCoordinator,
    max_age: Duration,
    max_records: u64,
) -> Result<()> {
    let age = i64::try_from(max_age.as_millis()).context("--max-age is too large")?;
    let cutoff = now_millis().saturating_sub(age);
    let report = coordinator.prune_older_than(cutoff, max_records).await?;
    super::print_json(&report)
}

pub async fn clear(coordinator: &StorageCoordinator, kind: EntityKind) -> Result<()> {
    let removed = coordinator.clear(kind).await?;
    super::print_json(&json!({ "entity": kind, "removed": removed }))
}

pub async fn retain(coordinator: &StorageCoordinator, once: bool) -> Result<()> {
    if once {
        let report = coordinator.run_retention_once().await?;
        return super::print_json(&report);
    }

    coordinator.start_retention().await;
    info!("Retention running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupted");
    Ok(())
}
