//! Retention pruner
//!
//! Periodically deletes records older than each entity's maximum age, then
//! trims every entity down to its record cap, keeping the newest.

use beacon_types::{now_millis, EntityKind, PruneReport, Timestamp};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::engine::StoreEngine;
use crate::error::Result;

/// Age and count limits for one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLimits {
    pub max_age: Duration,
    pub max_records: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub defaults: EntityLimits,
    pub overrides: BTreeMap<EntityKind, EntityLimits>,
    pub interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        crate::config::RetentionConfig::default().policy()
    }
}

impl RetentionPolicy {
    pub fn limits_for(&self, kind: EntityKind) -> EntityLimits {
        self.overrides.get(&kind).copied().unwrap_or(self.defaults)
    }

    /// Timestamps strictly below this are expired for `kind`
    pub fn cutoff_for(&self, kind: EntityKind, now: Timestamp) -> Timestamp {
        let age = i64::try_from(self.limits_for(kind).max_age.as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(age)
    }
}

/// Apply one cutoff and cap to every entity, then flush the engine
pub async fn prune_all(
    engine: &dyn StoreEngine,
    limits: impl Fn(EntityKind) -> (Timestamp, u64),
) -> Result<PruneReport> {
    let mut report = PruneReport::default();
    for kind in EntityKind::ALL {
        let (cutoff, max_records) = limits(kind);
        let stats = engine.prune(kind, cutoff, max_records).await?;
        report.entities.insert(kind, stats);
    }
    engine.flush().await?;
    Ok(report)
}

pub struct RetentionPruner {
    engine: Arc<dyn StoreEngine>,
    policy: RetentionPolicy,
}

impl RetentionPruner {
    pub fn new(engine: Arc<dyn StoreEngine>, policy: RetentionPolicy) -> Self {
        Self { engine, policy }
    }

    /// One pass over every entity
    pub async fn run_once(&self) -> Result<PruneReport> {
        let now = now_millis();
        let report = prune_all(self.engine.as_ref(), |kind| {
            (
                self.policy.cutoff_for(kind, now),
                self.policy.limits_for(kind).max_records,
            )
        })
        .await?;
        if report.total_removed() > 0 {
            info!("Retention removed {} record(s)", report.total_removed());
        } else {
            debug!("Retention pass removed nothing");
        }
        Ok(report)
    }

    /// Run on the policy interval until the returned handle is dropped.
    /// The first pass happens immediately.
    pub fn spawn(self) -> PrunerHandle {
        let interval = self.policy.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    // Keep going; the next pass may succeed
                    error!("Retention pass failed: {}", e);
                }
            }
        });
        info!("Retention pruner started (every {:?})", interval);
        PrunerHandle { task: Some(task) }
    }
}

/// Owns the background pruning task. Stops it exactly once.
pub struct PrunerHandle {
    task: Option<JoinHandle<()>>,
}

impl PrunerHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Stop the task and wait for it to wind down
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            info!("Retention pruner stopped");
        }
    }
}

impl Drop for PrunerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
