//! Configuration for the storage subsystem
//!
//! Every section has defaults, so an empty (or absent) file yields a working
//! in-memory setup. Files may be YAML, TOML or JSON; the format is picked from
//! the extension.

use beacon_types::EntityKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::RetryPolicy;
use crate::error::{Result, StorageError};
use crate::pruner::{EntityLimits, RetentionPolicy};

/// Longest accepted pruning interval
pub const MAX_PRUNE_INTERVAL: Duration = Duration::from_secs(366 * 24 * 3600);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub primary: PrimaryConfig,
    pub channel: ChannelConfig,
    pub fallback: FallbackConfig,
    pub retention: RetentionConfig,
}

impl StorageConfig {
    /// Load configuration, layering the optional file over the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            tracing::info!("Loading storage configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: StorageConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// In-memory primary, no snapshot, default channel and retention
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel.max_attempts == 0 {
            return Err(StorageError::Config(
                "channel.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.channel.mailbox_capacity == 0 {
            return Err(StorageError::Config(
                "channel.mailbox_capacity must be at least 1".to_string(),
            ));
        }
        if self.retention.max_records_per_entity == 0 {
            return Err(StorageError::Config(
                "retention.max_records_per_entity must be at least 1".to_string(),
            ));
        }
        if self.retention.prune_interval_units == 0 {
            return Err(StorageError::Config(
                "retention.prune_interval_units must be at least 1".to_string(),
            ));
        }
        self.retention.validate_durations()?;
        parse_version(&self.primary.min_sqlite_version).ok_or_else(|| {
            StorageError::Config(format!(
                "primary.min_sqlite_version is not a version: {}",
                self.primary.min_sqlite_version
            ))
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimaryConfig {
    /// When false the fallback engine is used unconditionally
    pub enabled: bool,
    /// SQLite database file; in-memory when unset
    pub database_path: Option<PathBuf>,
    /// Lowest SQLite version the primary engine accepts
    pub min_sqlite_version: String,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: None,
            min_sqlite_version: "3.24.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Total delivery attempts for a "receiver not ready" failure
    pub max_attempts: u32,
    /// Linear backoff step; attempt `n` waits `n * base_delay_ms`
    pub base_delay_ms: u64,
    /// How long to wait for a reply once a request was delivered
    pub request_timeout_ms: u64,
    pub mailbox_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            request_timeout_ms: 10_000,
            mailbox_capacity: 256,
        }
    }
}

impl ChannelConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// JSON snapshot file; purely in-memory when unset
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Hours,
    Minutes,
    Seconds,
}

impl TimeUnit {
    fn seconds(self) -> u64 {
        match self {
            TimeUnit::Hours => 3600,
            TimeUnit::Minutes => 60,
            TimeUnit::Seconds => 1,
        }
    }

    /// `None` when `units` of this unit overflow a `u64` of seconds
    pub fn checked_duration(self, units: u64) -> Option<Duration> {
        units.checked_mul(self.seconds()).map(Duration::from_secs)
    }

    /// Saturates at `Duration::MAX`
    pub fn duration(self, units: u64) -> Duration {
        self.checked_duration(units).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Start the background pruner when the store opens
    pub enabled: bool,
    /// Records older than this are deleted first
    pub max_age_in_units: u64,
    /// Hard per-entity cap enforced after age-based deletion
    pub max_records_per_entity: u64,
    /// How often the pruner runs
    pub prune_interval_units: u64,
    pub unit: TimeUnit,
    /// Per-entity replacements for the limits above
    pub overrides: BTreeMap<EntityKind, EntityOverride>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_in_units: 24 * 7,
            max_records_per_entity: 10_000,
            prune_interval_units: 24,
            unit: TimeUnit::Hours,
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityOverride {
    pub max_age_in_units: Option<u64>,
    pub max_records_per_entity: Option<u64>,
}

impl RetentionConfig {
    fn checked(&self, field: &str, units: u64) -> Result<Duration> {
        self.unit.checked_duration(units).ok_or_else(|| {
            StorageError::Config(format!("{} of {} {:?} is too long", field, units, self.unit))
        })
    }

    fn validate_durations(&self) -> Result<()> {
        self.checked("retention.max_age_in_units", self.max_age_in_units)?;
        for (kind, o) in &self.overrides {
            if let Some(units) = o.max_age_in_units {
                self.checked(
                    &format!("retention.overrides.{}.max_age_in_units", kind),
                    units,
                )?;
            }
        }
        let interval = self.checked("retention.prune_interval_units", self.prune_interval_units)?;
        if interval > MAX_PRUNE_INTERVAL {
            return Err(StorageError::Config(format!(
                "retention.prune_interval_units must not exceed {:?}",
                MAX_PRUNE_INTERVAL
            )));
        }
        Ok(())
    }

    /// Durations saturate; `StorageConfig::validate` rejects the ones that would
    pub fn policy(&self) -> RetentionPolicy {
        let defaults = EntityLimits {
            max_age: self.unit.duration(self.max_age_in_units),
            max_records: self.max_records_per_entity,
        };
        let overrides = self
            .overrides
            .iter()
            .map(|(kind, o)| {
                let limits = EntityLimits {
                    max_age: o
                        .max_age_in_units
                        .map(|units| self.unit.duration(units))
                        .unwrap_or(defaults.max_age),
                    max_records: o.max_records_per_entity.unwrap_or(defaults.max_records),
                };
                (*kind, limits)
            })
            .collect();
        RetentionPolicy {
            defaults,
            overrides,
            interval: self.unit.duration(self.prune_interval_units),
        }
    }
}

/// Parse "3.45.1" into comparable parts. Missing components count as 0.
pub(crate) fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().split('.').map(|p| p.parse::<u32>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().unwrap_or(Ok(0)).ok()?;
    let patch = parts.next().unwrap_or(Ok(0)).ok()?;
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = StorageConfig::load(None).unwrap();
        assert_eq!(config, StorageConfig::default());
        assert_eq!(config.channel.max_attempts, 5);
        assert_eq!(config.retention.policy().interval, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_load_yaml_with_overrides() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
channel:
  max_attempts: 3
  base_delay_ms: 10
retention:
  max_age_in_units: 30
  max_records_per_entity: 500
  prune_interval_units: 5
  unit: minutes
  overrides:
    token_event:
      max_records_per_entity: 50
"#
        )
        .unwrap();

        let config = StorageConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.channel.max_attempts, 3);
        assert_eq!(config.channel.request_timeout_ms, 10_000);

        let policy = config.retention.policy();
        assert_eq!(policy.interval, Duration::from_secs(300));
        assert_eq!(policy.limits_for(EntityKind::TokenEvent).max_records, 50);
        assert_eq!(
            policy.limits_for(EntityKind::TokenEvent).max_age,
            Duration::from_secs(30 * 60)
        );
        assert_eq!(policy.limits_for(EntityKind::CapturedCall).max_records, 500);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = StorageConfig::default();
        config.channel.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overflowing_durations_rejected() {
        let huge = u64::MAX / 1000;
        assert_eq!(TimeUnit::Hours.checked_duration(huge), None);
        assert_eq!(
            TimeUnit::Seconds.checked_duration(huge),
            Some(Duration::from_secs(huge))
        );

        let mut config = StorageConfig::default();
        config.retention.max_age_in_units = huge;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_age_in_units"), "{}", err);

        // Still usable without validation, clamped to the longest age
        let policy = config.retention.policy();
        assert_eq!(policy.defaults.max_age, Duration::MAX);
        assert_eq!(policy.cutoff_for(EntityKind::CapturedCall, 1_000), 1_000 - i64::MAX);

        let mut config = StorageConfig::default();
        config.retention.overrides.insert(
            EntityKind::LoggedError,
            EntityOverride {
                max_age_in_units: Some(huge),
                max_records_per_entity: None,
            },
        );
        assert!(config.validate().is_err());

        let mut config = StorageConfig::default();
        config.retention.prune_interval_units = 24 * 400;
        assert!(config.validate().is_err());
        config.retention.prune_interval_units = 24 * 365;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("3.45.1"), Some((3, 45, 1)));
        assert_eq!(parse_version("99"), Some((99, 0, 0)));
        assert_eq!(parse_version("x.y"), None);
        assert!(parse_version("3.8.3") < parse_version("3.24.0"));
    }
}
