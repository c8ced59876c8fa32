//! Configuration for a Baton device session.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;
use crate::types::{DEFAULT_DISTANCES, DEFAULT_PACE_SECS};

/// Top-level configuration, loaded from TOML (or JSON by extension).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatonConfig {
    #[serde(default)]
    pub race: RaceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Course layout and placeholder defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceConfig {
    /// Leg distances in miles; the length is the leg count.
    #[serde(default = "default_distances")]
    pub distances: Vec<f64>,

    /// Pace for placeholder runners, seconds per mile.
    #[serde(default = "default_pace_secs")]
    pub default_pace_secs: u32,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            distances: default_distances(),
            default_pace_secs: default_pace_secs(),
        }
    }
}

/// Sync coordinator timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Quiet period before a realtime-triggered refetch runs.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Interval of the reconciliation fetch.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// How long a subscription may take to be confirmed.
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,

    /// Reconnection attempts per channel before it is abandoned.
    #[serde(default = "default_max_subscribe_attempts")]
    pub max_subscribe_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Window in which identical broadcast signals are ignored.
    #[serde(default = "default_broadcast_dedup_window_ms")]
    pub broadcast_dedup_window_ms: u64,

    #[serde(default = "default_push_max_attempts")]
    pub push_max_attempts: u32,

    /// Per-attempt timeout for remote calls.
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,

    /// Consecutive remote failures before the breaker opens.
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    #[serde(default = "default_breaker_recovery_ms")]
    pub breaker_recovery_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            max_subscribe_attempts: default_max_subscribe_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            broadcast_dedup_window_ms: default_broadcast_dedup_window_ms(),
            push_max_attempts: default_push_max_attempts(),
            push_timeout_ms: default_push_timeout_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_recovery_ms: default_breaker_recovery_ms(),
        }
    }
}

impl SyncConfig {
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub const fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub const fn broadcast_dedup_window(&self) -> Duration {
        Duration::from_millis(self.broadcast_dedup_window_ms)
    }

    pub const fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub const fn breaker_recovery(&self) -> Duration {
        Duration::from_millis(self.breaker_recovery_ms)
    }
}

/// Event bus batching for low-priority work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_low_batch_size")]
    pub low_batch_size: usize,

    #[serde(default = "default_low_batch_delay_ms")]
    pub low_batch_delay_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            low_batch_size: default_low_batch_size(),
            low_batch_delay_ms: default_low_batch_delay_ms(),
        }
    }
}

impl BusConfig {
    pub const fn low_batch_delay(&self) -> Duration {
        Duration::from_millis(self.low_batch_delay_ms)
    }
}

/// Where per-team state is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl BatonConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `TomlParseFailed` for malformed input and `InvalidConfig` when
    /// the parsed values fail [`BatonConfig::validate`].
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::TomlParseFailed {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file; `.json` files are parsed as JSON, anything else as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;

        if path.extension().is_some_and(|e| e == "json") {
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| Error::json_parse_failed(e.to_string()))?;
            config.validate()?;
            Ok(config)
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Reject values the projection cannot work with.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first offending value.
    pub fn validate(&self) -> Result<()> {
        if self.race.distances.is_empty() {
            return Err(Error::invalid_config("race.distances must not be empty"));
        }
        if let Some((index, distance)) = self
            .race
            .distances
            .iter()
            .enumerate()
            .find(|(_, d)| !d.is_finite() || **d <= 0.0)
        {
            return Err(Error::invalid_config(format!(
                "race.distances[{index}] must be positive, got {distance}"
            )));
        }
        if self.race.default_pace_secs == 0 {
            return Err(Error::invalid_config("race.default_pace_secs must be positive"));
        }
        if self.bus.low_batch_size == 0 {
            return Err(Error::invalid_config("bus.low_batch_size must be positive"));
        }
        Ok(())
    }
}

fn default_distances() -> Vec<f64> {
    DEFAULT_DISTANCES.to_vec()
}

const fn default_pace_secs() -> u32 {
    DEFAULT_PACE_SECS
}

const fn default_debounce_ms() -> u64 {
    300
}

const fn default_reconcile_interval_secs() -> u64 {
    30
}

const fn default_subscribe_timeout_ms() -> u64 {
    10_000
}

const fn default_max_subscribe_attempts() -> u32 {
    5
}

const fn default_backoff_base_ms() -> u64 {
    1_000
}

const fn default_backoff_max_ms() -> u64 {
    30_000
}

const fn default_broadcast_dedup_window_ms() -> u64 {
    2_000
}

const fn default_push_max_attempts() -> u32 {
    3
}

const fn default_push_timeout_ms() -> u64 {
    10_000
}

const fn default_breaker_failure_threshold() -> u32 {
    5
}

const fn default_breaker_recovery_ms() -> u64 {
    30_000
}

const fn default_low_batch_size() -> usize {
    10
}

const fn default_low_batch_delay_ms() -> u64 {
    5
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".baton")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn should_fill_every_section_with_defaults_from_empty_toml() {
        let config = BatonConfig::from_toml_str("").unwrap();

        assert_eq!(config, BatonConfig::default());
        assert_eq!(config.race.distances.len(), 36);
        assert_eq!(config.sync.max_subscribe_attempts, 5);
    }

    #[test]
    fn should_override_only_given_fields() {
        let config = BatonConfig::from_toml_str(
            r"
            [race]
            distances = [3.0, 4.5]

            [sync]
            debounce_ms = 50
            ",
        )
        .unwrap();

        assert_eq!(config.race.distances, vec![3.0, 4.5]);
        assert_eq!(config.race.default_pace_secs, DEFAULT_PACE_SECS);
        assert_eq!(config.sync.debounce(), Duration::from_millis(50));
        assert_eq!(config.sync.reconcile_interval_secs, 30);
    }

    #[test]
    fn should_reject_non_positive_distance() {
        let result = BatonConfig::from_toml_str("[race]\ndistances = [3.0, 0.0]");

        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn should_reject_malformed_toml() {
        let result = BatonConfig::from_toml_str("[race\n");

        assert!(matches!(result, Err(Error::TomlParseFailed { .. })));
    }

    #[test]
    fn should_load_json_config_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baton.json");
        std::fs::write(&path, r#"{"bus":{"low_batch_size":4}}"#).unwrap();

        let config = BatonConfig::from_file(&path).unwrap();

        assert_eq!(config.bus.low_batch_size, 4);
        assert_eq!(config.bus.low_batch_delay_ms, 5);
    }
}
