//! Engine Configuration
//!
//! The full configuration surface: partition table, compression
//! threshold, breaker tuning, monitoring thresholds, and sweep interval.
//! Loadable from a YAML file or built programmatically; validated once
//! at engine construction.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::compression::CompressionConfig;
use crate::cache::partition::PartitionConfig;
use crate::error::{Error, Result};
use crate::failover::BreakerConfig;
use crate::monitor::MonitoringConfig;

/// Compression section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    /// Payloads at or below this size are stored raw
    pub threshold_bytes: usize,
    /// LZ4 compression level
    pub level: i32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            threshold_bytes: 1024,
            level: 4,
        }
    }
}

/// Circuit breaker section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Failures within the window that open a circuit
    pub failure_threshold: u32,
    /// Sliding failure window in seconds
    pub window_secs: u64,
    /// Initial cooldown in seconds
    pub cooldown_secs: u64,
    /// Cooldown backoff cap in seconds
    pub backoff_cap_secs: u64,
    /// Deadline for any single tier call in milliseconds
    pub tier_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 30,
            cooldown_secs: 10,
            backoff_cap_secs: 300,
            tier_timeout_ms: 1_000,
        }
    }
}

/// Monitoring section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    /// Floor for the rolling overall hit ratio
    pub min_hit_ratio: f64,
    /// Ceiling for per-tier rolling p95 latency in milliseconds
    pub max_p95_latency_ms: u64,
    /// Rolling window length in seconds
    pub window_secs: u64,
    /// Samples required before alerts can fire
    pub min_samples: u64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            min_hit_ratio: 0.2,
            max_p95_latency_ms: 500,
            window_secs: 60,
            min_samples: 50,
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    30
}

/// Complete engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Partition table (name, capacity, TTL, policy)
    pub partitions: Vec<PartitionConfig>,
    /// Compression settings
    #[serde(default)]
    pub compression: CompressionSettings,
    /// Circuit breaker settings
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Monitoring thresholds
    #[serde(default)]
    pub monitoring: MonitoringSettings,
    /// Interval between TTL sweeps, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl EngineConfig {
    /// Load and validate a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.as_ref().display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints. Partition table validity is
    /// checked again by `PartitionRegistry::new`; this catches the rest.
    pub fn validate(&self) -> Result<()> {
        if self.partitions.is_empty() {
            return Err(Error::Config("partition table is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.monitoring.min_hit_ratio) {
            return Err(Error::Config(format!(
                "min_hit_ratio must be within [0, 1], got {}",
                self.monitoring.min_hit_ratio
            )));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config("failure_threshold must be positive".to_string()));
        }
        if self.breaker.tier_timeout_ms == 0 {
            return Err(Error::Config("tier_timeout_ms must be positive".to_string()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::Config("sweep_interval_secs must be positive".to_string()));
        }
        Ok(())
    }

    /// Breaker config in the failover layer's terms.
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            window: Duration::from_secs(self.breaker.window_secs),
            cooldown: Duration::from_secs(self.breaker.cooldown_secs),
            backoff_cap: Duration::from_secs(self.breaker.backoff_cap_secs),
        }
    }

    /// Monitoring config in the monitor layer's terms.
    pub fn monitoring_config(&self) -> MonitoringConfig {
        MonitoringConfig {
            min_hit_ratio: self.monitoring.min_hit_ratio,
            max_p95_latency_ms: self.monitoring.max_p95_latency_ms,
            window: Duration::from_secs(self.monitoring.window_secs),
            min_samples: self.monitoring.min_samples,
        }
    }

    /// Compression config in the codec's terms.
    pub fn compression_config(&self) -> CompressionConfig {
        CompressionConfig {
            threshold_bytes: self.compression.threshold_bytes,
            level: self.compression.level,
        }
    }

    /// Per-call tier deadline.
    pub fn tier_timeout(&self) -> Duration {
        Duration::from_millis(self.breaker.tier_timeout_ms)
    }

    /// Interval between TTL sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::partition::EvictionMode;
    use assert_matches::assert_matches;

    const SAMPLE_YAML: &str = r#"
partitions:
  - name: feed_posts
    capacity_bytes: 52428800
    default_ttl_secs: 1800
    eviction_policy: lru
  - name: media_meta
    capacity_bytes: 8388608
    default_ttl_secs: 600
    eviction_policy: ttl-only
compression:
  threshold_bytes: 2048
  level: 6
breaker:
  failure_threshold: 5
  window_secs: 30
  cooldown_secs: 10
  backoff_cap_secs: 120
  tier_timeout_ms: 500
monitoring:
  min_hit_ratio: 0.3
  max_p95_latency_ms: 250
  window_secs: 60
  min_samples: 20
sweep_interval_secs: 15
"#;

    #[test]
    fn test_parse_full_yaml() {
        let config: EngineConfig = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        config.validate().unwrap();

        assert_eq!(config.partitions.len(), 2);
        assert_eq!(config.partitions[0].name, "feed_posts");
        assert_eq!(config.partitions[1].eviction_policy, EvictionMode::TtlOnly);
        assert_eq!(config.compression.threshold_bytes, 2048);
        assert_eq!(config.breaker_config().cooldown, Duration::from_secs(10));
        assert_eq!(config.monitoring_config().min_samples, 20);
        assert_eq!(config.tier_timeout(), Duration::from_millis(500));
        assert_eq!(config.sweep_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_defaults_fill_optional_sections() {
        let yaml = r#"
partitions:
  - name: p
    capacity_bytes: 1024
    default_ttl_secs: 60
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.monitoring.max_p95_latency_ms, 500);
        assert_eq!(config.sweep_interval_secs, 30);
    }

    #[test]
    fn test_rejects_empty_partitions() {
        let config: EngineConfig = serde_yaml::from_str("partitions: []\n").unwrap();
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_rejects_bad_hit_ratio() {
        let mut config: EngineConfig = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        config.monitoring.min_hit_ratio = 1.5;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, SAMPLE_YAML).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.partitions.len(), 2);
    }

    #[test]
    fn test_from_file_missing() {
        assert!(EngineConfig::from_file("/nonexistent/engine.yaml").is_err());
    }
}
