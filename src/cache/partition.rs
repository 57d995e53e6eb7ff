//! Partition Registry
//!
//! Named, independently capacity- and TTL-managed subdivisions of the
//! keyspace. The table is fixed at initialization from configuration and
//! read-only afterwards; an unknown partition name is a caller error.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a partition sheds entries under capacity pressure.
///
/// TTL-expired entries are always removed first, regardless of mode; the
/// mode only orders the still-valid candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionMode {
    /// Least-recently-used entries go first
    Lru,
    /// Soonest-to-expire entries go first
    TtlOnly,
}

impl Default for EvictionMode {
    fn default() -> Self {
        EvictionMode::Lru
    }
}

/// Configuration of a single partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Partition name (unique)
    pub name: String,
    /// Maximum bytes of stored entries (envelope size) in L1
    pub capacity_bytes: u64,
    /// Default entry TTL in seconds, applied unless a set overrides it
    pub default_ttl_secs: u64,
    /// Eviction ordering under capacity pressure
    #[serde(default)]
    pub eviction_policy: EvictionMode,
}

impl PartitionConfig {
    /// Default TTL as a Duration
    #[inline]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Read-only table of partitions, keyed by name.
#[derive(Debug)]
pub struct PartitionRegistry {
    partitions: HashMap<String, PartitionConfig>,
    // Stable iteration order for sweeps and snapshots
    names: Vec<String>,
}

impl PartitionRegistry {
    /// Build the registry from a configured partition table.
    ///
    /// Rejects empty tables, duplicate names, and zero capacities.
    pub fn new(configs: Vec<PartitionConfig>) -> Result<Self> {
        if configs.is_empty() {
            return Err(Error::Config("partition table is empty".to_string()));
        }

        let mut partitions = HashMap::with_capacity(configs.len());
        let mut names = Vec::with_capacity(configs.len());

        for config in configs {
            if config.name.is_empty() {
                return Err(Error::Config("partition name is empty".to_string()));
            }
            if config.capacity_bytes == 0 {
                return Err(Error::Config(format!(
                    "partition {} has zero capacity",
                    config.name
                )));
            }
            if config.default_ttl_secs == 0 {
                return Err(Error::Config(format!(
                    "partition {} has zero TTL",
                    config.name
                )));
            }
            if partitions.contains_key(&config.name) {
                return Err(Error::Config(format!(
                    "duplicate partition: {}",
                    config.name
                )));
            }
            names.push(config.name.clone());
            partitions.insert(config.name.clone(), config);
        }

        Ok(Self { partitions, names })
    }

    /// Look up a partition's configuration.
    pub fn config_for(&self, name: &str) -> Result<&PartitionConfig> {
        self.partitions
            .get(name)
            .ok_or_else(|| Error::InvalidPartition(name.to_string()))
    }

    /// Whether a partition exists.
    pub fn contains(&self, name: &str) -> bool {
        self.partitions.contains_key(name)
    }

    /// Partition names in configuration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of partitions.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// True if no partitions are configured (never after construction).
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn partition(name: &str, capacity: u64, ttl_secs: u64) -> PartitionConfig {
        PartitionConfig {
            name: name.to_string(),
            capacity_bytes: capacity,
            default_ttl_secs: ttl_secs,
            eviction_policy: EvictionMode::Lru,
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = PartitionRegistry::new(vec![
            partition("feed_posts", 50 * 1024 * 1024, 1800),
            partition("user_profiles", 8 * 1024 * 1024, 3600),
        ])
        .unwrap();

        let config = registry.config_for("feed_posts").unwrap();
        assert_eq!(config.capacity_bytes, 50 * 1024 * 1024);
        assert_eq!(config.default_ttl(), Duration::from_secs(1800));

        assert!(registry.contains("user_profiles"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_unknown_partition() {
        let registry = PartitionRegistry::new(vec![partition("p", 1024, 60)]).unwrap();

        assert_matches!(
            registry.config_for("nonexistent"),
            Err(Error::InvalidPartition(name)) if name == "nonexistent"
        );
    }

    #[test]
    fn test_registry_rejects_empty_table() {
        assert_matches!(PartitionRegistry::new(vec![]), Err(Error::Config(_)));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let result = PartitionRegistry::new(vec![
            partition("p", 1024, 60),
            partition("p", 2048, 60),
        ]);
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[test]
    fn test_registry_rejects_zero_capacity() {
        assert_matches!(
            PartitionRegistry::new(vec![partition("p", 0, 60)]),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_names_preserve_order() {
        let registry = PartitionRegistry::new(vec![
            partition("c", 10, 1),
            partition("a", 10, 1),
            partition("b", 10, 1),
        ])
        .unwrap();
        assert_eq!(registry.names(), &["c", "a", "b"]);
    }

    #[test]
    fn test_eviction_mode_serde() {
        let yaml = "name: p\ncapacity_bytes: 1024\ndefault_ttl_secs: 60\neviction_policy: ttl-only\n";
        let config: PartitionConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.eviction_policy, EvictionMode::TtlOnly);

        let yaml_default = "name: p\ncapacity_bytes: 1024\ndefault_ttl_secs: 60\n";
        let config: PartitionConfig = serde_yaml::from_str(yaml_default).unwrap();
        assert_eq!(config.eviction_policy, EvictionMode::Lru);
    }
}
