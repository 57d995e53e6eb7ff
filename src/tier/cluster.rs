//! L3 Tier - Distributed Cluster (simulated)
//!
//! Stands in for a distributed peer cache behind the tier contract: N
//! in-memory nodes, key→node placement by hash, per-call simulated
//! latency, and per-node failure injection so breaker behavior can be
//! exercised without a real cluster. The tier is treated as possibly-cold
//! and ignores TTL; expiry is enforced by the envelope at read time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::cache::entry::fx_hash;
use crate::error::{Error, Result};
use crate::tier::{ScanItem, TierId, TierStore};

/// Cluster simulation configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of simulated nodes
    pub nodes: usize,
    /// Latency added to every call
    pub simulated_latency: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            simulated_latency: Duration::ZERO,
        }
    }
}

struct ClusterNode {
    /// "partition\x00key" → stored bytes
    data: DashMap<String, Bytes>,
    down: AtomicBool,
}

impl ClusterNode {
    fn new() -> Self {
        Self {
            data: DashMap::new(),
            down: AtomicBool::new(false),
        }
    }

    fn is_down(&self) -> bool {
        self.down.load(Ordering::Relaxed)
    }
}

/// Simulated distributed cluster tier.
pub struct ClusterTier {
    nodes: Vec<ClusterNode>,
    latency: Duration,
}

impl ClusterTier {
    /// Create the cluster with the configured node count.
    pub fn new(config: ClusterConfig) -> Self {
        let node_count = config.nodes.max(1);
        Self {
            nodes: (0..node_count).map(|_| ClusterNode::new()).collect(),
            latency: config.simulated_latency,
        }
    }

    fn map_key(partition: &str, key: &str) -> String {
        format!("{partition}\x00{key}")
    }

    fn node_for(&self, key: &str) -> &ClusterNode {
        let idx = (fx_hash(key.as_bytes()) as usize) % self.nodes.len();
        &self.nodes[idx]
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn unavailable(&self) -> Error {
        Error::TierUnavailable {
            tier: TierId::L3Cluster,
            reason: "node unreachable".to_string(),
        }
    }

    /// Take a node offline (test/failure-injection hook).
    pub fn fail_node(&self, index: usize) {
        if let Some(node) = self.nodes.get(index) {
            node.down.store(true, Ordering::Relaxed);
        }
    }

    /// Bring a node back online.
    pub fn restore_node(&self, index: usize) {
        if let Some(node) = self.nodes.get(index) {
            node.down.store(false, Ordering::Relaxed);
        }
    }

    /// Take every node offline.
    pub fn fail_all(&self) {
        for node in &self.nodes {
            node.down.store(true, Ordering::Relaxed);
        }
    }

    /// Bring every node back online.
    pub fn restore_all(&self) {
        for node in &self.nodes {
            node.down.store(false, Ordering::Relaxed);
        }
    }

    /// Number of simulated nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[async_trait]
impl TierStore for ClusterTier {
    fn id(&self) -> TierId {
        TierId::L3Cluster
    }

    async fn get(&self, partition: &str, key: &str) -> Result<Option<Bytes>> {
        self.simulate_latency().await;
        let node = self.node_for(key);
        if node.is_down() {
            return Err(self.unavailable());
        }
        Ok(node
            .data
            .get(&Self::map_key(partition, key))
            .map(|v| v.clone()))
    }

    async fn set(&self, partition: &str, key: &str, data: Bytes, _ttl: Duration) -> Result<()> {
        self.simulate_latency().await;
        let node = self.node_for(key);
        if node.is_down() {
            return Err(self.unavailable());
        }
        node.data.insert(Self::map_key(partition, key), data);
        Ok(())
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<bool> {
        self.simulate_latency().await;
        let node = self.node_for(key);
        if node.is_down() {
            return Err(self.unavailable());
        }
        Ok(node.data.remove(&Self::map_key(partition, key)).is_some())
    }

    async fn scan(&self, partition: &str) -> Result<Vec<ScanItem>> {
        self.simulate_latency().await;
        let prefix = format!("{partition}\x00");
        let mut items = Vec::new();
        for node in &self.nodes {
            if node.is_down() {
                continue;
            }
            for entry in node.data.iter() {
                if entry.key().starts_with(&prefix) {
                    items.push(ScanItem {
                        key: entry.key()[prefix.len()..].to_string(),
                        expires_at_ms: u64::MAX,
                        stored_size: entry.value().len() as u64,
                    });
                }
            }
        }
        Ok(items)
    }

    async fn health_probe(&self) -> Result<()> {
        self.simulate_latency().await;
        if self.nodes.iter().any(|n| n.is_down()) {
            return Err(self.unavailable());
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn cluster() -> ClusterTier {
        ClusterTier::new(ClusterConfig {
            nodes: 3,
            simulated_latency: Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let tier = cluster();
        tier.set("p", "k", Bytes::from_static(b"remote"), Duration::from_secs(60))
            .await
            .unwrap();

        let got = tier.get("p", "k").await.unwrap();
        assert_eq!(got.unwrap().as_ref(), b"remote");
    }

    #[tokio::test]
    async fn test_delete() {
        let tier = cluster();
        tier.set("p", "k", Bytes::from_static(b"x"), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(tier.delete("p", "k").await.unwrap());
        assert!(!tier.delete("p", "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_node_errors_only_its_keys() {
        let tier = cluster();

        // Find two keys landing on different nodes
        let mut keys: Vec<(String, usize)> = Vec::new();
        for i in 0..32 {
            let key = format!("key-{i}");
            let node = (fx_hash(key.as_bytes()) as usize) % tier.node_count();
            keys.push((key, node));
        }
        let (key_a, node_a) = keys[0].clone();
        let (key_b, _) = keys
            .iter()
            .find(|(_, n)| *n != node_a)
            .expect("32 keys cover more than one node")
            .clone();

        for (key, _) in [&keys[0], keys.iter().find(|(_, n)| *n != node_a).unwrap()] {
            tier.set("p", key, Bytes::from_static(b"v"), Duration::from_secs(60))
                .await
                .unwrap();
        }

        tier.fail_node(node_a);

        assert_matches!(
            tier.get("p", &key_a).await,
            Err(Error::TierUnavailable { .. })
        );
        assert!(tier.get("p", &key_b).await.unwrap().is_some());

        tier.restore_node(node_a);
        assert!(tier.get("p", &key_a).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_health_probe_reflects_node_state() {
        let tier = cluster();
        assert!(tier.health_probe().await.is_ok());

        tier.fail_node(0);
        assert!(tier.health_probe().await.is_err());

        tier.restore_all();
        assert!(tier.health_probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let tier = cluster();
        tier.fail_all();

        assert_matches!(
            tier.set("p", "k", Bytes::from_static(b"v"), Duration::from_secs(60)).await,
            Err(Error::TierUnavailable { .. })
        );
    }

    #[tokio::test]
    async fn test_scan_skips_down_nodes() {
        let tier = cluster();
        for i in 0..16 {
            tier.set("p", &format!("k{i}"), Bytes::from_static(b"v"), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let all = tier.scan("p").await.unwrap();
        assert_eq!(all.len(), 16);

        tier.fail_node(0);
        let partial = tier.scan("p").await.unwrap();
        assert!(partial.len() <= all.len());
    }
}
