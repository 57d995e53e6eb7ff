//! L4 Tier - Edge/CDN Layer (simulated)
//!
//! Stands in for an external edge cache: slowest tier, honors TTL on
//! read (an expired object is purged and reported absent, the way a CDN
//! would refuse to serve a stale object), whole-tier failure injection,
//! and per-call simulated latency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::failover::Clock;
use crate::tier::{ScanItem, TierId, TierStore};

/// Edge simulation configuration
#[derive(Debug, Clone, Default)]
pub struct EdgeConfig {
    /// Latency added to every call
    pub simulated_latency: Duration,
}

struct EdgeObject {
    data: Bytes,
    expires_at_ms: u64,
}

/// Simulated edge/CDN tier.
pub struct EdgeTier {
    /// "partition\x00key" → object
    objects: DashMap<String, EdgeObject>,
    clock: Arc<dyn Clock>,
    latency: Duration,
    offline: AtomicBool,
}

impl EdgeTier {
    /// Create the edge tier.
    pub fn new(config: EdgeConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            objects: DashMap::new(),
            clock,
            latency: config.simulated_latency,
            offline: AtomicBool::new(false),
        }
    }

    fn map_key(partition: &str, key: &str) -> String {
        format!("{partition}\x00{key}")
    }

    async fn call_gate(&self) -> Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.offline.load(Ordering::Relaxed) {
            return Err(Error::TierUnavailable {
                tier: TierId::L4Edge,
                reason: "edge endpoint unreachable".to_string(),
            });
        }
        Ok(())
    }

    /// Take the whole edge layer offline (failure-injection hook).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when no objects are stored.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl TierStore for EdgeTier {
    fn id(&self) -> TierId {
        TierId::L4Edge
    }

    async fn get(&self, partition: &str, key: &str) -> Result<Option<Bytes>> {
        self.call_gate().await?;
        let map_key = Self::map_key(partition, key);

        let expired = match self.objects.get(&map_key) {
            Some(object) => {
                if object.expires_at_ms >= self.clock.now_ms() {
                    return Ok(Some(object.data.clone()));
                }
                true
            }
            None => false,
        };

        if expired {
            self.objects.remove(&map_key);
        }
        Ok(None)
    }

    async fn set(&self, partition: &str, key: &str, data: Bytes, ttl: Duration) -> Result<()> {
        self.call_gate().await?;
        self.objects.insert(
            Self::map_key(partition, key),
            EdgeObject {
                data,
                expires_at_ms: self.clock.now_ms() + ttl.as_millis() as u64,
            },
        );
        Ok(())
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<bool> {
        self.call_gate().await?;
        Ok(self.objects.remove(&Self::map_key(partition, key)).is_some())
    }

    async fn scan(&self, partition: &str) -> Result<Vec<ScanItem>> {
        self.call_gate().await?;
        let prefix = format!("{partition}\x00");
        Ok(self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| ScanItem {
                key: entry.key()[prefix.len()..].to_string(),
                expires_at_ms: entry.value().expires_at_ms,
                stored_size: entry.value().data.len() as u64,
            })
            .collect())
    }

    async fn health_probe(&self) -> Result<()> {
        self.call_gate().await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::ManualClock;
    use assert_matches::assert_matches;

    fn edge() -> (Arc<ManualClock>, EdgeTier) {
        let clock = Arc::new(ManualClock::at(1_000));
        let tier = EdgeTier::new(EdgeConfig::default(), clock.clone());
        (clock, tier)
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let (_, tier) = edge();
        tier.set("p", "k", Bytes::from_static(b"edge"), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(tier.get("p", "k").await.unwrap().unwrap().as_ref(), b"edge");
    }

    #[tokio::test]
    async fn test_ttl_honored_on_read() {
        let (clock, tier) = edge();
        tier.set("p", "k", Bytes::from_static(b"v"), Duration::from_secs(5))
            .await
            .unwrap();

        clock.advance(6_000);

        assert!(tier.get("p", "k").await.unwrap().is_none());
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_offline_errors() {
        let (_, tier) = edge();
        tier.set_offline(true);

        assert_matches!(tier.get("p", "k").await, Err(Error::TierUnavailable { .. }));
        assert!(tier.health_probe().await.is_err());

        tier.set_offline(false);
        assert!(tier.health_probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_delete() {
        let (_, tier) = edge();
        tier.set("p", "k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(tier.delete("p", "k").await.unwrap());
        assert!(!tier.delete("p", "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan() {
        let (_, tier) = edge();
        tier.set("p", "a", Bytes::from_static(b"1"), Duration::from_secs(60))
            .await
            .unwrap();
        tier.set("other", "b", Bytes::from_static(b"2"), Duration::from_secs(60))
            .await
            .unwrap();

        let items = tier.scan("p").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, "a");
    }
}
