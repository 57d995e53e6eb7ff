//! Cache Tier Contract
//!
//! Uniform async contract implemented by every backing layer of the cache
//! hierarchy. L1 is process-local; L2-L4 stand in for external
//! collaborators (persistent store, distributed cluster, edge/CDN) behind
//! the same trait. New tier kinds extend [`TierId`] without touching the
//! engine's lookup loop.

mod cluster;
mod edge;
mod memory;
mod persistent;

pub use cluster::{ClusterConfig, ClusterTier};
pub use edge::{EdgeConfig, EdgeTier};
pub use memory::{EvictionOutcome, MemoryTier, PartitionOccupancy};
pub use persistent::{PersistentConfig, PersistentTier};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identity of a tier in the hierarchy, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TierId {
    /// L1 - process memory (hot)
    L1Memory,
    /// L2 - local persistent store (warm, survives restart)
    L2Persistent,
    /// L3 - distributed cluster (shared)
    L3Cluster,
    /// L4 - edge/CDN layer (cold, possibly stale)
    L4Edge,
}

impl TierId {
    /// All tiers in lookup order, fastest first.
    pub const ALL: [TierId; 4] = [
        TierId::L1Memory,
        TierId::L2Persistent,
        TierId::L3Cluster,
        TierId::L4Edge,
    ];

    /// Stable index for per-tier arrays (0 = fastest).
    #[inline]
    pub fn index(&self) -> usize {
        match self {
            TierId::L1Memory => 0,
            TierId::L2Persistent => 1,
            TierId::L3Cluster => 2,
            TierId::L4Edge => 3,
        }
    }

    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TierId::L1Memory => "l1",
            TierId::L2Persistent => "l2",
            TierId::L3Cluster => "l3",
            TierId::L4Edge => "l4",
        }
    }
}

impl std::fmt::Display for TierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierId::L1Memory => write!(f, "L1 (memory)"),
            TierId::L2Persistent => write!(f, "L2 (persistent)"),
            TierId::L3Cluster => write!(f, "L3 (cluster)"),
            TierId::L4Edge => write!(f, "L4 (edge)"),
        }
    }
}

/// One entry surfaced by a tier scan, used by the TTL sweeper.
#[derive(Debug, Clone)]
pub struct ScanItem {
    /// Object key within the partition
    pub key: String,
    /// Expiry deadline (epoch millis)
    pub expires_at_ms: u64,
    /// Bytes occupied in the tier
    pub stored_size: u64,
}

/// Uniform tier contract.
///
/// Values are opaque envelope bytes; tiers never interpret the payload.
/// Implementations must be safe under concurrent calls.
#[async_trait]
pub trait TierStore: Send + Sync {
    /// Which tier this store is.
    fn id(&self) -> TierId;

    /// Fetch the stored bytes for a key, if present.
    async fn get(&self, partition: &str, key: &str) -> Result<Option<Bytes>>;

    /// Store bytes under a key. `ttl` is advisory for tiers that manage
    /// their own expiry (the envelope carries the authoritative deadline).
    async fn set(&self, partition: &str, key: &str, data: Bytes, ttl: Duration) -> Result<()>;

    /// Delete a key. Returns true if something was removed.
    async fn delete(&self, partition: &str, key: &str) -> Result<bool>;

    /// Enumerate entries in a partition for sweep/occupancy purposes.
    async fn scan(&self, partition: &str) -> Result<Vec<ScanItem>>;

    /// Cheap liveness check, used by half-open breaker probes.
    async fn health_probe(&self) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================
