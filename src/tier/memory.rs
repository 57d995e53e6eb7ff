//! L1 Tier - Process Memory
//!
//! Hot tier with partition-scoped locking: each partition owns its own
//! map, lock, and occupancy counter, so contention is local to one
//! partition. Capacity eviction removes TTL-expired entries first,
//! unconditionally, then orders still-valid candidates by the partition's
//! eviction policy (LRU recency or soonest-to-expire). Keys pinned by an
//! in-flight read promotion are never evicted.
//!
//! Locks are held only for the bounded duration of a map operation; the
//! eviction path collects candidates under a read lock and removes them
//! one write-lock acquisition per entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use parking_lot::RwLock;
use serde::Serialize;

use crate::cache::partition::{EvictionMode, PartitionConfig, PartitionRegistry};
use crate::error::{Error, Result};
use crate::failover::Clock;
use crate::tier::{ScanItem, TierId, TierStore};

/// One stored entry. Access time is atomic so reads can bump it under
/// the shard read lock.
struct StoredEntry {
    data: Bytes,
    size: u64,
    expires_at_ms: u64,
    last_access_ms: AtomicU64,
}

/// Per-partition state: map, occupancy, counters.
struct PartitionStore {
    entries: RwLock<HashMap<String, StoredEntry>>,
    occupied: AtomicU64,
    capacity: u64,
    policy: EvictionMode,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl PartitionStore {
    fn new(config: &PartitionConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            occupied: AtomicU64::new(0),
            capacity: config.capacity_bytes,
            policy: config.eviction_policy,
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Remove a single entry if it is still expired, taking the write
    /// lock for just this key.
    fn remove_if_expired(&self, key: &str, now_ms: u64) -> bool {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if entry.expires_at_ms < now_ms {
                let size = entry.size;
                entries.remove(key);
                self.occupied.fetch_sub(size, Ordering::Relaxed);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.remove(key) {
            self.occupied.fetch_sub(entry.size, Ordering::Relaxed);
            return true;
        }
        false
    }
}

/// Result of a capacity-enforcement pass.
#[derive(Debug, Default, Clone)]
pub struct EvictionOutcome {
    /// Keys of still-valid entries evicted for space. The engine fans
    /// these out as deletions to the slower tiers so an evicted key is
    /// not retrievable anywhere.
    pub evicted_keys: Vec<String>,
    /// Expired entries removed
    pub expired: usize,
    /// Bytes freed
    pub freed: u64,
}

impl EvictionOutcome {
    /// Still-valid entries evicted for space.
    pub fn evicted(&self) -> usize {
        self.evicted_keys.len()
    }
}

/// Occupancy snapshot for one partition.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionOccupancy {
    /// Partition name
    pub partition: String,
    /// Bytes currently stored
    pub bytes: u64,
    /// Number of entries
    pub entries: usize,
    /// Configured capacity
    pub capacity_bytes: u64,
}

/// L1 memory tier with partition-scoped stores.
pub struct MemoryTier {
    partitions: HashMap<String, PartitionStore>,
    clock: Arc<dyn Clock>,
    /// Keys pinned by in-flight promotions ("partition\x00key")
    pinned: DashSet<String>,
}

impl MemoryTier {
    /// Build the tier with one store per configured partition.
    pub fn new(registry: &PartitionRegistry, clock: Arc<dyn Clock>) -> Self {
        let mut partitions = HashMap::with_capacity(registry.len());
        for name in registry.names() {
            let config = registry
                .config_for(name)
                .expect("registry names are registry keys");
            partitions.insert(name.clone(), PartitionStore::new(config));
        }
        Self {
            partitions,
            clock,
            pinned: DashSet::new(),
        }
    }

    fn store(&self, partition: &str) -> Result<&PartitionStore> {
        self.partitions
            .get(partition)
            .ok_or_else(|| Error::InvalidPartition(partition.to_string()))
    }

    fn pin_key(partition: &str, key: &str) -> String {
        format!("{partition}\x00{key}")
    }

    /// Pin a key against eviction while a promotion writes it back.
    pub fn pin(&self, partition: &str, key: &str) {
        self.pinned.insert(Self::pin_key(partition, key));
    }

    /// Release a promotion pin.
    pub fn unpin(&self, partition: &str, key: &str) {
        self.pinned.remove(&Self::pin_key(partition, key));
    }

    fn is_pinned(&self, partition: &str, key: &str) -> bool {
        self.pinned.contains(&Self::pin_key(partition, key))
    }

    /// Make room for an incoming entry of `incoming_size` bytes.
    ///
    /// Expired entries are removed first, unconditionally. If the
    /// partition still cannot fit the entry, valid candidates are evicted
    /// in policy order (LRU recency or soonest-to-expire), skipping
    /// pinned keys. Returns `CapacityExceeded` when the entry can never
    /// fit or when every remaining candidate is pinned.
    pub fn ensure_capacity(&self, partition: &str, incoming_size: u64) -> Result<EvictionOutcome> {
        let store = self.store(partition)?;
        let now_ms = self.clock.now_ms();
        let mut outcome = EvictionOutcome::default();

        if incoming_size > store.capacity {
            return Err(Error::CapacityExceeded {
                partition: partition.to_string(),
                needed: incoming_size,
                capacity: store.capacity,
            });
        }

        let fits = |freed_target: &PartitionStore| {
            freed_target.occupied.load(Ordering::Relaxed) + incoming_size <= freed_target.capacity
        };

        if fits(store) {
            return Ok(outcome);
        }

        // Candidate pass under the read lock: (key, expired, order key, size)
        let mut candidates: Vec<(String, bool, u64, u64)> = {
            let entries = store.entries.read();
            entries
                .iter()
                .map(|(key, entry)| {
                    let expired = entry.expires_at_ms < now_ms;
                    let order = match store.policy {
                        EvictionMode::Lru => entry.last_access_ms.load(Ordering::Relaxed),
                        EvictionMode::TtlOnly => entry.expires_at_ms,
                    };
                    (key.clone(), expired, order, entry.size)
                })
                .collect()
        };

        // Expired first (unconditional), then oldest/soonest-to-expire
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        for (key, expired, _, size) in candidates {
            if fits(store) {
                break;
            }

            if expired {
                if store.remove_if_expired(&key, now_ms) {
                    outcome.expired += 1;
                    outcome.freed += size;
                }
                continue;
            }

            if self.is_pinned(partition, &key) {
                continue;
            }

            if store.remove(&key) {
                store.evictions.fetch_add(1, Ordering::Relaxed);
                outcome.freed += size;
                outcome.evicted_keys.push(key);
            }
        }

        if fits(store) {
            Ok(outcome)
        } else {
            Err(Error::CapacityExceeded {
                partition: partition.to_string(),
                needed: incoming_size,
                capacity: store.capacity,
            })
        }
    }

    /// Remove expired entries from one partition, one lock acquisition
    /// per entry. Returns the number removed.
    pub fn remove_expired(&self, partition: &str) -> Result<usize> {
        let store = self.store(partition)?;
        let now_ms = self.clock.now_ms();

        let candidates: Vec<String> = {
            let entries = store.entries.read();
            entries
                .iter()
                .filter(|(_, e)| e.expires_at_ms < now_ms)
                .map(|(k, _)| k.clone())
                .collect()
        };

        let mut removed = 0;
        for key in candidates {
            if store.remove_if_expired(&key, now_ms) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Occupancy of one partition.
    pub fn occupancy(&self, partition: &str) -> Result<PartitionOccupancy> {
        let store = self.store(partition)?;
        Ok(PartitionOccupancy {
            partition: partition.to_string(),
            bytes: store.occupied.load(Ordering::Relaxed),
            entries: store.entries.read().len(),
            capacity_bytes: store.capacity,
        })
    }

    /// Eviction count for one partition.
    pub fn evictions(&self, partition: &str) -> u64 {
        self.partitions
            .get(partition)
            .map(|s| s.evictions.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// TTL expiration count for one partition.
    pub fn expirations(&self, partition: &str) -> u64 {
        self.partitions
            .get(partition)
            .map(|s| s.expirations.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Drop every entry in every partition.
    pub fn clear(&self) {
        for store in self.partitions.values() {
            store.entries.write().clear();
            store.occupied.store(0, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl TierStore for MemoryTier {
    fn id(&self) -> TierId {
        TierId::L1Memory
    }

    async fn get(&self, partition: &str, key: &str) -> Result<Option<Bytes>> {
        let store = self.store(partition)?;
        let now_ms = self.clock.now_ms();

        let expired = {
            let entries = store.entries.read();
            match entries.get(key) {
                Some(entry) if entry.expires_at_ms < now_ms => true,
                Some(entry) => {
                    entry.last_access_ms.store(now_ms, Ordering::Relaxed);
                    return Ok(Some(entry.data.clone()));
                }
                None => return Ok(None),
            }
        };

        if expired {
            store.remove_if_expired(key, now_ms);
        }
        Ok(None)
    }

    async fn set(&self, partition: &str, key: &str, data: Bytes, ttl: Duration) -> Result<()> {
        let store = self.store(partition)?;
        let now_ms = self.clock.now_ms();
        let size = data.len() as u64;

        let entry = StoredEntry {
            data,
            size,
            expires_at_ms: now_ms + ttl.as_millis() as u64,
            last_access_ms: AtomicU64::new(now_ms),
        };

        let mut entries = store.entries.write();
        if let Some(old) = entries.insert(key.to_string(), entry) {
            if size >= old.size {
                store.occupied.fetch_add(size - old.size, Ordering::Relaxed);
            } else {
                store.occupied.fetch_sub(old.size - size, Ordering::Relaxed);
            }
        } else {
            store.occupied.fetch_add(size, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<bool> {
        let store = self.store(partition)?;
        Ok(store.remove(key))
    }

    async fn scan(&self, partition: &str) -> Result<Vec<ScanItem>> {
        let store = self.store(partition)?;
        let entries = store.entries.read();
        Ok(entries
            .iter()
            .map(|(key, entry)| ScanItem {
                key: key.clone(),
                expires_at_ms: entry.expires_at_ms,
                stored_size: entry.size,
            })
            .collect())
    }

    async fn health_probe(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
