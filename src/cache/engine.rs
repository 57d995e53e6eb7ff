//! Cache Engine
//!
//! Orchestrates the four tiers: lookup with upward promotion,
//! write-through with partition capacity enforcement, dependency-graph
//! invalidation, and the emergency passthrough mode. Every tier access
//! goes through the failover controller first, and every outcome is
//! recorded with the monitoring service.
//!
//! Locking discipline: no partition lock is ever held across a call to
//! L2-L4; tier calls are bounded by the configured deadline, and a
//! timeout counts as a tier failure while the lookup falls through to
//! the next tier.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::compression::CompressionCodec;
use crate::cache::depgraph::DependencyGraph;
use crate::cache::entry::{fx_hash, CacheKey, EntryEnvelope, TierMask};
use crate::cache::partition::PartitionRegistry;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::failover::{Clock, FailoverController, TierHealthSnapshot};
use crate::monitor::{
    AlertEvent, MonitoringService, PartitionStatsReport, TierOutcome, TierStatsReport,
};
use crate::tier::{MemoryTier, PartitionOccupancy, TierId, TierStore};

/// Point-in-time operational view served to dashboards. Built from
/// atomic reads and short per-structure copies; no engine lock is held.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
    /// Emergency passthrough active (L1 and L2 both open)
    pub emergency: bool,
    /// Rolling overall hit ratio (None until lookups happen)
    pub hit_ratio: Option<f64>,
    /// Breaker state per tier, fastest first
    pub tier_health: Vec<TierHealthSnapshot>,
    /// Operation counters and p95 per tier
    pub tier_stats: Vec<TierStatsReport>,
    /// L1 occupancy per partition
    pub occupancy: Vec<PartitionOccupancy>,
    /// Operation counters per partition
    pub partition_stats: Vec<PartitionStatsReport>,
    /// Currently active alerts
    pub active_alerts: Vec<AlertEvent>,
}

enum EnvelopeVerdict {
    Valid { envelope: EntryEnvelope, raw: Bytes },
    Expired,
    /// Another key's entry under the same storage slot (hash collision)
    Foreign,
    Corrupt(String),
}

/// The tiered cache engine.
pub struct CacheEngine {
    registry: PartitionRegistry,
    codec: CompressionCodec,
    graph: DependencyGraph,
    /// key → partition it was last written to, for invalidation fan-out
    key_partitions: DashMap<String, String>,
    memory: Arc<MemoryTier>,
    /// All tiers in lookup order; `tiers[0]` is `memory`
    tiers: Vec<Arc<dyn TierStore>>,
    failover: Arc<FailoverController>,
    monitor: Arc<MonitoringService>,
    clock: Arc<dyn Clock>,
    tier_timeout: Duration,
}

impl CacheEngine {
    /// Build an engine from configuration and the three slower tier
    /// collaborators. L1 is always the engine-owned memory tier.
    pub fn new(
        config: &EngineConfig,
        l2: Arc<dyn TierStore>,
        l3: Arc<dyn TierStore>,
        l4: Arc<dyn TierStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let registry = PartitionRegistry::new(config.partitions.clone())?;
        let memory = Arc::new(MemoryTier::new(&registry, clock.clone()));

        let tiers: Vec<Arc<dyn TierStore>> = vec![memory.clone(), l2, l3, l4];
        for (idx, store) in tiers.iter().enumerate() {
            if store.id().index() != idx {
                return Err(Error::Config(format!(
                    "tier {} supplied in position {idx}",
                    store.id()
                )));
            }
        }

        Ok(Arc::new(Self {
            registry,
            codec: CompressionCodec::new(config.compression_config()),
            graph: DependencyGraph::new(),
            key_partitions: DashMap::new(),
            memory,
            tiers,
            failover: Arc::new(FailoverController::new(config.breaker_config(), clock.clone())),
            monitor: Arc::new(MonitoringService::new(config.monitoring_config(), clock.clone())),
            clock,
            tier_timeout: config.tier_timeout(),
        }))
    }

    /// Look up a key, trying tiers fastest-first.
    ///
    /// Returns the raw (decompressed) payload on a hit. A miss means no
    /// eligible tier held a valid entry; the caller is responsible for
    /// fetching from the source of truth. The engine never blocks the
    /// caller on a backing-store fetch.
    pub async fn get(&self, partition: &str, key: &str) -> Result<Option<Bytes>> {
        self.registry.config_for(partition)?;

        if self.failover.emergency() {
            self.monitor.record_lookup(false);
            return Ok(None);
        }

        let cache_key = CacheKey::new(partition, key);
        let mut missed: Vec<TierId> = Vec::new();

        for store in &self.tiers {
            let tier = store.id();
            if !self.failover.check(tier).is_allowed() {
                continue;
            }

            let started = Instant::now();
            let call = tokio::time::timeout(self.tier_timeout, store.get(partition, key)).await;
            let latency = started.elapsed();

            let bytes = match call {
                Err(_) => {
                    self.failover.record_failure(tier);
                    self.monitor
                        .record_tier_op(tier, partition, TierOutcome::Error, latency);
                    debug!(%tier, %cache_key, "lookup timed out");
                    continue;
                }
                Ok(Err(e)) => {
                    self.failover.record_failure(tier);
                    self.monitor
                        .record_tier_op(tier, partition, TierOutcome::Error, latency);
                    debug!(%tier, %cache_key, "lookup failed: {}", e);
                    continue;
                }
                Ok(Ok(None)) => {
                    self.failover.record_success(tier);
                    self.monitor
                        .record_tier_op(tier, partition, TierOutcome::Miss, latency);
                    missed.push(tier);
                    continue;
                }
                Ok(Ok(Some(bytes))) => {
                    self.failover.record_success(tier);
                    bytes
                }
            };

            match self.open_envelope(&cache_key, bytes) {
                EnvelopeVerdict::Valid { envelope, raw } => {
                    self.monitor
                        .record_tier_op(tier, partition, TierOutcome::Hit, latency);
                    self.monitor.record_lookup(true);
                    if !missed.is_empty() {
                        self.spawn_promotion(envelope, missed.clone());
                    }
                    return Ok(Some(raw));
                }
                EnvelopeVerdict::Expired => {
                    self.monitor
                        .record_tier_op(tier, partition, TierOutcome::Miss, latency);
                    self.spawn_delete(store.clone(), partition, key);
                    missed.push(tier);
                }
                EnvelopeVerdict::Foreign => {
                    // A colliding key owns this slot; leave it alone
                    self.monitor
                        .record_tier_op(tier, partition, TierOutcome::Miss, latency);
                    missed.push(tier);
                }
                EnvelopeVerdict::Corrupt(reason) => {
                    self.monitor
                        .record_tier_op(tier, partition, TierOutcome::Error, latency);
                    warn!(%tier, %cache_key, "dropping corrupt entry: {}", reason);
                    self.spawn_delete(store.clone(), partition, key);
                    missed.push(tier);
                }
            }
        }

        self.monitor.record_lookup(false);
        Ok(None)
    }

    /// Write-through a value to every eligible tier.
    ///
    /// The payload is trial-compressed above the configured threshold.
    /// L1 admission enforces partition capacity (evicting per policy);
    /// an entry too large for its partition skips L1, is recorded as a
    /// capacity rejection, and still reaches the slower tiers. Failures
    /// on L2-L4 are logged and non-fatal. Returns the set of tiers that
    /// accepted the write.
    pub async fn set(
        &self,
        partition: &str,
        key: &str,
        value: Bytes,
        dependencies: &[String],
        ttl_override: Option<Duration>,
    ) -> Result<TierMask> {
        let pconfig = self.registry.config_for(partition)?;

        if self.failover.emergency() {
            debug!(partition, key, "emergency mode, set is a no-op");
            return Ok(TierMask::empty());
        }

        let now_ms = self.clock.now_ms();
        let ttl = ttl_override.unwrap_or_else(|| pconfig.default_ttl());
        let (stored, compressed) = self.codec.encode(&value);
        let envelope = EntryEnvelope {
            partition: partition.to_string(),
            key: key.to_string(),
            compressed,
            created_at_ms: now_ms,
            expires_at_ms: now_ms + ttl.as_millis() as u64,
            raw_size: value.len() as u64,
            content_hash: fx_hash(&value),
            payload: stored,
        };
        let encoded = envelope.encode();
        let mut mask = TierMask::empty();

        for store in &self.tiers {
            let tier = store.id();
            if !self.failover.check(tier).is_allowed() {
                continue;
            }

            if tier == TierId::L1Memory {
                match self.memory.ensure_capacity(partition, encoded.len() as u64) {
                    Ok(outcome) => {
                        if outcome.evicted() > 0 || outcome.expired > 0 {
                            debug!(
                                partition,
                                evicted = outcome.evicted(),
                                expired = outcome.expired,
                                freed = outcome.freed,
                                "made room for incoming entry"
                            );
                        }
                        // A capacity-evicted entry leaves every tier, so
                        // its key is not retrievable from a slower layer
                        for evicted in &outcome.evicted_keys {
                            for slower in self.tiers.iter().skip(1) {
                                if !self.failover.check(slower.id()).is_allowed() {
                                    continue;
                                }
                                self.spawn_delete(slower.clone(), partition, evicted);
                            }
                        }
                    }
                    Err(Error::CapacityExceeded { needed, capacity, .. }) => {
                        self.monitor.record_capacity_rejection(partition);
                        warn!(
                            partition, key, needed, capacity,
                            "entry exceeds partition capacity, skipping L1"
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let started = Instant::now();
            let call = tokio::time::timeout(
                self.tier_timeout,
                store.set(partition, key, encoded.clone(), ttl),
            )
            .await;
            let latency = started.elapsed();

            match call {
                Ok(Ok(())) => {
                    self.failover.record_success(tier);
                    self.monitor.record_write(tier, partition, true, latency);
                    mask.insert(tier);
                }
                Ok(Err(e)) => {
                    self.failover.record_failure(tier);
                    self.monitor.record_write(tier, partition, false, latency);
                    warn!(%tier, partition, key, "write-through failed: {}", e);
                }
                Err(_) => {
                    self.failover.record_failure(tier);
                    self.monitor.record_write(tier, partition, false, latency);
                    warn!(%tier, partition, key, "write-through timed out");
                }
            }
        }

        self.key_partitions
            .insert(key.to_string(), partition.to_string());
        for dependency in dependencies {
            self.graph.add_edge(dependency, key);
        }

        Ok(mask)
    }

    /// Invalidate a key and the full transitive closure of its
    /// dependents, from every eligible tier.
    ///
    /// L1 deletion is synchronous, so a subsequent local read never
    /// observes the stale entry; L2-L4 deletions are best-effort
    /// background tasks. Returns the closure size.
    pub async fn invalidate(&self, key: &str) -> Result<usize> {
        let closure = self.graph.closure(key);

        for target in &closure {
            self.graph.remove(target);
        }

        for target in &closure {
            let Some((_, partition)) = self.key_partitions.remove(target) else {
                // Never written through this engine; nothing stored
                continue;
            };

            if self.failover.check(TierId::L1Memory).is_allowed() {
                match self.memory.delete(&partition, target).await {
                    Ok(_) => self.failover.record_success(TierId::L1Memory),
                    Err(e) => {
                        self.failover.record_failure(TierId::L1Memory);
                        debug!(%partition, key = %target, "L1 invalidation failed: {}", e);
                    }
                }
            }

            for store in self.tiers.iter().skip(1) {
                let tier = store.id();
                if !self.failover.check(tier).is_allowed() {
                    continue;
                }
                self.spawn_delete(store.clone(), &partition, target);
            }
        }

        debug!(key, closure = closure.len(), "invalidation fan-out complete");
        Ok(closure.len())
    }

    /// One TTL sweep over the process-owned tiers (L1 and L2). Removes
    /// expired entries per partition, one lock acquisition per entry,
    /// and lazily drops dependency edges for keys that expired.
    pub async fn sweep_once(&self) -> usize {
        let mut removed = 0;

        for partition in self.registry.names() {
            match self.memory.remove_expired(partition) {
                Ok(n) => removed += n,
                Err(e) => debug!(%partition, "L1 sweep failed: {}", e),
            }

            let l2 = &self.tiers[TierId::L2Persistent.index()];
            if !self.failover.check(TierId::L2Persistent).is_allowed() {
                continue;
            }
            let items = match tokio::time::timeout(self.tier_timeout, l2.scan(partition)).await {
                Ok(Ok(items)) => items,
                Ok(Err(e)) => {
                    self.failover.record_failure(TierId::L2Persistent);
                    debug!(%partition, "L2 scan failed: {}", e);
                    continue;
                }
                Err(_) => {
                    self.failover.record_failure(TierId::L2Persistent);
                    continue;
                }
            };
            self.failover.record_success(TierId::L2Persistent);

            let now_ms = self.clock.now_ms();
            for item in items.into_iter().filter(|i| i.expires_at_ms < now_ms) {
                match l2.delete(partition, &item.key).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => debug!(%partition, key = %item.key, "L2 sweep delete failed: {}", e),
                }
                // The envelope TTL is uniform across tiers, so an entry
                // expired in L2 is expired everywhere: edges can go.
                self.graph.remove(&item.key);
                self.key_partitions.remove(&item.key);
            }
        }

        if removed > 0 {
            debug!(removed, "TTL sweep complete");
        }
        removed
    }

    fn open_envelope(&self, key: &CacheKey, bytes: Bytes) -> EnvelopeVerdict {
        let envelope = match EntryEnvelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => return EnvelopeVerdict::Corrupt(e.to_string()),
        };

        if !envelope.matches(key) {
            return EnvelopeVerdict::Foreign;
        }
        if envelope.is_expired(self.clock.now_ms()) {
            return EnvelopeVerdict::Expired;
        }

        let raw = match self.codec.decode(&envelope.payload, envelope.compressed) {
            Ok(raw) => raw,
            Err(e) => return EnvelopeVerdict::Corrupt(e.to_string()),
        };

        if raw.len() as u64 != envelope.raw_size {
            return EnvelopeVerdict::Corrupt(format!(
                "size mismatch: expected {}, got {}",
                envelope.raw_size,
                raw.len()
            ));
        }
        if fx_hash(&raw) != envelope.content_hash {
            return EnvelopeVerdict::Corrupt("content hash mismatch".to_string());
        }

        EnvelopeVerdict::Valid { envelope, raw }
    }

    /// Write a hit back into the faster tiers that missed. Runs as a
    /// detached task; the promoted key is pinned against L1 eviction
    /// while the write-back is in flight.
    fn spawn_promotion(&self, envelope: EntryEnvelope, targets: Vec<TierId>) {
        let now_ms = self.clock.now_ms();
        if envelope.expires_at_ms <= now_ms {
            return;
        }
        let ttl = Duration::from_millis(envelope.expires_at_ms - now_ms);
        let encoded = envelope.encode();
        let partition = envelope.partition;
        let key = envelope.key;

        let memory = self.memory.clone();
        let failover = self.failover.clone();
        let stores: Vec<Arc<dyn TierStore>> = targets
            .iter()
            .map(|t| self.tiers[t.index()].clone())
            .collect();

        tokio::spawn(async move {
            for store in stores {
                let tier = store.id();
                if !failover.check(tier).is_allowed() {
                    continue;
                }

                if tier == TierId::L1Memory {
                    memory.pin(&partition, &key);
                    let admitted = match memory.ensure_capacity(&partition, encoded.len() as u64)
                    {
                        Ok(_) => true,
                        Err(e) => {
                            debug!(%partition, %key, "promotion skipped L1: {}", e);
                            false
                        }
                    };
                    if admitted {
                        match store.set(&partition, &key, encoded.clone(), ttl).await {
                            Ok(()) => failover.record_success(tier),
                            Err(e) => {
                                failover.record_failure(tier);
                                debug!(%tier, %partition, %key, "promotion failed: {}", e);
                            }
                        }
                    }
                    memory.unpin(&partition, &key);
                } else {
                    match store.set(&partition, &key, encoded.clone(), ttl).await {
                        Ok(()) => failover.record_success(tier),
                        Err(e) => {
                            failover.record_failure(tier);
                            debug!(%tier, partition, key, "promotion failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    fn spawn_delete(&self, store: Arc<dyn TierStore>, partition: &str, key: &str) {
        let tier = store.id();
        let failover = self.failover.clone();
        let partition = partition.to_string();
        let key = key.to_string();
        tokio::spawn(async move {
            match store.delete(&partition, &key).await {
                Ok(_) => failover.record_success(tier),
                Err(e) => {
                    failover.record_failure(tier);
                    debug!(%tier, %partition, %key, "background delete failed: {}", e);
                }
            }
        });
    }

    /// Point-in-time operational snapshot for the reporting surface.
    pub fn snapshot(&self) -> EngineSnapshot {
        let monitor = self.monitor.snapshot();
        let occupancy = self
            .registry
            .names()
            .iter()
            .filter_map(|name| self.memory.occupancy(name).ok())
            .collect();

        EngineSnapshot {
            taken_at: Utc::now(),
            emergency: self.failover.emergency(),
            hit_ratio: monitor.hit_ratio,
            tier_health: self.failover.snapshot(),
            tier_stats: monitor.tiers,
            occupancy,
            partition_stats: monitor.partitions,
            active_alerts: monitor.active_alerts,
        }
    }

    /// Partition registry.
    pub fn registry(&self) -> &PartitionRegistry {
        &self.registry
    }

    /// Failover controller.
    pub fn failover(&self) -> &Arc<FailoverController> {
        &self.failover
    }

    /// Monitoring service.
    pub fn monitor(&self) -> &Arc<MonitoringService> {
        &self.monitor
    }

    /// L1 memory tier.
    pub fn memory(&self) -> &Arc<MemoryTier> {
        &self.memory
    }

    /// Number of dependency edges currently recorded.
    pub fn dependency_edges(&self) -> usize {
        self.graph.edge_count()
    }
}

// =============================================================================
// Tests
// =============================================================================
