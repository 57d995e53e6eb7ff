//! Monitoring Service
//!
//! Aggregates per-tier and per-partition operation outcomes and latency
//! samples from the engine, exposes the rolling-window hit ratio and p95
//! latency, and raises threshold alerts on a broadcast channel. The
//! failover controller consumes those alerts as an advisory signal.

mod alerts;
mod window;

pub use alerts::{AlertEvent, AlertKind, AlertPhase, AlertSignal};
pub use window::{LatencyRing, RollingCounter};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::failover::Clock;
use crate::tier::TierId;

/// Retained latency samples per tier.
const LATENCY_SAMPLES: usize = 512;
/// Broadcast channel depth for alert signals.
const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Monitoring thresholds and window sizing.
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Floor for the rolling overall hit ratio
    pub min_hit_ratio: f64,
    /// Ceiling for per-tier rolling p95 latency
    pub max_p95_latency_ms: u64,
    /// Rolling window length
    pub window: Duration,
    /// Samples required before either alert can fire
    pub min_samples: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            min_hit_ratio: 0.2,
            max_p95_latency_ms: 500,
            window: Duration::from_secs(60),
            min_samples: 50,
        }
    }
}

/// Outcome of one tier call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierOutcome {
    /// Valid entry returned
    Hit,
    /// Tier answered but had no valid entry
    Miss,
    /// Tier call failed or timed out
    Error,
}

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    writes: AtomicU64,
}

#[derive(Debug, Default)]
struct PartitionCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    capacity_rejections: AtomicU64,
}

/// Cumulative per-tier stats for the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TierStatsReport {
    /// Tier
    pub tier: TierId,
    /// Cumulative hits
    pub hits: u64,
    /// Cumulative misses
    pub misses: u64,
    /// Cumulative errors
    pub errors: u64,
    /// Cumulative accepted writes
    pub writes: u64,
    /// Rolling p95 latency in milliseconds (None until sampled)
    pub p95_latency_ms: Option<u64>,
}

/// Cumulative per-partition stats for the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatsReport {
    /// Partition name
    pub partition: String,
    /// Cumulative hits
    pub hits: u64,
    /// Cumulative misses
    pub misses: u64,
    /// Cumulative errors
    pub errors: u64,
    /// Writes rejected from L1 for size
    pub capacity_rejections: u64,
}

/// Point-in-time monitoring view.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    /// Rolling overall hit ratio (None until lookups happen)
    pub hit_ratio: Option<f64>,
    /// Per-tier stats, fastest first
    pub tiers: Vec<TierStatsReport>,
    /// Per-partition stats
    pub partitions: Vec<PartitionStatsReport>,
    /// Currently active alerts
    pub active_alerts: Vec<AlertEvent>,
}

/// Aggregation point for all engine observations.
pub struct MonitoringService {
    config: MonitoringConfig,
    clock: Arc<dyn Clock>,
    lookups: RollingCounter,
    tier_counters: [TierCounters; 4],
    tier_latency: [LatencyRing; 4],
    partitions: DashMap<String, PartitionCounters>,
    active: Mutex<HashMap<String, AlertEvent>>,
    alert_tx: broadcast::Sender<AlertSignal>,
}

impl MonitoringService {
    /// Create the service.
    pub fn new(config: MonitoringConfig, clock: Arc<dyn Clock>) -> Self {
        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            lookups: RollingCounter::new(config.window),
            tier_counters: Default::default(),
            tier_latency: [
                LatencyRing::new(LATENCY_SAMPLES),
                LatencyRing::new(LATENCY_SAMPLES),
                LatencyRing::new(LATENCY_SAMPLES),
                LatencyRing::new(LATENCY_SAMPLES),
            ],
            partitions: DashMap::new(),
            active: Mutex::new(HashMap::new()),
            alert_tx,
            config,
            clock,
        }
    }

    /// Subscribe to alert raise/clear signals.
    pub fn subscribe(&self) -> broadcast::Receiver<AlertSignal> {
        self.alert_tx.subscribe()
    }

    /// Record the outcome and latency of one tier call.
    pub fn record_tier_op(
        &self,
        tier: TierId,
        partition: &str,
        outcome: TierOutcome,
        latency: Duration,
    ) {
        let counters = &self.tier_counters[tier.index()];
        let partition_counters = self.partitions.entry(partition.to_string()).or_default();

        match outcome {
            TierOutcome::Hit => {
                counters.hits.fetch_add(1, Ordering::Relaxed);
                partition_counters.hits.fetch_add(1, Ordering::Relaxed);
            }
            TierOutcome::Miss => {
                counters.misses.fetch_add(1, Ordering::Relaxed);
                partition_counters.misses.fetch_add(1, Ordering::Relaxed);
            }
            TierOutcome::Error => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                partition_counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(partition_counters);

        self.tier_latency[tier.index()].record(latency);
        self.evaluate_latency_alert(tier);
    }

    /// Record the outcome and latency of one write-through call.
    pub fn record_write(&self, tier: TierId, partition: &str, ok: bool, latency: Duration) {
        let counters = &self.tier_counters[tier.index()];
        if ok {
            counters.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.errors.fetch_add(1, Ordering::Relaxed);
            self.partitions
                .entry(partition.to_string())
                .or_default()
                .errors
                .fetch_add(1, Ordering::Relaxed);
        }
        self.tier_latency[tier.index()].record(latency);
        self.evaluate_latency_alert(tier);
    }

    /// Record the overall outcome of one engine lookup.
    pub fn record_lookup(&self, hit: bool) {
        self.lookups.record(hit, self.clock.now_ms());
        self.evaluate_hit_ratio_alert();
    }

    /// Record a write rejected from L1 for size.
    pub fn record_capacity_rejection(&self, partition: &str) {
        self.partitions
            .entry(partition.to_string())
            .or_default()
            .capacity_rejections
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Rolling overall hit ratio.
    pub fn hit_ratio(&self) -> Option<f64> {
        self.lookups.ratio(self.clock.now_ms())
    }

    /// Rolling p95 latency for one tier, in milliseconds.
    pub fn tier_p95_ms(&self, tier: TierId) -> Option<u64> {
        self.tier_latency[tier.index()].p95_us().map(|us| us / 1_000)
    }

    fn evaluate_hit_ratio_alert(&self) {
        let now_ms = self.clock.now_ms();
        let (hits, misses) = self.lookups.counts(now_ms);
        let total = hits + misses;
        if total < self.config.min_samples {
            return;
        }
        let ratio = hits as f64 / total as f64;

        if ratio < self.config.min_hit_ratio {
            self.raise(AlertEvent::low_hit_ratio(ratio, self.config.min_hit_ratio));
        } else {
            self.clear("low-hit-ratio");
        }
    }

    fn evaluate_latency_alert(&self, tier: TierId) {
        let ring = &self.tier_latency[tier.index()];
        if (ring.len() as u64) < self.config.min_samples {
            return;
        }
        let Some(p95_us) = ring.p95_us() else { return };
        let p95_ms = p95_us / 1_000;
        let key = format!("high-latency:{}", tier.label());

        if p95_ms > self.config.max_p95_latency_ms {
            self.raise(AlertEvent::high_latency(
                tier,
                p95_ms,
                self.config.max_p95_latency_ms,
            ));
        } else {
            self.clear(&key);
        }
    }

    fn raise(&self, event: AlertEvent) {
        let key = event.kind.dedup_key();
        let mut active = self.active.lock();
        if active.contains_key(&key) {
            return;
        }
        tracing::warn!(alert = %key, "alert raised");
        active.insert(key, event.clone());
        drop(active);

        let _ = self.alert_tx.send(AlertSignal {
            phase: AlertPhase::Raised,
            event,
        });
    }

    fn clear(&self, key: &str) {
        let removed = self.active.lock().remove(key);
        if let Some(event) = removed {
            tracing::info!(alert = %key, "alert cleared");
            let _ = self.alert_tx.send(AlertSignal {
                phase: AlertPhase::Cleared,
                event,
            });
        }
    }

    /// Currently active alerts.
    pub fn active_alerts(&self) -> Vec<AlertEvent> {
        self.active.lock().values().cloned().collect()
    }

    /// Point-in-time copy of every counter and window.
    pub fn snapshot(&self) -> MonitorSnapshot {
        let tiers = TierId::ALL
            .iter()
            .map(|tier| {
                let counters = &self.tier_counters[tier.index()];
                TierStatsReport {
                    tier: *tier,
                    hits: counters.hits.load(Ordering::Relaxed),
                    misses: counters.misses.load(Ordering::Relaxed),
                    errors: counters.errors.load(Ordering::Relaxed),
                    writes: counters.writes.load(Ordering::Relaxed),
                    p95_latency_ms: self.tier_p95_ms(*tier),
                }
            })
            .collect();

        let mut partitions: Vec<PartitionStatsReport> = self
            .partitions
            .iter()
            .map(|entry| PartitionStatsReport {
                partition: entry.key().clone(),
                hits: entry.value().hits.load(Ordering::Relaxed),
                misses: entry.value().misses.load(Ordering::Relaxed),
                errors: entry.value().errors.load(Ordering::Relaxed),
                capacity_rejections: entry.value().capacity_rejections.load(Ordering::Relaxed),
            })
            .collect();
        partitions.sort_by(|a, b| a.partition.cmp(&b.partition));

        MonitorSnapshot {
            hit_ratio: self.hit_ratio(),
            tiers,
            partitions,
            active_alerts: self.active_alerts(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
