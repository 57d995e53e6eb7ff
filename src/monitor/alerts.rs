//! Alert Events
//!
//! Threshold alerts raised by the monitoring service and consumed by
//! dashboards (via the snapshot) and by the failover controller (as an
//! advisory signal). Events are immutable records of a condition
//! starting or clearing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::tier::TierId;

/// The condition an alert describes.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum AlertKind {
    /// Overall rolling hit ratio fell below the configured floor.
    LowHitRatio {
        /// Observed ratio
        ratio: f64,
        /// Configured floor
        floor: f64,
    },
    /// A tier's rolling p95 latency exceeded the configured ceiling.
    HighLatency {
        /// Affected tier
        tier: TierId,
        /// Observed p95 in milliseconds
        p95_ms: u64,
        /// Configured ceiling in milliseconds
        ceiling_ms: u64,
    },
}

impl AlertKind {
    /// Stable key used to deduplicate active alerts: one alert per
    /// condition, regardless of the observed values.
    pub fn dedup_key(&self) -> String {
        match self {
            AlertKind::LowHitRatio { .. } => "low-hit-ratio".to_string(),
            AlertKind::HighLatency { tier, .. } => format!("high-latency:{}", tier.label()),
        }
    }
}

/// One raised alert.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    /// Unique id
    pub id: Uuid,
    /// Condition
    pub kind: AlertKind,
    /// When the condition was first observed
    pub raised_at: DateTime<Utc>,
}

impl AlertEvent {
    /// Create a low-hit-ratio alert.
    pub fn low_hit_ratio(ratio: f64, floor: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: AlertKind::LowHitRatio { ratio, floor },
            raised_at: Utc::now(),
        }
    }

    /// Create a high-latency alert.
    pub fn high_latency(tier: TierId, p95_ms: u64, ceiling_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: AlertKind::HighLatency {
                tier,
                p95_ms,
                ceiling_ms,
            },
            raised_at: Utc::now(),
        }
    }
}

/// Whether a broadcast signal raises or clears a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertPhase {
    /// Condition started
    Raised,
    /// Condition ended
    Cleared,
}

/// Message published on the alert broadcast channel.
#[derive(Debug, Clone, Serialize)]
pub struct AlertSignal {
    /// Raised or cleared
    pub phase: AlertPhase,
    /// The alert in question
    pub event: AlertEvent,
}

// =============================================================================
// Tests
// =============================================================================
