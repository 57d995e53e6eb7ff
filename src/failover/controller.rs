//! Failover Controller
//!
//! The single authority the engine consults before touching any tier.
//! One circuit breaker per tier, plus the emergency-mode signal: when L1
//! and L2 are both Open the engine stops caching entirely (every get is
//! a miss, every set a no-op) instead of erroring.

use std::sync::Arc;

use crate::failover::breaker::{
    BreakerConfig, BreakerState, CircuitBreaker, TierEligibility, TierHealthSnapshot,
};
use crate::failover::Clock;
use crate::monitor::{AlertKind, AlertPhase, AlertSignal};
use crate::tier::TierId;

/// Per-tier breakers behind a single façade.
pub struct FailoverController {
    breakers: [CircuitBreaker; 4],
}

impl FailoverController {
    /// Create a controller with all circuits Closed.
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let breakers = TierId::ALL.map(|tier| {
            CircuitBreaker::new(tier, config.clone(), clock.clone())
        });
        Self { breakers }
    }

    fn breaker(&self, tier: TierId) -> &CircuitBreaker {
        &self.breakers[tier.index()]
    }

    /// Whether a call to `tier` may proceed right now.
    pub fn check(&self, tier: TierId) -> TierEligibility {
        self.breaker(tier).check()
    }

    /// Record a successful tier call.
    pub fn record_success(&self, tier: TierId) {
        self.breaker(tier).record_success();
    }

    /// Record a failed tier call (error or timeout).
    pub fn record_failure(&self, tier: TierId) {
        self.breaker(tier).record_failure();
    }

    /// Current state of one tier's circuit.
    pub fn state(&self, tier: TierId) -> BreakerState {
        self.breaker(tier).state()
    }

    /// Emergency passthrough: both local tiers are down, so caching is
    /// disabled rather than surfacing errors to callers.
    pub fn emergency(&self) -> bool {
        self.state(TierId::L1Memory) == BreakerState::Open
            && self.state(TierId::L2Persistent) == BreakerState::Open
    }

    /// Consume a monitoring alert as an advisory signal. High-latency
    /// alerts adjust the failure weighting of the affected tier; no
    /// alert ever opens a circuit directly.
    pub fn on_alert(&self, signal: &AlertSignal) {
        if let AlertKind::HighLatency { tier, .. } = &signal.event.kind {
            let active = signal.phase == AlertPhase::Raised;
            self.breaker(*tier).set_latency_advisory(active);
            tracing::debug!(tier = %tier, active, "latency advisory updated");
        }
    }

    /// Reset one tier's circuit (operational hook).
    pub fn reset(&self, tier: TierId) {
        self.breaker(tier).reset();
    }

    /// Health snapshots for all tiers, fastest first.
    pub fn snapshot(&self) -> Vec<TierHealthSnapshot> {
        self.breakers.iter().map(|b| b.snapshot()).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
