//! Per-Tier Circuit Breaker
//!
//! Closed → Open after enough failures inside a sliding window; Open →
//! HalfOpen after a cooldown deadline passes; HalfOpen lets exactly one
//! probe through (test-and-set) and either closes on success or reopens
//! with a doubled, capped cooldown. Deadlines are stored timestamps
//! compared against the injected clock; there are no timers.
//!
//! All transitions happen under one per-tier mutex so concurrent
//! failures cannot double-count or race the Closed→Open edge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::failover::Clock;
use crate::tier::TierId;

/// Breaker tuning, shared by all tiers.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the window that open the circuit
    pub failure_threshold: u32,
    /// Sliding window for counting failures
    pub window: Duration,
    /// Initial cooldown after opening
    pub cooldown: Duration,
    /// Upper bound for the exponential cooldown backoff
    pub backoff_cap: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(30),
            cooldown: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(300),
        }
    }
}

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    /// Tier used normally
    Closed,
    /// Tier skipped entirely
    Open,
    /// One probe allowed through
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Verdict for one prospective tier call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierEligibility {
    /// Circuit closed, call normally
    Allow,
    /// Circuit half-open and this caller won the probe slot
    Probe,
    /// Tier must be skipped
    Skip,
}

impl TierEligibility {
    /// Whether the call may proceed.
    #[inline]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, TierEligibility::Skip)
    }
}

/// Point-in-time view of one tier's health.
#[derive(Debug, Clone, Serialize)]
pub struct TierHealthSnapshot {
    /// Tier this breaker guards
    pub tier: TierId,
    /// Current state
    pub state: BreakerState,
    /// Weighted failures inside the current window
    pub consecutive_failures: u32,
    /// When the circuit last opened (epoch millis, 0 = never)
    pub opened_at_ms: u64,
    /// Current cooldown (grows under backoff)
    pub cooldown_ms: u64,
    /// A half-open probe is in flight
    pub probe_in_flight: bool,
}

struct BreakerCore {
    state: BreakerState,
    consecutive_failures: u32,
    window_start_ms: u64,
    opened_at_ms: u64,
    cooldown_ms: u64,
    probe_in_flight: bool,
}

/// Circuit breaker for a single tier.
pub struct CircuitBreaker {
    tier: TierId,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    core: Mutex<BreakerCore>,
    /// Active latency alert: failures count double (advisory only)
    latency_advisory: AtomicBool,
}

impl CircuitBreaker {
    /// Create a breaker in Closed state.
    pub fn new(tier: TierId, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let cooldown_ms = config.cooldown.as_millis() as u64;
        Self {
            tier,
            config,
            clock,
            core: Mutex::new(BreakerCore {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                window_start_ms: 0,
                opened_at_ms: 0,
                cooldown_ms,
                probe_in_flight: false,
            }),
            latency_advisory: AtomicBool::new(false),
        }
    }

    /// Tier guarded by this breaker.
    pub fn tier(&self) -> TierId {
        self.tier
    }

    /// Decide whether a call may proceed right now. Open circuits whose
    /// cooldown has elapsed transition to HalfOpen here; the first caller
    /// to arrive in HalfOpen wins the single probe slot.
    pub fn check(&self) -> TierEligibility {
        let now_ms = self.clock.now_ms();
        let mut core = self.core.lock();

        if core.state == BreakerState::Open
            && now_ms >= core.opened_at_ms + core.cooldown_ms
        {
            core.state = BreakerState::HalfOpen;
            core.probe_in_flight = false;
            tracing::debug!(tier = %self.tier, "breaker cooldown elapsed, half-open");
        }

        match core.state {
            BreakerState::Closed => TierEligibility::Allow,
            BreakerState::Open => TierEligibility::Skip,
            BreakerState::HalfOpen => {
                if core.probe_in_flight {
                    TierEligibility::Skip
                } else {
                    core.probe_in_flight = true;
                    TierEligibility::Probe
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut core = self.core.lock();
        match core.state {
            BreakerState::Closed => {
                core.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                // Probe succeeded: close and reset backoff
                core.state = BreakerState::Closed;
                core.consecutive_failures = 0;
                core.probe_in_flight = false;
                core.cooldown_ms = self.config.cooldown.as_millis() as u64;
                tracing::info!(tier = %self.tier, "breaker closed after successful probe");
            }
            BreakerState::Open => {
                // Late completion from before the circuit opened
            }
        }
    }

    /// Record a failed call (error or timeout).
    pub fn record_failure(&self) {
        let now_ms = self.clock.now_ms();
        let mut core = self.core.lock();

        match core.state {
            BreakerState::Closed => {
                let window_ms = self.config.window.as_millis() as u64;
                if now_ms.saturating_sub(core.window_start_ms) > window_ms {
                    core.consecutive_failures = 0;
                    core.window_start_ms = now_ms;
                }

                let weight = if self.latency_advisory.load(Ordering::Relaxed) {
                    2
                } else {
                    1
                };
                core.consecutive_failures += weight;

                if core.consecutive_failures >= self.config.failure_threshold {
                    core.state = BreakerState::Open;
                    core.opened_at_ms = now_ms;
                    tracing::warn!(
                        tier = %self.tier,
                        failures = core.consecutive_failures,
                        cooldown_ms = core.cooldown_ms,
                        "breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                // Probe failed: reopen with doubled, capped cooldown
                let cap_ms = self.config.backoff_cap.as_millis() as u64;
                core.cooldown_ms = (core.cooldown_ms * 2).min(cap_ms);
                core.state = BreakerState::Open;
                core.opened_at_ms = now_ms;
                core.probe_in_flight = false;
                tracing::warn!(
                    tier = %self.tier,
                    cooldown_ms = core.cooldown_ms,
                    "probe failed, breaker reopened"
                );
            }
            BreakerState::Open => {}
        }
    }

    /// Mark or clear the advisory latency signal. An active signal
    /// doubles the weight of recorded failures; it never opens the
    /// circuit by itself.
    pub fn set_latency_advisory(&self, active: bool) {
        self.latency_advisory.store(active, Ordering::Relaxed);
    }

    /// Current state (Open circuits past their cooldown still report
    /// Open until a `check` transitions them).
    pub fn state(&self) -> BreakerState {
        self.core.lock().state
    }

    /// Reset to Closed with cleared counters.
    pub fn reset(&self) {
        let mut core = self.core.lock();
        core.state = BreakerState::Closed;
        core.consecutive_failures = 0;
        core.probe_in_flight = false;
        core.cooldown_ms = self.config.cooldown.as_millis() as u64;
    }

    /// Point-in-time health view.
    pub fn snapshot(&self) -> TierHealthSnapshot {
        let core = self.core.lock();
        TierHealthSnapshot {
            tier: self.tier,
            state: core.state,
            consecutive_failures: core.consecutive_failures,
            opened_at_ms: core.opened_at_ms,
            cooldown_ms: core.cooldown_ms,
            probe_in_flight: core.probe_in_flight,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::ManualClock;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new(
            TierId::L3Cluster,
            BreakerConfig {
                failure_threshold: 5,
                window: Duration::from_secs(30),
                cooldown: Duration::from_secs(10),
                backoff_cap: Duration::from_secs(40),
            },
            clock,
        )
    }

    #[test]
    fn test_starts_closed() {
        let breaker = breaker(Arc::new(ManualClock::at(0)));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.check(), TierEligibility::Allow);
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let breaker = breaker(Arc::new(ManualClock::at(0)));

        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        breaker.record_failure();

        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.check(), TierEligibility::Skip);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = breaker(Arc::new(ManualClock::at(0)));

        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();

        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let clock = Arc::new(ManualClock::at(0));
        let breaker = breaker(clock.clone());

        for _ in 0..4 {
            breaker.record_failure();
        }

        // Past the 30s window: the stale count is discarded
        clock.advance(31_000);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn test_half_open_after_cooldown_single_probe() {
        let clock = Arc::new(ManualClock::at(0));
        let breaker = breaker(clock.clone());

        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.check(), TierEligibility::Skip);

        // One millisecond short of the deadline
        clock.advance(9_999);
        assert_eq!(breaker.check(), TierEligibility::Skip);

        clock.advance(1);
        assert_eq!(breaker.check(), TierEligibility::Probe);
        // Concurrent callers while the probe is in flight are skipped
        assert_eq!(breaker.check(), TierEligibility::Skip);
        assert_eq!(breaker.check(), TierEligibility::Skip);
    }

    #[test]
    fn test_probe_success_closes() {
        let clock = Arc::new(ManualClock::at(0));
        let breaker = breaker(clock.clone());

        for _ in 0..5 {
            breaker.record_failure();
        }
        clock.advance(10_000);
        assert_eq!(breaker.check(), TierEligibility::Probe);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.check(), TierEligibility::Allow);
        assert_eq!(breaker.snapshot().cooldown_ms, 10_000);
    }

    #[test]
    fn test_probe_failure_doubles_cooldown_capped() {
        let clock = Arc::new(ManualClock::at(0));
        let breaker = breaker(clock.clone());

        for _ in 0..5 {
            breaker.record_failure();
        }

        // 10s → 20s → 40s → capped at 40s
        for expected_ms in [20_000u64, 40_000, 40_000] {
            let cooldown = breaker.snapshot().cooldown_ms;
            clock.advance(cooldown);
            assert_eq!(breaker.check(), TierEligibility::Probe);
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Open);
            assert_eq!(breaker.snapshot().cooldown_ms, expected_ms);
        }
    }

    #[test]
    fn test_latency_advisory_doubles_failure_weight() {
        let breaker = breaker(Arc::new(ManualClock::at(0)));
        breaker.set_latency_advisory(true);

        // Threshold 5 reached in 3 weighted failures (2+2+2)
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_advisory_alone_never_opens() {
        let breaker = breaker(Arc::new(ManualClock::at(0)));
        breaker.set_latency_advisory(true);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.check(), TierEligibility::Allow);
    }

    #[test]
    fn test_reset() {
        let clock = Arc::new(ManualClock::at(0));
        let breaker = breaker(clock);

        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.check(), TierEligibility::Allow);
    }

    #[test]
    fn test_concurrent_failures_single_transition() {
        use std::thread;

        let breaker = Arc::new(breaker(Arc::new(ManualClock::at(0))));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                thread::spawn(move || {
                    for _ in 0..100 {
                        breaker.record_failure();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // However the failures interleave, the breaker is simply Open
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.snapshot().opened_at_ms, 0);
    }
}
