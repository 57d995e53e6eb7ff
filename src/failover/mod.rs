//! Failover Layer
//!
//! Per-tier circuit breakers behind a single controller, driven by
//! explicit deadlines against an injected clock. The engine never calls
//! a tier without consulting this layer first.

mod breaker;
mod clock;
mod controller;

pub use breaker::{
    BreakerConfig, BreakerState, CircuitBreaker, TierEligibility, TierHealthSnapshot,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::FailoverController;
