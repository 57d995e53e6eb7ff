//! Background Maintenance
//!
//! Two detached tasks owned by the engine: the periodic TTL sweep over
//! the process-owned tiers, and the forwarder that feeds monitoring
//! alerts into the failover controller as advisory signals. Both stop
//! when the returned cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::engine::CacheEngine;

impl CacheEngine {
    /// Spawn the sweep loop and the alert forwarder. Call once after
    /// construction; the returned token cancels both tasks.
    pub fn spawn_maintenance(self: &Arc<Self>, sweep_interval: Duration) -> CancellationToken {
        let token = CancellationToken::new();

        let engine = self.clone();
        let sweep_token = token.clone();
        tokio::spawn(async move {
            run_sweeper(engine, sweep_interval, sweep_token).await;
        });

        let engine = self.clone();
        let alert_token = token.clone();
        tokio::spawn(async move {
            run_alert_forwarder(engine, alert_token).await;
        });

        token
    }
}

async fn run_sweeper(engine: Arc<CacheEngine>, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so a fresh engine does
    // not sweep before anything is cached.
    ticker.tick().await;

    info!(interval_secs = interval.as_secs(), "TTL sweeper started");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("TTL sweeper stopped");
                return;
            }
            _ = ticker.tick() => {
                let removed = engine.sweep_once().await;
                if removed > 0 {
                    debug!(removed, "sweep removed expired entries");
                }
            }
        }
    }
}

async fn run_alert_forwarder(engine: Arc<CacheEngine>, token: CancellationToken) {
    let mut rx = engine.monitor().subscribe();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("alert forwarder stopped");
                return;
            }
            signal = rx.recv() => {
                match signal {
                    Ok(signal) => engine.failover().on_alert(&signal),
                    // Lagged: skipped signals only delay advisory
                    // weighting until the next raise/clear
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
