//! Rolling Windows
//!
//! Bucketed hit/miss window for the rolling hit ratio, and a bounded
//! sample ring for p95 latency. Both are cheap enough to update on every
//! operation and take a short mutex rather than striving for lock-free
//! accuracy; monitoring feeds advisory decisions, not the data path.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

/// Number of buckets a window is divided into.
const BUCKET_COUNT: u64 = 10;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// now_ms / bucket_width
    epoch: u64,
    hits: u64,
    misses: u64,
}

/// Hit/miss counts over a sliding window, bucketed by time.
#[derive(Debug)]
pub struct RollingCounter {
    bucket_width_ms: u64,
    buckets: Mutex<VecDeque<Bucket>>,
}

impl RollingCounter {
    /// Create a counter covering `window`.
    pub fn new(window: Duration) -> Self {
        let window_ms = (window.as_millis() as u64).max(BUCKET_COUNT);
        Self {
            bucket_width_ms: window_ms / BUCKET_COUNT,
            buckets: Mutex::new(VecDeque::with_capacity(BUCKET_COUNT as usize + 1)),
        }
    }

    fn rotate(&self, buckets: &mut VecDeque<Bucket>, epoch: u64) {
        match buckets.back() {
            Some(back) if back.epoch == epoch => {}
            _ => buckets.push_back(Bucket {
                epoch,
                hits: 0,
                misses: 0,
            }),
        }
        let oldest_live = epoch.saturating_sub(BUCKET_COUNT - 1);
        while buckets.front().map(|b| b.epoch < oldest_live).unwrap_or(false) {
            buckets.pop_front();
        }
    }

    /// Record one outcome at `now_ms`.
    pub fn record(&self, hit: bool, now_ms: u64) {
        let epoch = now_ms / self.bucket_width_ms;
        let mut buckets = self.buckets.lock();
        self.rotate(&mut buckets, epoch);
        let back = buckets.back_mut().expect("rotate leaves a current bucket");
        if hit {
            back.hits += 1;
        } else {
            back.misses += 1;
        }
    }

    /// (hits, misses) inside the window ending at `now_ms`.
    pub fn counts(&self, now_ms: u64) -> (u64, u64) {
        let epoch = now_ms / self.bucket_width_ms;
        let oldest_live = epoch.saturating_sub(BUCKET_COUNT - 1);
        let buckets = self.buckets.lock();
        buckets
            .iter()
            .filter(|b| b.epoch >= oldest_live)
            .fold((0, 0), |(h, m), b| (h + b.hits, m + b.misses))
    }

    /// Hit ratio inside the window; None while the window is empty.
    pub fn ratio(&self, now_ms: u64) -> Option<f64> {
        let (hits, misses) = self.counts(now_ms);
        let total = hits + misses;
        if total == 0 {
            None
        } else {
            Some(hits as f64 / total as f64)
        }
    }
}

/// Bounded ring of latency samples in microseconds.
#[derive(Debug)]
pub struct LatencyRing {
    capacity: usize,
    samples: Mutex<VecDeque<u64>>,
}

impl LatencyRing {
    /// Create a ring keeping the most recent `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Record one sample.
    pub fn record(&self, latency: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency.as_micros() as u64);
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    /// True when no samples are retained.
    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// p95 of the retained samples, in microseconds.
    pub fn p95_us(&self) -> Option<u64> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }
}

// =============================================================================
// Tests
// =============================================================================
