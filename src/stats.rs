//! Per-route query counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// How a query was finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Cached,
    Blocked,
    Redirected,
    Circumvented,
    Forwarded,
    /// Circumvention failed and the backup resolver answered.
    Fallback,
    /// No reply was sent.
    Dropped,
}

/// Atomic statistics, reset on every snapshot.
#[derive(Default)]
pub struct Stats {
    requests: AtomicU64,
    cached: AtomicU64,
    blocked: AtomicU64,
    redirected: AtomicU64,
    circumvented: AtomicU64,
    forwarded: AtomicU64,
    fallback: AtomicU64,
    dropped: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: Outcome, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.counter(outcome).fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn counter(&self, outcome: Outcome) -> &AtomicU64 {
        match outcome {
            Outcome::Cached => &self.cached,
            Outcome::Blocked => &self.blocked,
            Outcome::Redirected => &self.redirected,
            Outcome::Circumvented => &self.circumvented,
            Outcome::Forwarded => &self.forwarded,
            Outcome::Fallback => &self.fallback,
            Outcome::Dropped => &self.dropped,
        }
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let avg_response_ms = if requests > 0 {
            (total_us as f64 / requests as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            requests,
            cached: self.cached.swap(0, Ordering::Relaxed),
            blocked: self.blocked.swap(0, Ordering::Relaxed),
            redirected: self.redirected.swap(0, Ordering::Relaxed),
            circumvented: self.circumvented.swap(0, Ordering::Relaxed),
            forwarded: self.forwarded.swap(0, Ordering::Relaxed),
            fallback: self.fallback.swap(0, Ordering::Relaxed),
            dropped: self.dropped.swap(0, Ordering::Relaxed),
            avg_response_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub cached: u64,
    pub blocked: u64,
    pub redirected: u64,
    pub circumvented: u64,
    pub forwarded: u64,
    pub fallback: u64,
    pub dropped: u64,
    pub avg_response_ms: f64,
}
