//! Global atomic counters for tracker observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when the engine shuts down).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters: no allocations, no locking.
pub struct Metrics {
    readings_observed: AtomicU64,
    readings_dropped: AtomicU64,
    battles_closed: AtomicU64,
    corrections_applied: AtomicU64,
    corrections_failed: AtomicU64,
    corrections_discarded: AtomicU64,
    persistence_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            readings_observed: AtomicU64::new(0),
            readings_dropped: AtomicU64::new(0),
            battles_closed: AtomicU64::new(0),
            corrections_applied: AtomicU64::new(0),
            corrections_failed: AtomicU64::new(0),
            corrections_discarded: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
        }
    }

    pub fn inc_readings_observed(&self) {
        self.readings_observed.fetch_add(1, Ordering::Relaxed);
    }

    /// Reading filtered out by the poller (low confidence or out of order).
    pub fn inc_readings_dropped(&self) {
        self.readings_dropped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "readings_dropped", "counter incremented");
    }

    pub fn inc_battles_closed(&self) {
        self.battles_closed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "battles_closed", "counter incremented");
    }

    pub fn inc_corrections_applied(&self) {
        self.corrections_applied.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "corrections_applied", "counter incremented");
    }

    /// Correction gave up (timeout or unavailable); the estimate stands.
    pub fn inc_corrections_failed(&self) {
        self.corrections_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "corrections_failed", "counter incremented");
    }

    /// Correction arrived for a battle outside the current session, or twice.
    pub fn inc_corrections_discarded(&self) {
        self.corrections_discarded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "corrections_discarded", "counter incremented");
    }

    pub fn inc_persistence_failures(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "persistence_failures", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            readings_observed = self.readings_observed(),
            readings_dropped = self.readings_dropped(),
            battles_closed = self.battles_closed(),
            corrections_applied = self.corrections_applied(),
            corrections_failed = self.corrections_failed(),
            corrections_discarded = self.corrections_discarded(),
            persistence_failures = self.persistence_failures(),
        );
    }

    pub fn readings_observed(&self) -> u64 {
        self.readings_observed.load(Ordering::Relaxed)
    }

    pub fn readings_dropped(&self) -> u64 {
        self.readings_dropped.load(Ordering::Relaxed)
    }

    pub fn battles_closed(&self) -> u64 {
        self.battles_closed.load(Ordering::Relaxed)
    }

    pub fn corrections_applied(&self) -> u64 {
        self.corrections_applied.load(Ordering::Relaxed)
    }

    pub fn corrections_failed(&self) -> u64 {
        self.corrections_failed.load(Ordering::Relaxed)
    }

    pub fn corrections_discarded(&self) -> u64 {
        self.corrections_discarded.load(Ordering::Relaxed)
    }

    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.readings_observed,
            &self.readings_dropped,
            &self.battles_closed,
            &self.corrections_applied,
            &self.corrections_failed,
            &self.corrections_discarded,
            &self.persistence_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
