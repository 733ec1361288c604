//! Gate counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for gate decisions.
#[derive(Debug, Default)]
pub struct GateMetrics {
    triggers_full: AtomicU64,
    triggers_forced: AtomicU64,
    top_ups: AtomicU64,
    duplicates_suppressed: AtomicU64,
    stalls: AtomicU64,
    publish_failures: AtomicU64,
}

/// Point-in-time copy of [`GateMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateMetricsSnapshot {
    /// Triggers fired with every expected sub-unit complete.
    pub triggers_full: u64,
    /// Triggers forced after `max_wait`.
    pub triggers_forced: u64,
    /// Full triggers re-issued after a forced one.
    pub top_ups: u64,
    /// Triggers not sent because the epoch already fired.
    pub duplicates_suppressed: u64,
    /// Stall alerts raised.
    pub stalls: u64,
    /// Triggers the bus rejected.
    pub publish_failures: u64,
}

impl GateMetrics {
    pub(crate) fn record_full(&self, top_up: bool) {
        self.triggers_full.fetch_add(1, Ordering::Relaxed);
        if top_up {
            self.top_ups.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_forced(&self) {
        self.triggers_forced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> GateMetricsSnapshot {
        GateMetricsSnapshot {
            triggers_full: self.triggers_full.load(Ordering::Relaxed),
            triggers_forced: self.triggers_forced.load(Ordering::Relaxed),
            top_ups: self.top_ups.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}
