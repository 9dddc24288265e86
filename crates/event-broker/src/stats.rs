//! Per-broker delivery counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by a broker and its delivery tasks.
#[derive(Debug, Default)]
pub struct BrokerStats {
    published: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
}

impl BrokerStats {
    /// Count one event accepted by `publish`.
    pub fn record_publish(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one handler invocation that returned normally.
    pub fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one handler invocation that panicked.
    pub fn record_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot with the caller-supplied subscription count.
    ///
    /// Counters are read independently, so a snapshot taken while events
    /// flow may be off by in-progress deliveries.
    #[must_use]
    pub fn snapshot(&self, subscriptions: usize) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            subscriptions,
        }
    }
}

/// Point-in-time view of [`BrokerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    /// Events accepted by `publish`.
    pub published: u64,
    /// Handler invocations that returned normally.
    pub delivered: u64,
    /// Handler invocations that panicked.
    pub handler_failures: u64,
    /// Live local subscriptions.
    pub subscriptions: usize,
}
