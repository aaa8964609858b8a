//! Synchronization metrics.
//!
//! Tracks poll health, notification throughput, reconciliation outcomes, and
//! action results.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::store::Rule;

/// Counters shared by every worker.
///
/// Uses atomics for lock-free access across tasks.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    polls_succeeded: AtomicU64,
    polls_failed: AtomicU64,
    forced_polls: AtomicU64,

    notifications_applied: AtomicU64,
    duplicates_dropped: AtomicU64,
    resubscribes: AtomicU64,

    /// Writes the policy held back until an action resolves.
    writes_deferred: AtomicU64,
    /// Stale writes, and writes aimed at an account that is no longer active.
    writes_discarded: AtomicU64,

    actions_submitted: AtomicU64,
    actions_confirmed: AtomicU64,
    actions_reconciled: AtomicU64,
    actions_failed: AtomicU64,

    observer_panics: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_poll(&self, success: bool) {
        if success {
            bump(&self.polls_succeeded);
        } else {
            bump(&self.polls_failed);
        }
    }

    pub fn record_forced_poll(&self) {
        bump(&self.forced_polls);
    }

    pub fn record_notification(&self) {
        bump(&self.notifications_applied);
    }

    pub fn record_duplicate(&self) {
        bump(&self.duplicates_dropped);
    }

    pub fn record_resubscribe(&self) {
        bump(&self.resubscribes);
    }

    /// Counts policy outcomes that did not land.
    pub fn record_rule(&self, rule: Rule) {
        match rule {
            Rule::Deferred => bump(&self.writes_deferred),
            Rule::Stale => bump(&self.writes_discarded),
            _ => {}
        }
    }

    pub fn record_discarded(&self) {
        bump(&self.writes_discarded);
    }

    pub fn record_submitted(&self) {
        bump(&self.actions_submitted);
    }

    pub fn record_confirmed(&self) {
        bump(&self.actions_confirmed);
    }

    pub fn record_reconciled(&self) {
        bump(&self.actions_reconciled);
    }

    pub fn record_failed(&self) {
        bump(&self.actions_failed);
    }

    pub fn record_observer_panic(&self) {
        bump(&self.observer_panics);
    }

    /// Creates a snapshot of all metrics for display/logging.
    ///
    /// Individual counters are read atomically, the snapshot as a whole is not.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            polls_succeeded: load(&self.polls_succeeded),
            polls_failed: load(&self.polls_failed),
            forced_polls: load(&self.forced_polls),
            notifications_applied: load(&self.notifications_applied),
            duplicates_dropped: load(&self.duplicates_dropped),
            resubscribes: load(&self.resubscribes),
            writes_deferred: load(&self.writes_deferred),
            writes_discarded: load(&self.writes_discarded),
            actions_submitted: load(&self.actions_submitted),
            actions_confirmed: load(&self.actions_confirmed),
            actions_reconciled: load(&self.actions_reconciled),
            actions_failed: load(&self.actions_failed),
            observer_panics: load(&self.observer_panics),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub polls_succeeded: u64,
    pub polls_failed: u64,
    pub forced_polls: u64,
    pub notifications_applied: u64,
    pub duplicates_dropped: u64,
    pub resubscribes: u64,
    pub writes_deferred: u64,
    pub writes_discarded: u64,
    pub actions_submitted: u64,
    pub actions_confirmed: u64,
    pub actions_reconciled: u64,
    pub actions_failed: u64,
    pub observer_panics: u64,
}

impl MetricsSnapshot {
    /// Share of polls that succeeded, as a percentage (0-100).
    pub fn poll_success_rate(&self) -> f64 {
        let total = self.polls_succeeded + self.polls_failed;
        if total == 0 {
            100.0
        } else {
            (self.polls_succeeded as f64 / total as f64) * 100.0
        }
    }
}
