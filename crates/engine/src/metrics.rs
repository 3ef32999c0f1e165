//! Coordinator counters
//!
//! All counters use Relaxed ordering: they are observational only and do not
//! synchronize any other memory. Approximate values under contention are fine.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a coordinator
#[derive(Debug, Default)]
pub(crate) struct CoordinatorMetrics {
    active: AtomicU64,
    started: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    privileged: AtomicU64,
    audit_failures: AtomicU64,
    cleanup_failures: AtomicU64,
    system_calls: AtomicU64,
}

impl CoordinatorMetrics {
    /// Count a scoped transaction as begun and open until the guard drops
    pub(crate) fn record_start(&self) -> ActiveTxn<'_> {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.started.fetch_add(1, Ordering::Relaxed);
        ActiveTxn { metrics: self }
    }

    pub(crate) fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_privileged(&self) {
        self.privileged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_audit_failure(&self) {
        self.audit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cleanup_failures(&self, count: u64) {
        if count > 0 {
            self.cleanup_failures.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_system_call(&self) {
        self.system_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active: self.active.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            privileged: self.privileged.load(Ordering::Relaxed),
            audit_failures: self.audit_failures.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            system_calls: self.system_calls.load(Ordering::Relaxed),
        }
    }
}

/// Holds one slot of the `active` gauge
///
/// Dropped on every exit from a scoped transaction, including a cancelled
/// future or a panicking callback, which never reach commit or rollback.
#[must_use]
pub(crate) struct ActiveTxn<'a> {
    metrics: &'a CoordinatorMetrics,
}

impl Drop for ActiveTxn<'_> {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the coordinator counters
///
/// `started`, `committed` and `rolled_back` count scoped transactions (tenant
/// and privileged). System-context calls open no transaction and are counted
/// separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Scoped transactions currently open
    pub active: u64,
    /// Scoped transactions begun
    pub started: u64,
    /// Scoped transactions committed
    pub committed: u64,
    /// Scoped transactions rolled back, including failed commits
    pub rolled_back: u64,
    /// Privileged transactions begun
    pub privileged: u64,
    /// Privileged transactions refused because the audit row failed
    pub audit_failures: u64,
    /// Session settings that could not be cleared at teardown
    pub cleanup_failures: u64,
    /// System-context calls
    pub system_calls: u64,
}

impl MetricsSnapshot {
    /// Transactions that reached a terminal state
    pub fn total_completed(&self) -> u64 {
        self.committed + self.rolled_back
    }

    /// Commit success rate (committed / started)
    pub fn commit_rate(&self) -> f64 {
        if self.started > 0 {
            self.committed as f64 / self.started as f64
        } else {
            0.0
        }
    }
}
