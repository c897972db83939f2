//! Monitor counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of one finished cycle.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleSample {
    pub finished_at: DateTime<Utc>,
    pub duration_us: u64,
    pub entries: usize,
    pub changed: usize,
    pub pruned: usize,
}

/// Point-in-time copy of [`MonitorStats`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub entries_processed: u64,
    pub notifications: u64,
    pub read_faults: u64,
    pub equality_faults: u64,
    pub notify_faults: u64,
    pub pruned: u64,
    pub last_cycle: Option<CycleSample>,
}

/// Diagnostic counters updated by the monitor.
///
/// Fault counters move exactly when a fault is logged, i.e. once per
/// transition into the faulted state, not once per failing read.
#[derive(Debug, Default)]
pub struct MonitorStats {
    cycles: AtomicU64,
    entries_processed: AtomicU64,
    notifications: AtomicU64,
    read_faults: AtomicU64,
    equality_faults: AtomicU64,
    notify_faults: AtomicU64,
    pruned: AtomicU64,
    last_cycle: Mutex<Option<CycleSample>>,
}

impl MonitorStats {
    pub(crate) fn record_read_fault(&self) {
        self.read_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_equality_fault(&self) {
        self.equality_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_notify_fault(&self) {
        self.notify_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_notifications(&self, delivered: usize) {
        self.notifications.fetch_add(delivered as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_cycle(&self, elapsed: Duration, entries: usize, changed: usize, pruned: usize) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.entries_processed.fetch_add(entries as u64, Ordering::Relaxed);
        self.pruned.fetch_add(pruned as u64, Ordering::Relaxed);

        let sample = CycleSample {
            finished_at: Utc::now(),
            duration_us: elapsed.as_micros().min(u128::from(u64::MAX)) as u64,
            entries,
            changed,
            pruned,
        };
        *self.last_cycle.lock().unwrap_or_else(PoisonError::into_inner) = Some(sample);
    }

    /// Completed cycles.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Delivered change notifications.
    #[must_use]
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }

    /// Logged read faults.
    #[must_use]
    pub fn read_faults(&self) -> u64 {
        self.read_faults.load(Ordering::Relaxed)
    }

    /// Logged equality faults.
    #[must_use]
    pub fn equality_faults(&self) -> u64 {
        self.equality_faults.load(Ordering::Relaxed)
    }

    /// Logged notification faults.
    #[must_use]
    pub fn notify_faults(&self) -> u64 {
        self.notify_faults.load(Ordering::Relaxed)
    }

    /// Entries pruned because their entity was dropped.
    #[must_use]
    pub fn pruned(&self) -> u64 {
        self.pruned.load(Ordering::Relaxed)
    }

    /// Copies every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles(),
            entries_processed: self.entries_processed.load(Ordering::Relaxed),
            notifications: self.notifications(),
            read_faults: self.read_faults(),
            equality_faults: self.equality_faults(),
            notify_faults: self.notify_faults(),
            pruned: self.pruned(),
            last_cycle: self
                .last_cycle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}
