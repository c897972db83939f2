//! Change-detection engine.
//!
//! [`Monitor`] owns the registry of watched entities and runs one detection
//! cycle at a time: snapshot, refresh, analyze, notify, prune. The background
//! [`Scope`](crate::scope::Scope) drives it on a timer; tests, benches and
//! embedders with their own scheduler can call [`Monitor::run_cycle`]
//! directly.

/// Per-member diff state.
mod bag;
/// Per-entity record.
mod info;
/// Entity registry.
mod registry;
/// Diagnostic counters.
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

use std::cell::Cell;
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::accessor::AccessorCache;
use crate::context::NotificationContext;
use crate::entity::{EntityKey, Observable};
use crate::error::{MonitorError, MonitorResult};

use self::info::Entry;
use self::registry::Registry;

pub use stats::{CycleSample, MonitorStats, StatsSnapshot};

thread_local! {
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// Returns true while the current thread runs work a monitor cycle handed to
/// its notification context, and the cycle is blocked waiting for it.
pub(crate) fn is_dispatching() -> bool {
    DISPATCHING.with(Cell::get)
}

/// Marks the current thread as running dispatched cycle work until dropped.
struct DispatchMark {
    outer: bool,
}

impl DispatchMark {
    fn enter() -> Self {
        Self {
            outer: DISPATCHING.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for DispatchMark {
    fn drop(&mut self) {
        DISPATCHING.with(|flag| flag.set(self.outer));
    }
}

/// Summary of one cycle.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub entries: usize,
    pub changed: usize,
    pub pruned: usize,
}

/// Registry plus cycle driver.
pub struct Monitor {
    registry: Registry,
    cache: Arc<AccessorCache>,
    stats: Arc<MonitorStats>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("registered", &self.len())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Creates a monitor using the process-wide accessor cache.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cache(AccessorCache::global())
    }

    /// Creates a monitor with its own accessor cache.
    #[must_use]
    pub fn with_cache(cache: Arc<AccessorCache>) -> Self {
        Self {
            registry: Registry::default(),
            cache,
            stats: Arc::new(MonitorStats::default()),
        }
    }

    /// Starts watching `entity`. Idempotent; returns false if it was
    /// already registered.
    pub fn register<T: Observable>(&self, entity: &Arc<T>) -> bool {
        self.registry.register(entity, &self.cache, &self.stats)
    }

    /// Stops watching `entity`. Idempotent; safe for unknown entities.
    pub fn unregister<T: ?Sized>(&self, entity: &Arc<T>) -> bool {
        self.registry.unregister(EntityKey::of(entity))
    }

    /// Returns true if `entity` is in either set.
    #[must_use]
    pub fn is_registered<T: ?Sized>(&self, entity: &Arc<T>) -> bool {
        self.registry.contains(EntityKey::of(entity))
    }

    /// Number of registered entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Diagnostic counters.
    #[must_use]
    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    /// Runs one full cycle through `context`.
    pub fn run_cycle(&self, context: &dyn NotificationContext) -> MonitorResult<CycleReport> {
        self.run_cycle_until(context, &|| false)
    }

    /// Runs one cycle, bailing out with `Cancelled` between phases once
    /// `cancelled` reports true.
    pub(crate) fn run_cycle_until(
        &self,
        context: &dyn NotificationContext,
        cancelled: &dyn Fn() -> bool,
    ) -> MonitorResult<CycleReport> {
        let started = Instant::now();
        let snapshot = self.registry.snapshot();
        let entries = snapshot.len();
        let affine: Arc<[Arc<dyn Entry>]> = snapshot.thread_affine.into();
        let safe = snapshot.thread_safe;

        // Refresh: home-context batch in flight while thread-safe entries
        // are read here.
        let pending = if affine.is_empty() {
            None
        } else {
            let batch = Arc::clone(&affine);
            let stats = Arc::clone(&self.stats);
            let handle = context
                .invoke_async(Box::new(move || {
                    let _mark = DispatchMark::enter();
                    for entry in batch.iter() {
                        entry.refresh(&stats);
                    }
                }))
                .ok_or(MonitorError::MissingDispatchHandle)?;
            Some(handle)
        };
        for entry in &safe {
            entry.refresh(&self.stats);
        }
        if let Some(handle) = pending {
            handle.wait()?;
        }
        if cancelled() {
            return Err(MonitorError::Cancelled);
        }

        // Analyze.
        let changed_affine = self.analyze_all(&affine);
        let changed_safe = self.analyze_all(&safe);
        let changed = changed_affine.len() + changed_safe.len();
        if cancelled() {
            return Err(MonitorError::Cancelled);
        }

        // Notify.
        if !changed_affine.is_empty() {
            let stats = Arc::clone(&self.stats);
            context.invoke(Box::new(move || {
                let _mark = DispatchMark::enter();
                for entry in &changed_affine {
                    entry.notify(&stats);
                }
            }))?;
        }
        for entry in &changed_safe {
            entry.notify(&self.stats);
        }

        // Prune.
        let doomed: Vec<Arc<dyn Entry>> = affine
            .iter()
            .chain(safe.iter())
            .filter(|entry| entry.is_collected())
            .cloned()
            .collect();
        let pruned = self.registry.prune(&doomed);

        let elapsed = started.elapsed();
        self.stats.record_cycle(elapsed, entries, changed, pruned);
        trace!(
            entries,
            changed,
            pruned,
            elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            "monitor cycle"
        );

        Ok(CycleReport {
            entries,
            changed,
            pruned,
        })
    }

    fn analyze_all(&self, entries: &[Arc<dyn Entry>]) -> Vec<Arc<dyn Entry>> {
        entries
            .iter()
            .filter(|entry| !entry.is_collected() && entry.analyze(&self.stats))
            .cloned()
            .collect()
    }
}
