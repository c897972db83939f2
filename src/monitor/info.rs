//! Per-entity monitoring record.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::accessor::Accessor;
use crate::entity::{EntityKey, Observable};

use super::bag::ValueBag;
use super::stats::MonitorStats;

/// Whether the entity behind an entry still exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Liveness {
    Alive,
    Collected,
}

/// Type-erased view of an [`Info`] used by the registry and the cycle.
pub(crate) trait Entry: Send + Sync {
    fn key(&self) -> EntityKey;
    fn is_thread_safe(&self) -> bool;
    fn type_name(&self) -> &'static str;
    fn is_collected(&self) -> bool;
    fn refresh(&self, stats: &MonitorStats) -> Liveness;
    fn analyze(&self, stats: &MonitorStats) -> bool;
    fn notify(&self, stats: &MonitorStats) -> Liveness;
}

/// Monitoring record for one entity: a weak back-reference plus one bag per
/// observable member, in accessor order.
pub(crate) struct Info<T> {
    key: EntityKey,
    entity: Weak<T>,
    thread_safe: bool,
    collected: AtomicBool,
    bags: Mutex<Vec<ValueBag<T>>>,
}

impl<T: Observable> Info<T> {
    /// Builds the record, taking the initial reading of every member.
    pub(crate) fn new(entity: &Arc<T>, accessors: &[Accessor<T>], stats: &MonitorStats) -> Self {
        let bags = accessors
            .iter()
            .map(|accessor| ValueBag::new(accessor.clone(), entity, stats))
            .collect();
        Self {
            key: EntityKey::of(entity),
            entity: Arc::downgrade(entity),
            thread_safe: entity.observable_core().is_thread_safe(),
            collected: AtomicBool::new(false),
            bags: Mutex::new(bags),
        }
    }

    /// Strong reference for the duration of one access, or `None` once the
    /// entity is gone (which also marks the record for pruning).
    fn upgrade(&self) -> Option<Arc<T>> {
        let entity = self.entity.upgrade();
        if entity.is_none() {
            self.collected.store(true, Ordering::Release);
        }
        entity
    }

    fn lock_bags(&self) -> MutexGuard<'_, Vec<ValueBag<T>>> {
        self.bags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn with_bags<R>(&self, f: impl FnOnce(&[ValueBag<T>]) -> R) -> R {
        f(&self.lock_bags())
    }
}

impl<T: Observable> Entry for Info<T> {
    fn key(&self) -> EntityKey {
        self.key
    }

    fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn is_collected(&self) -> bool {
        self.collected.load(Ordering::Acquire)
    }

    fn refresh(&self, stats: &MonitorStats) -> Liveness {
        let Some(entity) = self.upgrade() else {
            return Liveness::Collected;
        };
        for bag in self.lock_bags().iter_mut() {
            bag.refresh(&entity, stats);
        }
        Liveness::Alive
    }

    fn analyze(&self, stats: &MonitorStats) -> bool {
        let mut changed = false;
        for bag in self.lock_bags().iter_mut() {
            changed |= bag.analyze(stats);
        }
        changed
    }

    fn notify(&self, stats: &MonitorStats) -> Liveness {
        let Some(entity) = self.upgrade() else {
            return Liveness::Collected;
        };
        for bag in self.lock_bags().iter_mut() {
            bag.notify(&entity, stats);
        }
        Liveness::Alive
    }
}

impl<T: Observable> fmt::Debug for Info<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bags = self.lock_bags();
        let members: Vec<&str> = bags.iter().map(ValueBag::name).collect();
        f.debug_struct("Info")
            .field("key", &self.key)
            .field("type", &self.type_name())
            .field("thread_safe", &self.thread_safe)
            .field("collected", &self.is_collected())
            .field("members", &members)
            .finish()
    }
}
