//! Registry of monitored entities.
//!
//! Holds the entity→Info map and two disjoint key sets (thread-affine,
//! thread-safe). The lock is only held to copy, insert or remove; Info
//! construction and every user callback run outside it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::accessor::AccessorCache;
use crate::entity::{EntityKey, Observable};

use super::info::{Entry, Info};
use super::stats::MonitorStats;

#[derive(Default)]
struct RegistryState {
    infos: HashMap<EntityKey, Arc<dyn Entry>>,
    thread_affine: HashSet<EntityKey>,
    thread_safe: HashSet<EntityKey>,
}

impl RegistryState {
    fn set_for(&mut self, thread_safe: bool) -> &mut HashSet<EntityKey> {
        if thread_safe {
            &mut self.thread_safe
        } else {
            &mut self.thread_affine
        }
    }

    fn collect(&self, keys: &HashSet<EntityKey>) -> Vec<Arc<dyn Entry>> {
        keys.iter()
            .filter_map(|key| self.infos.get(key).cloned())
            .collect()
    }
}

/// Entries copied out of the registry for one cycle.
pub(crate) struct RegistrySnapshot {
    pub(crate) thread_affine: Vec<Arc<dyn Entry>>,
    pub(crate) thread_safe: Vec<Arc<dyn Entry>>,
}

impl RegistrySnapshot {
    pub(crate) fn len(&self) -> usize {
        self.thread_affine.len() + self.thread_safe.len()
    }
}

fn same_entry(a: &Arc<dyn Entry>, b: &Arc<dyn Entry>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

#[derive(Default)]
pub(crate) struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `entity`, creating its Info on first sight.
    ///
    /// Returns false if the entity was already registered.
    pub(crate) fn register<T: Observable>(
        &self,
        entity: &Arc<T>,
        cache: &AccessorCache,
        stats: &MonitorStats,
    ) -> bool {
        let key = EntityKey::of(entity);
        let existing = self.lock().infos.get(&key).cloned();

        let candidate = match existing {
            Some(info) => info,
            None => {
                let accessors = cache.get_or_build::<T, _>(T::accessors);
                Arc::new(Info::new(entity, &accessors, stats)) as Arc<dyn Entry>
            }
        };

        let mut state = self.lock();
        let info = Arc::clone(state.infos.entry(key).or_insert(candidate));
        let inserted = state.set_for(info.is_thread_safe()).insert(key);
        if inserted {
            debug!(
                entity = %key,
                entity_type = info.type_name(),
                thread_safe = info.is_thread_safe(),
                "entity registered"
            );
        }
        inserted
    }

    /// Removes `key` from both sets and drops its Info.
    ///
    /// Returns false if nothing was registered under `key`.
    pub(crate) fn unregister(&self, key: EntityKey) -> bool {
        let mut state = self.lock();
        let in_affine = state.thread_affine.remove(&key);
        let in_safe = state.thread_safe.remove(&key);
        let had_info = state.infos.remove(&key).is_some();
        let removed = in_affine || in_safe || had_info;
        if removed {
            debug!(entity = %key, "entity unregistered");
        }
        removed
    }

    pub(crate) fn snapshot(&self) -> RegistrySnapshot {
        let state = self.lock();
        RegistrySnapshot {
            thread_affine: state.collect(&state.thread_affine),
            thread_safe: state.collect(&state.thread_safe),
        }
    }

    /// Removes the given entries, but only if the map still holds that exact
    /// Info for their key. Returns the number removed.
    pub(crate) fn prune(&self, doomed: &[Arc<dyn Entry>]) -> usize {
        if doomed.is_empty() {
            return 0;
        }
        let mut state = self.lock();
        let mut removed = 0;
        for entry in doomed {
            let key = entry.key();
            let matches = state
                .infos
                .get(&key)
                .is_some_and(|current| same_entry(current, entry));
            if !matches {
                continue;
            }
            state.infos.remove(&key);
            state.thread_affine.remove(&key);
            state.thread_safe.remove(&key);
            removed += 1;
            debug!(entity = %key, entity_type = entry.type_name(), "collected entity pruned");
        }
        removed
    }

    pub(crate) fn contains(&self, key: EntityKey) -> bool {
        let state = self.lock();
        state.thread_affine.contains(&key) || state.thread_safe.contains(&key)
    }

    pub(crate) fn len(&self) -> usize {
        let state = self.lock();
        state.thread_affine.len() + state.thread_safe.len()
    }

    #[cfg(test)]
    fn membership(&self, key: EntityKey) -> (bool, bool, bool) {
        let state = self.lock();
        (
            state.thread_affine.contains(&key),
            state.thread_safe.contains(&key),
            state.infos.contains_key(&key),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use crate::entity::Affinity;
    use crate::monitor::testing::widget;

    #[test]
    fn register_partitions_by_affinity() {
        let registry = Registry::default();
        let cache = AccessorCache::new();
        let stats = MonitorStats::default();

        let affine = widget(0, Affinity::ThreadAffine);
        let safe = widget(0, Affinity::ThreadSafe);
        assert!(registry.register(&affine, &cache, &stats));
        assert!(registry.register(&safe, &cache, &stats));

        assert_eq!(registry.membership(EntityKey::of(&affine)), (true, false, true));
        assert_eq!(registry.membership(EntityKey::of(&safe)), (false, true, true));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.thread_affine.len(), 1);
        assert_eq!(snapshot.thread_safe.len(), 1);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn double_register_single_unregister_removes_fully() {
        let registry = Registry::default();
        let cache = AccessorCache::new();
        let stats = MonitorStats::default();
        let w = widget(0, Affinity::ThreadAffine);

        assert!(registry.register(&w, &cache, &stats));
        assert!(!registry.register(&w, &cache, &stats));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(EntityKey::of(&w)));
        assert_eq!(registry.membership(EntityKey::of(&w)), (false, false, false));
        assert_eq!(registry.len(), 0);
        assert!(!registry.unregister(EntityKey::of(&w)));
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let registry = Registry::default();
        let w = widget(0, Affinity::ThreadSafe);
        assert!(!registry.unregister(EntityKey::of(&w)));
        assert!(!registry.contains(EntityKey::of(&w)));
    }

    #[test]
    fn info_is_memoized_across_registrations() {
        let registry = Registry::default();
        let cache = AccessorCache::new();
        let stats = MonitorStats::default();
        let w = widget(0, Affinity::ThreadSafe);

        registry.register(&w, &cache, &stats);
        let first = registry.snapshot().thread_safe.remove(0);
        registry.register(&w, &cache, &stats);
        let second = registry.snapshot().thread_safe.remove(0);
        assert!(same_entry(&first, &second));
    }

    #[test]
    fn registry_does_not_keep_entities_alive() {
        let registry = Registry::default();
        let cache = AccessorCache::new();
        let stats = MonitorStats::default();
        let w = widget(0, Affinity::ThreadSafe);
        registry.register(&w, &cache, &stats);
        assert_eq!(Arc::strong_count(&w), 1);
    }

    #[test]
    fn prune_only_removes_matching_info() {
        let registry = Registry::default();
        let cache = AccessorCache::new();
        let stats = MonitorStats::default();
        let w = widget(0, Affinity::ThreadSafe);

        registry.register(&w, &cache, &stats);
        let stale = registry.snapshot().thread_safe.remove(0);

        // Re-registration after an explicit unregister builds a fresh Info.
        registry.unregister(EntityKey::of(&w));
        registry.register(&w, &cache, &stats);

        assert_eq!(registry.prune(&[stale]), 0);
        assert!(registry.contains(EntityKey::of(&w)));

        let live = registry.snapshot().thread_safe.remove(0);
        assert_eq!(registry.prune(&[live]), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn concurrent_registration_is_consistent() {
        let registry = Arc::new(Registry::default());
        let cache = Arc::new(AccessorCache::new());
        let stats = Arc::new(MonitorStats::default());
        let entities: Vec<_> = (0..32)
            .map(|i| {
                let affinity = if i % 2 == 0 {
                    Affinity::ThreadAffine
                } else {
                    Affinity::ThreadSafe
                };
                widget(i, affinity)
            })
            .collect();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let cache = Arc::clone(&cache);
                let stats = Arc::clone(&stats);
                let entities = entities.clone();
                thread::spawn(move || {
                    for e in &entities {
                        registry.register(e, &cache, &stats);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.thread_affine.len(), 16);
        assert_eq!(snapshot.thread_safe.len(), 16);
    }
}
