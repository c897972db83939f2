//! Observable entities.
//!
//! An entity is any shared (`Arc`) object implementing [`Observable`]. It
//! embeds an [`ObservableCore`] that fixes its thread affinity at construction
//! and counts subscribers. The first subscriber registers the entity with the
//! active scope and the last one unregisters it.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use crate::accessor::Accessor;
use crate::scope::Scope;

/// Where an entity's getters and notifications may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Affinity {
    /// Only on the entity's home execution context.
    #[default]
    ThreadAffine,
    /// On any thread, including the monitor thread.
    ThreadSafe,
}

/// Per-entity state the monitor relies on.
#[derive(Debug, Default)]
pub struct ObservableCore {
    affinity: Affinity,
    subscribers: AtomicUsize,
    /// Held while registration is brought in line with the count.
    sync: Mutex<()>,
}

impl ObservableCore {
    /// Creates a core with a fixed affinity.
    #[must_use]
    pub const fn new(affinity: Affinity) -> Self {
        Self {
            affinity,
            subscribers: AtomicUsize::new(0),
            sync: Mutex::new(()),
        }
    }

    /// The affinity chosen at construction.
    #[must_use]
    pub const fn affinity(&self) -> Affinity {
        self.affinity
    }

    /// Returns true if getters may run on any thread.
    #[must_use]
    pub fn is_thread_safe(&self) -> bool {
        self.affinity == Affinity::ThreadSafe
    }

    /// Current number of subscribers.
    ///
    /// Safe to call from the entity's own getters, including while the
    /// entity is being registered.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }
}

/// An entity whose members are watched for value changes.
pub trait Observable: Send + Sync + 'static {
    /// The embedded monitor state.
    fn observable_core(&self) -> &ObservableCore;

    /// Ordered observable members of this type.
    ///
    /// Called at most once per type per accessor cache.
    fn accessors() -> Vec<Accessor<Self>>
    where
        Self: Sized;

    /// Delivers one change notification.
    ///
    /// Runs on the home context for thread-affine entities and on the monitor
    /// thread for thread-safe ones.
    fn member_changed(&self, change: &MemberChange);
}

/// What changed about a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// The member value (or command identity).
    Value,
    /// The command's runnable or running state.
    Runnable,
}

/// A change notification for one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberChange {
    member: Arc<str>,
    owner: &'static str,
    kind: ChangeKind,
}

impl MemberChange {
    pub(crate) fn new(member: Arc<str>, owner: &'static str, kind: ChangeKind) -> Self {
        Self { member, owner, kind }
    }

    /// Member name.
    #[must_use]
    pub fn member(&self) -> &str {
        &self.member
    }

    /// Declaring type name.
    #[must_use]
    pub const fn owner(&self) -> &'static str {
        self.owner
    }

    /// What changed.
    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        self.kind
    }
}

/// Identity of a registered entity: the address of its shared allocation.
///
/// The monitor keeps a `Weak` to every registered entity, which pins the
/// allocation, so a key is never reused while the entity is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey(usize);

impl EntityKey {
    /// Key of `entity`.
    #[must_use]
    pub fn of<T: ?Sized>(entity: &Arc<T>) -> Self {
        Self(Arc::as_ptr(entity).cast::<()>() as usize)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Records a new subscriber. The 0→1 transition registers the entity with
/// the active scope. Returns the new count.
///
/// With no active scope the count still moves but nothing is registered, and
/// a scope created later does not pick the entity up. Subscribe after the
/// scope exists, or register with [`ScopeHandle::register`] directly.
///
/// [`ScopeHandle::register`]: crate::ScopeHandle::register
pub fn add_subscriber<T: Observable>(entity: &Arc<T>) -> usize {
    let count = entity.observable_core().subscribers.fetch_add(1, Ordering::AcqRel) + 1;
    if count == 1 {
        sync_registration(entity);
    }
    count
}

/// Drops a subscriber. The 1→0 transition unregisters the entity. Removing
/// from a zero count does nothing. Returns the new count.
pub fn remove_subscriber<T: Observable>(entity: &Arc<T>) -> usize {
    let updated = entity.observable_core().subscribers.fetch_update(
        Ordering::AcqRel,
        Ordering::Acquire,
        |count| count.checked_sub(1),
    );
    match updated {
        Ok(1) => {
            sync_registration(entity);
            0
        }
        Ok(previous) => previous - 1,
        Err(_) => 0,
    }
}

/// Registers or unregisters `entity` so it matches its subscriber count.
///
/// The count lock is never held here, so getters run by registration may
/// read it. A caller that finds the sync lock busy leaves the work to the
/// holder, which re-checks the count after releasing it.
fn sync_registration<T: Observable>(entity: &Arc<T>) {
    let core = entity.observable_core();
    loop {
        let guard = match core.sync.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        let Some(scope) = Scope::current() else {
            return;
        };
        let wanted = core.subscriber_count() > 0;
        if wanted {
            scope.register(entity);
        } else {
            scope.unregister(entity);
        }
        drop(guard);
        if (core.subscriber_count() > 0) == wanted {
            return;
        }
    }
}
