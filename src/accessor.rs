//! Observable member accessors and the per-type accessor cache.
//!
//! An [`Accessor`] is a named getter for one observable member of an entity
//! type. How the list of accessors for a type is produced (hand-written,
//! generated, derived) is up to the entity; the monitor only asks the
//! [`AccessorCache`] for it once per type and reuses the result.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::error::{panic_message, ReadError};

/// A command whose "may run" state is observable.
pub trait Command: Send + Sync {
    /// Whether the command may run right now.
    fn can_execute(&self) -> bool;

    /// Whether an invocation is currently in flight.
    fn is_running(&self) -> bool {
        false
    }
}

/// A command taking a parameter.
///
/// Runnability depends on the parameter, which the monitor never sees, so the
/// monitor tracks [`ParameterizedCommand::is_running`] instead.
pub trait ParameterizedCommand: Send + Sync {
    /// Whether the command may run with `parameter`.
    fn can_execute_with(&self, parameter: &(dyn Any + Send + Sync)) -> bool;

    /// Whether an invocation is currently in flight.
    fn is_running(&self) -> bool;
}

/// Which value bag variant tracks a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    /// A plain property, compared by value or by reference identity.
    Property,
    /// An action command: identity plus `can_execute()`.
    Command,
    /// A parameterized command: identity plus `is_running()`.
    ParameterizedCommand,
}

/// Type-erased value with fallible-by-panic equality.
pub(crate) trait DynValue: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn DynValue) -> bool;
}

impl<V> DynValue for V
where
    V: PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn DynValue) -> bool {
        other
            .as_any()
            .downcast_ref::<V>()
            .is_some_and(|other| self == other)
    }
}

/// Address identity of a shared object.
///
/// Holds a `Weak`, which pins the allocation without keeping the object
/// alive, so the address cannot be reused while the snapshot exists.
pub(crate) struct Identity {
    addr: usize,
    _pin: Box<dyn Any + Send + Sync>,
}

impl Identity {
    pub(crate) fn of<V>(shared: Arc<V>) -> Self
    where
        V: ?Sized + Send + Sync + 'static,
    {
        let addr = Arc::as_ptr(&shared).cast::<()>() as usize;
        Self {
            addr,
            _pin: Box::new(Arc::downgrade(&shared)),
        }
    }

    pub(crate) const fn addr(&self) -> usize {
        self.addr
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({:#x})", self.addr)
    }
}

/// The command object behind a command member, as read by a getter.
///
/// Only lives for the duration of one read; bags keep its [`Identity`].
#[derive(Clone)]
pub(crate) enum CommandTarget {
    Action(Arc<dyn Command>),
    Parameterized(Arc<dyn ParameterizedCommand>),
}

impl CommandTarget {
    pub(crate) fn addr(&self) -> usize {
        match self {
            Self::Action(cmd) => Arc::as_ptr(cmd).cast::<()>() as usize,
            Self::Parameterized(cmd) => Arc::as_ptr(cmd).cast::<()>() as usize,
        }
    }

    /// The secondary boolean tracked next to the identity.
    pub(crate) fn signal(&self) -> bool {
        match self {
            Self::Action(cmd) => cmd.can_execute(),
            Self::Parameterized(cmd) => cmd.is_running(),
        }
    }

    pub(crate) fn into_identity(self) -> Identity {
        match self {
            Self::Action(cmd) => Identity::of(cmd),
            Self::Parameterized(cmd) => Identity::of(cmd),
        }
    }
}

impl fmt::Debug for CommandTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Action(_) => write!(f, "Action({:#x})", self.addr()),
            Self::Parameterized(_) => write!(f, "Parameterized({:#x})", self.addr()),
        }
    }
}

/// What a getter produced, before the bag derives its comparison state.
#[derive(Debug)]
pub(crate) enum RawReading {
    Value(Box<dyn DynValue>),
    Reference(Option<Identity>),
    Command(Option<CommandTarget>),
}

type Getter<T> = Arc<dyn Fn(&T) -> Result<RawReading, ReadError> + Send + Sync>;

/// Named getter for one observable member of `T`.
pub struct Accessor<T> {
    name: Arc<str>,
    owner: &'static str,
    kind: MemberKind,
    getter: Getter<T>,
}

impl<T> Clone for Accessor<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            owner: self.owner,
            kind: self.kind,
            getter: Arc::clone(&self.getter),
        }
    }
}

impl<T> fmt::Debug for Accessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<T: 'static> Accessor<T> {
    fn with_getter(name: impl Into<Arc<str>>, kind: MemberKind, getter: Getter<T>) -> Self {
        Self {
            name: name.into(),
            owner: std::any::type_name::<T>(),
            kind,
            getter,
        }
    }

    /// A property compared with `PartialEq`.
    pub fn value<V, F>(name: impl Into<Arc<str>>, get: F) -> Self
    where
        V: PartialEq + fmt::Debug + Send + Sync + 'static,
        F: Fn(&T) -> V + Send + Sync + 'static,
    {
        Self::try_value(name, move |entity| Ok(get(entity)))
    }

    /// A property compared with `PartialEq` whose getter may fail.
    pub fn try_value<V, F>(name: impl Into<Arc<str>>, get: F) -> Self
    where
        V: PartialEq + fmt::Debug + Send + Sync + 'static,
        F: Fn(&T) -> Result<V, ReadError> + Send + Sync + 'static,
    {
        let getter: Getter<T> = Arc::new(move |entity| {
            get(entity).map(|v| RawReading::Value(Box::new(v) as Box<dyn DynValue>))
        });
        Self::with_getter(name, MemberKind::Property, getter)
    }

    /// A property holding a shared object, compared by identity.
    pub fn reference<V, F>(name: impl Into<Arc<str>>, get: F) -> Self
    where
        V: ?Sized + Send + Sync + 'static,
        F: Fn(&T) -> Option<Arc<V>> + Send + Sync + 'static,
    {
        let getter: Getter<T> =
            Arc::new(move |entity| Ok(RawReading::Reference(get(entity).map(Identity::of))));
        Self::with_getter(name, MemberKind::Property, getter)
    }

    /// An action command member.
    pub fn command<F>(name: impl Into<Arc<str>>, get: F) -> Self
    where
        F: Fn(&T) -> Option<Arc<dyn Command>> + Send + Sync + 'static,
    {
        let getter: Getter<T> = Arc::new(move |entity| {
            Ok(RawReading::Command(get(entity).map(CommandTarget::Action)))
        });
        Self::with_getter(name, MemberKind::Command, getter)
    }

    /// A parameterized command member.
    pub fn parameterized_command<F>(name: impl Into<Arc<str>>, get: F) -> Self
    where
        F: Fn(&T) -> Option<Arc<dyn ParameterizedCommand>> + Send + Sync + 'static,
    {
        let getter: Getter<T> = Arc::new(move |entity| {
            Ok(RawReading::Command(get(entity).map(CommandTarget::Parameterized)))
        });
        Self::with_getter(name, MemberKind::ParameterizedCommand, getter)
    }

    /// Overrides the declaring type name reported with change notifications.
    #[must_use]
    pub fn declared_by(mut self, owner: &'static str) -> Self {
        self.owner = owner;
        self
    }
}

impl<T> Accessor<T> {
    /// Member name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Name of the type declaring the member.
    #[must_use]
    pub const fn owner(&self) -> &'static str {
        self.owner
    }

    /// Which bag variant tracks this member.
    #[must_use]
    pub const fn kind(&self) -> MemberKind {
        self.kind
    }

    /// Runs the getter, converting a panic into `ReadError::Panicked`.
    pub(crate) fn read(&self, entity: &T) -> Result<RawReading, ReadError> {
        match catch_unwind(AssertUnwindSafe(|| (self.getter)(entity))) {
            Ok(result) => result,
            Err(payload) => Err(ReadError::Panicked {
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

/// Concurrent, type-keyed, write-once-per-type cache of accessor lists.
#[derive(Default)]
pub struct AccessorCache {
    lists: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl fmt::Debug for AccessorCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessorCache")
            .field("types", &self.len())
            .finish()
    }
}

impl AccessorCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache.
    #[must_use]
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<AccessorCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Returns the cached list for `T`, if any.
    #[must_use]
    pub fn get<T: 'static>(&self) -> Option<Arc<[Accessor<T>]>> {
        let lists = self.lists.read().unwrap_or_else(PoisonError::into_inner);
        lists
            .get(&TypeId::of::<T>())
            .and_then(|stored| stored.downcast_ref::<Arc<[Accessor<T>]>>())
            .cloned()
    }

    /// Returns the list for `T`, running `build` on a miss.
    ///
    /// `build` runs outside the lock. When two callers race on the same type,
    /// both may build, but the first insert wins and both get that list.
    pub fn get_or_build<T, F>(&self, build: F) -> Arc<[Accessor<T>]>
    where
        T: 'static,
        F: FnOnce() -> Vec<Accessor<T>>,
    {
        if let Some(list) = self.get::<T>() {
            return list;
        }

        let built: Arc<[Accessor<T>]> = build().into();
        let mut lists = self.lists.write().unwrap_or_else(PoisonError::into_inner);
        let stored = lists
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(Arc::clone(&built)) as Arc<dyn Any + Send + Sync>);
        stored
            .downcast_ref::<Arc<[Accessor<T>]>>()
            .cloned()
            .unwrap_or(built)
    }

    /// Number of cached types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lists.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if no type has been cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
