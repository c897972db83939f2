//! Process-wide monitor scope.
//!
//! At most one [`Scope`] is active per process. It owns the background
//! monitor thread, the suspend gate and the [`Monitor`]. [`Scope::current`]
//! is a lock-free read of the active slot; entities use it from their
//! subscriber hooks to register themselves.

mod suspend;
mod worker;

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::ScopeConfig;
use crate::context::NotificationContext;
use crate::entity::Observable;
use crate::error::{panic_message, MonitorError, MonitorResult};
use crate::monitor::{self, Monitor, MonitorStats};

use self::suspend::Gate;

pub use suspend::SuspendToken;

/// Identifier of one scope instance, used in log spans.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(Uuid);

impl ScopeId {
    /// Create a new random scope id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn slot() -> &'static ArcSwapOption<ScopeInner> {
    static ACTIVE: OnceLock<ArcSwapOption<ScopeInner>> = OnceLock::new();
    ACTIVE.get_or_init(ArcSwapOption::empty)
}

struct ScopeInner {
    id: ScopeId,
    config: ScopeConfig,
    monitor: Monitor,
    context: Arc<dyn NotificationContext>,
    gate: Arc<Gate>,
    join: Mutex<Option<JoinHandle<MonitorResult<()>>>>,
    loop_thread: OnceLock<ThreadId>,
    outcome: OnceLock<MonitorResult<()>>,
}

impl ScopeInner {
    /// Clears the active slot if it still holds this scope.
    fn release(&self) -> bool {
        let mut released = false;
        slot().rcu(|current| match current {
            Some(active) if std::ptr::eq(Arc::as_ptr(active), self) => {
                released = true;
                None
            }
            other => {
                released = false;
                other.clone()
            }
        });
        if released {
            debug!(scope_id = %self.id, "monitor scope released");
        }
        released
    }

    fn is_loop_thread(&self) -> bool {
        self.loop_thread.get() == Some(&thread::current().id())
    }

    fn join_loop(&self) -> MonitorResult<()> {
        let handle = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else {
            return Ok(());
        };
        match handle.join() {
            Ok(Ok(()) | Err(MonitorError::Cancelled)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(payload) => Err(MonitorError::LoopPanicked {
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

/// Shared handle to a scope.
///
/// Handles stay usable after teardown; registrations are then simply never
/// processed.
#[derive(Clone)]
pub struct ScopeHandle {
    inner: Arc<ScopeInner>,
}

impl fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeHandle")
            .field("id", &self.inner.id)
            .field("registered", &self.registered_count())
            .field("suspend_depth", &self.suspend_depth())
            .field("cancelled", &self.inner.gate.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ScopeHandle {
    /// Identifier of this scope.
    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    /// Configuration the scope was created with.
    #[must_use]
    pub fn config(&self) -> &ScopeConfig {
        &self.inner.config
    }

    /// Starts monitoring `entity`. Returns false if it was already registered.
    pub fn register<T: Observable>(&self, entity: &Arc<T>) -> bool {
        self.inner.monitor.register(entity)
    }

    /// Stops monitoring `entity`. Returns false if it was not registered.
    pub fn unregister<T: ?Sized>(&self, entity: &Arc<T>) -> bool {
        self.inner.monitor.unregister(entity)
    }

    /// Returns true if `entity` is currently monitored.
    #[must_use]
    pub fn is_registered<T: ?Sized>(&self, entity: &Arc<T>) -> bool {
        self.inner.monitor.is_registered(entity)
    }

    /// Number of monitored entities.
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.inner.monitor.len()
    }

    /// Pauses the loop until the returned token is released.
    ///
    /// Never blocks. A cycle already in progress runs to completion.
    pub fn suspend(&self) -> MonitorResult<SuspendToken> {
        SuspendToken::acquire(&self.inner.gate)
    }

    /// Number of outstanding suspend tokens.
    #[must_use]
    pub fn suspend_depth(&self) -> u32 {
        self.inner.gate.depth()
    }

    /// Returns true while at least one suspend token is outstanding.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspend_depth() > 0
    }

    /// Returns true until cancellation was requested.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.gate.is_cancelled()
    }

    /// Diagnostic counters of the underlying monitor.
    #[must_use]
    pub fn stats(&self) -> &MonitorStats {
        self.inner.monitor.stats()
    }

    /// Stops the loop, waits for it and releases the active slot.
    ///
    /// Idempotent. Concurrent callers block until the first one finished and
    /// all observe the same result: `Ok` for a clean stop, otherwise the
    /// failure that terminated the loop. Called from the monitor thread, or
    /// from a handler the loop is blocked on, it cancels and releases without
    /// waiting.
    pub fn teardown(&self) -> MonitorResult<()> {
        let inner = &self.inner;
        inner.gate.cancel();
        if inner.is_loop_thread() || monitor::is_dispatching() {
            debug!(scope_id = %inner.id, "teardown requested from inside a cycle");
            inner.release();
            return Ok(());
        }
        let outcome = inner.outcome.get_or_init(|| inner.join_loop()).clone();
        inner.release();
        outcome
    }
}

/// Owner of the active scope.
///
/// Dereferences to [`ScopeHandle`]. Dropping it without
/// [`teardown`](ScopeHandle::teardown) cancels the loop and clears the
/// active slot but does not wait for the thread.
#[derive(Debug)]
pub struct Scope {
    handle: ScopeHandle,
}

impl Scope {
    /// Creates the process-wide scope with default configuration.
    pub fn create<C>(context: C) -> MonitorResult<Self>
    where
        C: NotificationContext + 'static,
    {
        Self::create_with_config(context, ScopeConfig::default())
    }

    /// Creates the process-wide scope.
    ///
    /// Fails with `AlreadyActive` if another scope is live.
    pub fn create_with_config<C>(context: C, config: ScopeConfig) -> MonitorResult<Self>
    where
        C: NotificationContext + 'static,
    {
        let inner = Arc::new(ScopeInner {
            id: ScopeId::new(),
            gate: Arc::new(Gate::new(config.max_suspend_depth)),
            monitor: Monitor::new(),
            context: Arc::new(context),
            config,
            join: Mutex::new(None),
            loop_thread: OnceLock::new(),
            outcome: OnceLock::new(),
        });

        let previous = slot().rcu(|current| current.clone().or_else(|| Some(Arc::clone(&inner))));
        if previous.is_some() {
            return Err(MonitorError::AlreadyActive);
        }

        let thread_inner = Arc::clone(&inner);
        let spawned = thread::Builder::new()
            .name(inner.config.thread_name.clone())
            .spawn(move || worker::run(&thread_inner));
        match spawned {
            Ok(handle) => {
                *inner.join.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(err) => {
                inner.release();
                return Err(MonitorError::Spawn {
                    message: err.to_string(),
                });
            }
        }

        debug!(
            scope_id = %inner.id,
            thread = %inner.config.thread_name,
            "monitor scope created"
        );
        Ok(Self {
            handle: ScopeHandle { inner },
        })
    }

    /// The active scope, if any.
    #[must_use]
    pub fn current() -> Option<ScopeHandle> {
        slot().load_full().map(|inner| ScopeHandle { inner })
    }

    /// A shareable handle to this scope.
    #[must_use]
    pub fn handle(&self) -> ScopeHandle {
        self.handle.clone()
    }
}

impl Deref for Scope {
    type Target = ScopeHandle;

    fn deref(&self) -> &ScopeHandle {
        &self.handle
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let inner = &self.handle.inner;
        inner.gate.cancel();
        if inner.outcome.get().is_none() {
            debug!(scope_id = %inner.id, "monitor scope dropped without teardown");
        }
        inner.release();
    }
}
