//! Notification contexts.
//!
//! A [`NotificationContext`] runs closures on the execution context that owns
//! thread-affine entities (typically a UI thread). The monitor uses
//! `invoke_async` for the read side of a cycle and `invoke` for delivery.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{panic_message, DispatchError};

/// A closure dispatched to a notification context.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Runs actions on a target execution context.
pub trait NotificationContext: Send + Sync {
    /// Runs `action` on the target context and waits for it.
    ///
    /// A panic inside `action` must be reported as an error, not swallowed.
    fn invoke(&self, action: Action) -> Result<(), DispatchError>;

    /// Schedules `action` on the target context.
    ///
    /// Must always return a handle. `None` is a contract violation and stops
    /// the monitor loop.
    fn invoke_async(&self, action: Action) -> Option<DispatchHandle>;
}

impl<C: NotificationContext + ?Sized> NotificationContext for std::sync::Arc<C> {
    fn invoke(&self, action: Action) -> Result<(), DispatchError> {
        (**self).invoke(action)
    }

    fn invoke_async(&self, action: Action) -> Option<DispatchHandle> {
        (**self).invoke_async(action)
    }
}

/// Awaitable completion of a dispatched action.
#[derive(Debug)]
pub struct DispatchHandle {
    rx: Receiver<Result<(), DispatchError>>,
}

/// Completes the paired [`DispatchHandle`].
///
/// Dropping it without completing makes the handle report `Abandoned`.
#[derive(Debug)]
pub struct DispatchCompleter {
    tx: Sender<Result<(), DispatchError>>,
}

impl DispatchCompleter {
    /// Publishes the outcome.
    pub fn complete(self, result: Result<(), DispatchError>) {
        // The waiter may have given up already.
        let _ = self.tx.send(result);
    }
}

impl DispatchHandle {
    /// Creates a handle and the completer that resolves it.
    #[must_use]
    pub fn pending() -> (DispatchCompleter, Self) {
        let (tx, rx) = bounded(1);
        (DispatchCompleter { tx }, Self { rx })
    }

    /// Creates an already-resolved handle.
    #[must_use]
    pub fn ready(result: Result<(), DispatchError>) -> Self {
        let (done, handle) = Self::pending();
        done.complete(result);
        handle
    }

    /// Blocks until the action finished.
    pub fn wait(self) -> Result<(), DispatchError> {
        self.rx.recv().map_err(|_| DispatchError::Abandoned)?
    }

    /// Blocks until the action finished or `timeout` elapsed.
    pub fn wait_timeout(self, timeout: Duration) -> Result<(), DispatchError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => DispatchError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            },
            RecvTimeoutError::Disconnected => DispatchError::Abandoned,
        })?
    }
}

/// Runs `action`, turning a panic into `DispatchError::Panicked`.
pub(crate) fn run_guarded(action: Action) -> Result<(), DispatchError> {
    catch_unwind(AssertUnwindSafe(action)).map_err(|payload| DispatchError::Panicked {
        message: panic_message(payload.as_ref()),
    })
}

/// Runs every action immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineContext;

impl NotificationContext for InlineContext {
    fn invoke(&self, action: Action) -> Result<(), DispatchError> {
        run_guarded(action)
    }

    fn invoke_async(&self, action: Action) -> Option<DispatchHandle> {
        Some(DispatchHandle::ready(run_guarded(action)))
    }
}

struct Job {
    action: Action,
    done: DispatchCompleter,
}

/// A dedicated "home" thread draining a bounded job queue.
///
/// Stands in for a UI thread: thread-affine entities owned by this context
/// are read and notified on it. Dropping the context closes the queue; queued
/// jobs still run before the thread exits.
pub struct HomeThreadContext {
    tx: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
    home: ThreadId,
}

impl std::fmt::Debug for HomeThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HomeThreadContext")
            .field("home", &self.home)
            .finish_non_exhaustive()
    }
}

impl HomeThreadContext {
    /// Default queue capacity.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Spawns a home thread named `name`.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        Self::with_capacity(name, Self::DEFAULT_CAPACITY)
    }

    /// Spawns a home thread with a queue of `capacity` jobs.
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<Job>(capacity.max(1));
        let thread = thread::Builder::new().name(name.into()).spawn(move || {
            while let Ok(Job { action, done }) = rx.recv() {
                done.complete(run_guarded(action));
            }
        })?;
        let home = thread.thread().id();

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
            home,
        })
    }

    /// Id of the home thread.
    #[must_use]
    pub const fn thread_id(&self) -> ThreadId {
        self.home
    }

    /// Returns true when called from the home thread.
    #[must_use]
    pub fn is_home_thread(&self) -> bool {
        thread::current().id() == self.home
    }

    /// Runs `f` on the home thread and returns its result.
    pub fn run<R, F>(&self, f: F) -> Result<R, DispatchError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = bounded::<R>(1);
        self.invoke(Box::new(move || {
            let _ = tx.send(f());
        }))?;
        rx.recv().map_err(|_| DispatchError::Abandoned)
    }

    fn submit(&self, action: Action) -> Result<DispatchHandle, DispatchError> {
        let tx = self.tx.as_ref().ok_or_else(|| DispatchError::Rejected {
            reason: "home thread stopped".to_string(),
        })?;
        let (done, handle) = DispatchHandle::pending();
        tx.send(Job { action, done })
            .map_err(|_| DispatchError::Rejected {
                reason: "home thread stopped".to_string(),
            })?;
        Ok(handle)
    }
}

impl NotificationContext for HomeThreadContext {
    fn invoke(&self, action: Action) -> Result<(), DispatchError> {
        // Waiting on our own queue would never finish.
        if self.is_home_thread() {
            return run_guarded(action);
        }
        self.submit(action)?.wait()
    }

    fn invoke_async(&self, action: Action) -> Option<DispatchHandle> {
        Some(self.submit(action).unwrap_or_else(|err| DispatchHandle::ready(Err(err))))
    }
}

impl Drop for HomeThreadContext {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.thread.take() {
            if !self.is_home_thread() {
                let _ = handle.join();
            }
        }
    }
}
