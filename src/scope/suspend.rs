//! Suspension gate and suspend tokens.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::error::{MonitorError, MonitorResult};

#[derive(Debug, Default)]
struct GateState {
    depth: u32,
    cancelled: bool,
}

/// Cancellation flag and suspend counter behind one condition variable.
#[derive(Debug)]
pub(crate) struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
    max_depth: u32,
}

impl Gate {
    pub(crate) fn new(max_depth: u32) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            changed: Condvar::new(),
            max_depth,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cancel(&self) {
        let mut state = self.lock();
        if !state.cancelled {
            state.cancelled = true;
            self.changed.notify_all();
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub(crate) fn depth(&self) -> u32 {
        self.lock().depth
    }

    /// Waits up to `interval` for cancellation. Returns false once cancelled.
    pub(crate) fn wait_tick(&self, interval: Duration) -> bool {
        let state = self.lock();
        if state.cancelled {
            return false;
        }
        let (state, _) = self
            .changed
            .wait_timeout_while(state, interval, |s| !s.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        !state.cancelled
    }

    /// Blocks while suspended. Returns false once cancelled.
    pub(crate) fn wait_resumed(&self) -> bool {
        let state = self.lock();
        let state = self
            .changed
            .wait_while(state, |s| !s.cancelled && s.depth > 0)
            .unwrap_or_else(PoisonError::into_inner);
        !state.cancelled
    }

    /// Increments the suspend depth and returns the new value.
    pub(crate) fn enter(&self) -> MonitorResult<u32> {
        let mut state = self.lock();
        if state.depth >= self.max_depth {
            return Err(MonitorError::DepthExceeded { max: self.max_depth });
        }
        state.depth += 1;
        if state.depth == 1 {
            debug!("monitor suspended");
        }
        Ok(state.depth)
    }

    pub(crate) fn leave(&self) {
        let mut state = self.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            debug!("monitor resumed");
            self.changed.notify_all();
        }
    }
}

/// Keeps the monitor loop paused until released.
///
/// Every token must be released once for the loop to resume. Releasing twice
/// is a no-op, and a dropped token releases itself.
#[must_use = "the monitor resumes as soon as the token is dropped"]
#[derive(Debug)]
pub struct SuspendToken {
    gate: Arc<Gate>,
    released: AtomicBool,
}

impl SuspendToken {
    pub(crate) fn acquire(gate: &Arc<Gate>) -> MonitorResult<Self> {
        gate.enter()?;
        Ok(Self {
            gate: Arc::clone(gate),
            released: AtomicBool::new(false),
        })
    }

    /// Gives up this token's hold on the loop.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.gate.leave();
    }

    /// Returns true once [`release`](Self::release) ran.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for SuspendToken {
    fn drop(&mut self) {
        self.release();
    }
}
