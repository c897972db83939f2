//! Error types for propwatch.
//!
//! All errors are strongly typed using thiserror. Per-member failures
//! (`ReadError`) never leave the value bag that produced them; dispatch and
//! lifecycle failures (`DispatchError`, `MonitorError`) reach the caller.

use std::any::Any;

use thiserror::Error;

/// Failure reading one observable member.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("Member value unavailable: {reason}")]
    Unavailable {
        reason: String,
    },

    #[error("Member getter panicked: {message}")]
    Panicked {
        message: String,
    },
}

impl ReadError {
    /// Creates an `Unavailable` read error.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Failure reported by a notification context while running an action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Dispatch was cancelled")]
    Cancelled,

    #[error("Dispatched action panicked: {message}")]
    Panicked {
        message: String,
    },

    #[error("Dispatch rejected: {reason}")]
    Rejected {
        reason: String,
    },

    #[error("Dispatch abandoned before completion")]
    Abandoned,

    #[error("Dispatch timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },
}

/// Top-level error type for propwatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("A monitor scope is already active in this process")]
    AlreadyActive,

    #[error("Suspend depth exceeded (max: {max})")]
    DepthExceeded {
        max: u32,
    },

    #[error("Monitor loop was cancelled")]
    Cancelled,

    #[error("Notification context failed: {0}")]
    Dispatch(DispatchError),

    #[error("Notification context returned no handle from invoke_async")]
    MissingDispatchHandle,

    #[error("Monitor loop panicked: {message}")]
    LoopPanicked {
        message: String,
    },

    #[error("Failed to spawn monitor thread: {message}")]
    Spawn {
        message: String,
    },
}

impl MonitorError {
    /// Returns true if this error only reports cooperative cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if this error terminates the monitor loop.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Dispatch(_) | Self::MissingDispatchHandle | Self::LoopPanicked { .. }
        )
    }
}

impl From<DispatchError> for MonitorError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Cancelled => Self::Cancelled,
            other => Self::Dispatch(other),
        }
    }
}

/// Result type alias for propwatch operations.
pub type MonitorResult<T> = Result<T, MonitorError>;

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
