//! Scope configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tick interval between monitor cycles.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(15);

/// Name given to the monitor thread.
pub const DEFAULT_THREAD_NAME: &str = "propwatch-monitor";

/// Configuration for a monitor [`Scope`](crate::scope::Scope).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Upper bound on the wait between two cycles.
    pub tick_interval: Duration,
    /// Maximum number of outstanding suspend tokens.
    pub max_suspend_depth: u32,
    /// Name of the dedicated monitor thread.
    pub thread_name: String,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_suspend_depth: u32::MAX,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl ScopeConfig {
    /// Sets the tick interval.
    #[must_use]
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Sets the maximum suspend depth.
    #[must_use]
    pub const fn with_max_suspend_depth(mut self, max_suspend_depth: u32) -> Self {
        self.max_suspend_depth = max_suspend_depth;
        self
    }

    /// Sets the monitor thread name.
    #[must_use]
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Parses a configuration document. Missing fields take their defaults.
    pub fn from_json_str(doc: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(doc)
    }
}
