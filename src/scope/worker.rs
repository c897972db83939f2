//! Background monitor loop.

use std::sync::Arc;
use std::thread;

use tracing::{debug, debug_span, error};

use crate::error::{MonitorError, MonitorResult};

use super::ScopeInner;

/// Thread entry point. Returns `Err(Cancelled)` on a clean stop.
pub(super) fn run(inner: &Arc<ScopeInner>) -> MonitorResult<()> {
    let _ = inner.loop_thread.set(thread::current().id());
    let span = debug_span!("monitor_loop", scope_id = %inner.id);
    let _enter = span.enter();

    debug!(
        tick_ms = u64::try_from(inner.config.tick_interval.as_millis()).unwrap_or(u64::MAX),
        "monitor loop started"
    );
    let result = monitor_loop(inner);
    match &result {
        Err(err) if err.is_fatal() => error!(error = %err, "monitor loop terminated"),
        Err(err) => debug!(reason = %err, "monitor loop stopped"),
        Ok(()) => debug!("monitor loop stopped"),
    }
    result
}

fn monitor_loop(inner: &ScopeInner) -> MonitorResult<()> {
    let tick = inner.config.tick_interval;
    let cancelled = || inner.gate.is_cancelled();
    loop {
        if !inner.gate.wait_tick(tick) {
            return Err(MonitorError::Cancelled);
        }
        if !inner.gate.wait_resumed() {
            return Err(MonitorError::Cancelled);
        }
        inner.monitor.run_cycle_until(inner.context.as_ref(), &cancelled)?;
    }
}
