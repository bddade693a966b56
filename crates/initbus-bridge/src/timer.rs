//! Bus timeouts as periodic host-loop timers.
//!
//! The host loop counts in whole seconds, so a timeout's millisecond
//! interval is rounded up: anything up to one second becomes a one-second
//! period.  Bus libraries toggle a timeout to announce an interval change as
//! well as to enable or disable it, so every toggle recomputes the period
//! and restarts the countdown from now.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use initbus_mainloop::{HostLoop, TimerHandle, due_after};
use initbus_transport::{Timeout, TimeoutHooks, TimeoutId, TimeoutRef};

/// Whole-second period for a timeout of `interval_ms`, rounded up; an
/// interval of zero yields one second.
pub fn timer_period(interval_ms: u32) -> u64 {
    u64::from(interval_ms.saturating_sub(1)) / 1000 + 1
}

/// Tell the bus library its timeout elapsed.
pub fn fire_timer(timeout: &dyn Timeout) -> bool {
    tracing::trace!(timeout = %timeout.id(), "bus timeout fired");
    timeout.handle()
}

/// Timeout hooks for one connection or server.
pub struct TimerBridge {
    host: Rc<dyn HostLoop>,
    records: RefCell<HashMap<TimeoutId, TimerHandle>>,
}

impl TimerBridge {
    pub fn new(host: Rc<dyn HostLoop>) -> Self {
        Self {
            host,
            records: RefCell::new(HashMap::new()),
        }
    }

    /// Host-loop handle bound to the bus timeout `id`.
    pub fn handle(&self, id: TimeoutId) -> Option<TimerHandle> {
        self.records.borrow().get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }
}

impl TimeoutHooks for TimerBridge {
    fn add_timeout(&self, timeout: &TimeoutRef) -> bool {
        let period = timer_period(timeout.interval_ms());
        let target = Rc::downgrade(timeout);

        let added = self.host.add_timer(
            period,
            Box::new(move || {
                if let Some(timeout) = target.upgrade() {
                    fire_timer(&*timeout);
                }
            }),
        );
        let handle = match added {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(timeout = %timeout.id(), error = %e, "failed to add bus timeout");
                return false;
            }
        };

        if !timeout.is_enabled() {
            if let Err(e) = self.host.set_timer_active(handle, false) {
                tracing::warn!(timeout = %timeout.id(), error = %e, "failed to park disabled bus timeout");
                if let Err(e) = self.host.remove_timer(handle) {
                    tracing::warn!(timeout = %timeout.id(), error = %e, "failed to drop parked bus timeout");
                }
                return false;
            }
        }

        self.records.borrow_mut().insert(timeout.id(), handle);
        tracing::debug!(
            timeout = %timeout.id(),
            period_secs = period,
            enabled = timeout.is_enabled(),
            "bus timeout added"
        );
        true
    }

    fn remove_timeout(&self, timeout: &TimeoutRef) {
        let removed = self.records.borrow_mut().remove(&timeout.id());
        let Some(handle) = removed else {
            return;
        };
        if let Err(e) = self.host.remove_timer(handle) {
            tracing::warn!(timeout = %timeout.id(), error = %e, "failed to remove bus timeout");
        }
        tracing::debug!(timeout = %timeout.id(), "bus timeout removed");
    }

    fn timeout_toggled(&self, timeout: &TimeoutRef) {
        let Some(handle) = self.handle(timeout.id()) else {
            return;
        };

        let enabled = timeout.is_enabled();
        let period = timer_period(timeout.interval_ms());
        let due = due_after(self.host.now(), period);

        let synced = self
            .host
            .set_timer_active(handle, enabled)
            .and_then(|()| self.host.reschedule_timer(handle, period, due));
        if let Err(e) = synced {
            tracing::warn!(timeout = %timeout.id(), error = %e, "failed to toggle bus timeout");
            return;
        }
        tracing::trace!(timeout = %timeout.id(), enabled, period_secs = period, %due, "bus timeout toggled");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
