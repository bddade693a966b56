//! Bus watches as host-loop watches.
//!
//! A [`WatchBridge`] is installed as the [`WatchHooks`] of one connection or
//! server.  Each bus watch gets one host-loop watch, created when the bus
//! library announces it and destroyed only when the library removes it;
//! enable/disable toggles just move the host watch in and out of the active
//! set.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use initbus_mainloop::{HostLoop, IoEvents, WatchHandle};
use initbus_transport::{Watch, WatchFlags, WatchHooks, WatchId, WatchRef};

/// Host-loop events to poll for a bus watch with `flags`.  Exceptional
/// conditions are always of interest.
pub fn watch_events(flags: WatchFlags) -> IoEvents {
    let mut events = IoEvents::EXCEPT;
    if flags.contains(WatchFlags::READABLE) {
        events |= IoEvents::READ;
    }
    if flags.contains(WatchFlags::WRITABLE) {
        events |= IoEvents::WRITE;
    }
    events
}

/// Bus watch flags for host-loop readiness `events`.
pub fn watch_flags(events: IoEvents) -> WatchFlags {
    let mut flags = WatchFlags::empty();
    if events.contains(IoEvents::READ) {
        flags |= WatchFlags::READABLE;
    }
    if events.contains(IoEvents::WRITE) {
        flags |= WatchFlags::WRITABLE;
    }
    if events.contains(IoEvents::EXCEPT) {
        flags |= WatchFlags::ERROR;
    }
    flags
}

/// Hand host-loop readiness back to the bus library.
pub fn translate(watch: &dyn Watch, events: IoEvents) -> bool {
    let flags = watch_flags(events);
    tracing::trace!(watch = %watch.id(), fd = watch.unix_fd(), ?flags, "bus watch ready");
    watch.handle(flags)
}

/// Watch hooks for one connection or server.
pub struct WatchBridge {
    host: Rc<dyn HostLoop>,
    records: RefCell<HashMap<WatchId, WatchHandle>>,
}

impl WatchBridge {
    pub fn new(host: Rc<dyn HostLoop>) -> Self {
        Self {
            host,
            records: RefCell::new(HashMap::new()),
        }
    }

    /// Host-loop handle bound to the bus watch `id`.
    pub fn handle(&self, id: WatchId) -> Option<WatchHandle> {
        self.records.borrow().get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }
}

impl WatchHooks for WatchBridge {
    fn add_watch(&self, watch: &WatchRef) -> bool {
        let fd = watch.unix_fd();
        let events = watch_events(watch.flags());
        let target = Rc::downgrade(watch);

        let added = self.host.add_watch(
            fd,
            events,
            Box::new(move |ready: IoEvents| {
                if let Some(watch) = target.upgrade() {
                    translate(&*watch, ready);
                }
            }),
        );
        let handle = match added {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(watch = %watch.id(), fd, error = %e, "failed to add bus watch");
                return false;
            }
        };

        if !watch.is_enabled() {
            if let Err(e) = self.host.set_watch_active(handle, false) {
                tracing::warn!(watch = %watch.id(), error = %e, "failed to park disabled bus watch");
                if let Err(e) = self.host.remove_watch(handle) {
                    tracing::warn!(watch = %watch.id(), error = %e, "failed to drop parked bus watch");
                }
                return false;
            }
        }

        self.records.borrow_mut().insert(watch.id(), handle);
        tracing::debug!(
            watch = %watch.id(),
            fd,
            ?events,
            enabled = watch.is_enabled(),
            "bus watch added"
        );
        true
    }

    fn remove_watch(&self, watch: &WatchRef) {
        let removed = self.records.borrow_mut().remove(&watch.id());
        let Some(handle) = removed else {
            return;
        };
        if let Err(e) = self.host.remove_watch(handle) {
            tracing::warn!(watch = %watch.id(), error = %e, "failed to remove bus watch");
        }
        tracing::debug!(watch = %watch.id(), "bus watch removed");
    }

    fn watch_toggled(&self, watch: &WatchRef) {
        let Some(handle) = self.handle(watch.id()) else {
            return;
        };
        let enabled = watch.is_enabled();
        if let Err(e) = self.host.set_watch_active(handle, enabled) {
            tracing::warn!(watch = %watch.id(), error = %e, "failed to toggle bus watch");
        }
        tracing::trace!(watch = %watch.id(), enabled, "bus watch toggled");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
