//! Reference single-threaded event loop.
//!
//! [`MainLoop`] keeps three tables (watches, timers, per-iteration
//! functions) and runs them from [`MainLoop::iterate`].  It does not poll
//! anything itself: the caller supplies the descriptors that became ready,
//! which keeps the loop usable over real sockets and in-process transports
//! alike.
//!
//! # Iteration order
//!
//! ```text
//! functions  -->  due timers (earliest first)  -->  ready watches
//! ```
//!
//! Callbacks may add or remove registrations, including their own.  A
//! registration removed or deactivated during an iteration is not called
//! later in that iteration.
//!
//! # Example
//!
//! ```rust
//! use initbus_mainloop::{HostLoop, IoEvents, MainLoop};
//!
//! let main_loop = MainLoop::new();
//! let on_ready = |events: IoEvents| assert!(events.contains(IoEvents::READ));
//! let handle = main_loop.add_watch(7, IoEvents::READ, Box::new(on_ready)).unwrap();
//! assert_eq!(main_loop.iterate(&[(7, IoEvents::READ)]), 1);
//! main_loop.remove_watch(handle).unwrap();
//! ```

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LoopConfig;
use crate::error::{LoopError, Result};
use crate::host::{
    FuncCallback, FuncHandle, HostLoop, IoEvents, TimerCallback, TimerHandle, WatchCallback,
    WatchHandle, due_after,
};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Snapshot of a watch registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchInfo {
    pub fd: RawFd,
    pub events: IoEvents,
    pub active: bool,
}

/// Snapshot of a timer registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub period_secs: u64,
    pub due: DateTime<Utc>,
    pub active: bool,
}

struct WatchEntry {
    fd: RawFd,
    events: IoEvents,
    active: bool,
    callback: Rc<RefCell<WatchCallback>>,
}

struct TimerEntry {
    period_secs: u64,
    due: DateTime<Utc>,
    active: bool,
    callback: Rc<RefCell<TimerCallback>>,
}

type Clock = Box<dyn Fn() -> DateTime<Utc>>;

// ---------------------------------------------------------------------------
// MainLoop
// ---------------------------------------------------------------------------

/// Single-threaded event loop.
///
/// The loop is cheaply cloneable (`Rc`-backed); clones share all tables.
#[derive(Clone)]
pub struct MainLoop {
    inner: Rc<LoopInner>,
}

struct LoopInner {
    config: LoopConfig,
    clock: Clock,
    next_handle: Cell<u64>,
    watches: RefCell<BTreeMap<u64, WatchEntry>>,
    timers: RefCell<BTreeMap<u64, TimerEntry>>,
    funcs: RefCell<BTreeMap<u64, Rc<RefCell<FuncCallback>>>>,
    interrupted: Cell<bool>,
}

impl MainLoop {
    /// Create a loop with default limits and the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LoopConfig::default())
    }

    #[must_use]
    pub fn with_config(config: LoopConfig) -> Self {
        Self::with_clock(config, Utc::now)
    }

    /// Create a loop reading the time from `clock`.
    #[must_use]
    pub fn with_clock(config: LoopConfig, clock: impl Fn() -> DateTime<Utc> + 'static) -> Self {
        Self {
            inner: Rc::new(LoopInner {
                config,
                clock: Box::new(clock),
                next_handle: Cell::new(1),
                watches: RefCell::new(BTreeMap::new()),
                timers: RefCell::new(BTreeMap::new()),
                funcs: RefCell::new(BTreeMap::new()),
                interrupted: Cell::new(false),
            }),
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.inner.config
    }

    /// Run one iteration, returning the number of callbacks invoked.
    ///
    /// `ready` lists descriptors with the conditions that hold on each; a
    /// watch fires when it is active and at least one of its events is set.
    pub fn iterate(&self, ready: &[(RawFd, IoEvents)]) -> usize {
        let mut calls = self.run_funcs();
        calls += self.run_timers();
        calls += self.run_watches(ready);
        tracing::trace!(calls, "loop iteration complete");
        calls
    }

    /// Report and clear a pending interrupt.
    pub fn take_interrupt(&self) -> bool {
        self.inner.interrupted.replace(false)
    }

    /// Due time of the earliest active timer.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.inner
            .timers
            .borrow()
            .values()
            .filter(|t| t.active)
            .map(|t| t.due)
            .min()
    }

    pub fn watch_info(&self, handle: WatchHandle) -> Option<WatchInfo> {
        self.inner.watches.borrow().get(&handle.0).map(|w| WatchInfo {
            fd: w.fd,
            events: w.events,
            active: w.active,
        })
    }

    pub fn timer_info(&self, handle: TimerHandle) -> Option<TimerInfo> {
        self.inner.timers.borrow().get(&handle.0).map(|t| TimerInfo {
            period_secs: t.period_secs,
            due: t.due,
            active: t.active,
        })
    }

    pub fn watch_count(&self) -> usize {
        self.inner.watches.borrow().len()
    }

    pub fn active_watch_count(&self) -> usize {
        self.inner.watches.borrow().values().filter(|w| w.active).count()
    }

    pub fn timer_count(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    pub fn func_count(&self) -> usize {
        self.inner.funcs.borrow().len()
    }

    // -- Internals -----------------------------------------------------------

    fn allocate_handle(&self) -> u64 {
        let id = self.inner.next_handle.get();
        self.inner.next_handle.set(id + 1);
        id
    }

    fn run_funcs(&self) -> usize {
        let funcs: Vec<(u64, Rc<RefCell<FuncCallback>>)> = self
            .inner
            .funcs
            .borrow()
            .iter()
            .map(|(id, cb)| (*id, Rc::clone(cb)))
            .collect();

        let mut calls = 0;
        for (id, callback) in funcs {
            if !self.inner.funcs.borrow().contains_key(&id) {
                continue;
            }
            // A callback already running further up the stack is skipped.
            if let Ok(mut callback) = callback.try_borrow_mut() {
                (*callback)();
                calls += 1;
            }
        }
        calls
    }

    fn run_timers(&self) -> usize {
        let now = (self.inner.clock)();
        let mut due: Vec<(DateTime<Utc>, u64)> = self
            .inner
            .timers
            .borrow()
            .iter()
            .filter(|(_, t)| t.active && t.due <= now)
            .map(|(id, t)| (t.due, *id))
            .collect();
        due.sort();

        let mut calls = 0;
        for (_, id) in due {
            let callback = {
                let mut timers = self.inner.timers.borrow_mut();
                let Some(timer) = timers.get_mut(&id) else {
                    continue;
                };
                if !timer.active || timer.due > now {
                    continue;
                }
                timer.due = due_after(now, timer.period_secs);
                Rc::clone(&timer.callback)
            };

            tracing::trace!(timer = id, "timer due");
            if let Ok(mut callback) = callback.try_borrow_mut() {
                (*callback)();
                calls += 1;
            }
        }
        calls
    }

    fn run_watches(&self, ready: &[(RawFd, IoEvents)]) -> usize {
        let mut calls = 0;
        for &(fd, events) in ready {
            let matching: Vec<u64> = self
                .inner
                .watches
                .borrow()
                .iter()
                .filter(|(_, w)| w.fd == fd)
                .map(|(id, _)| *id)
                .collect();

            for id in matching {
                let fired = {
                    let watches = self.inner.watches.borrow();
                    let Some(watch) = watches.get(&id) else {
                        continue;
                    };
                    let fired = watch.events & events;
                    if !watch.active || fired.is_empty() {
                        continue;
                    }
                    (fired, Rc::clone(&watch.callback))
                };

                let (fired, callback) = fired;
                tracing::trace!(watch = id, fd, ?fired, "watch ready");
                if let Ok(mut callback) = callback.try_borrow_mut() {
                    (*callback)(fired);
                    calls += 1;
                }
            }
        }
        calls
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl HostLoop for MainLoop {
    fn now(&self) -> DateTime<Utc> {
        (self.inner.clock)()
    }

    fn add_watch(
        &self,
        fd: RawFd,
        events: IoEvents,
        callback: WatchCallback,
    ) -> Result<WatchHandle> {
        let limit = self.inner.config.max_watches;
        if self.inner.watches.borrow().len() >= limit {
            tracing::warn!(fd, limit, "watch table full");
            return Err(LoopError::Exhausted {
                resource: "watch",
                limit,
            });
        }

        let id = self.allocate_handle();
        self.inner.watches.borrow_mut().insert(
            id,
            WatchEntry {
                fd,
                events,
                active: true,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        tracing::trace!(watch = id, fd, ?events, "watch added");
        Ok(WatchHandle(id))
    }

    fn set_watch_active(&self, handle: WatchHandle, active: bool) -> Result<()> {
        let mut watches = self.inner.watches.borrow_mut();
        let watch = watches.get_mut(&handle.0).ok_or(LoopError::UnknownHandle {
            kind: "watch",
            id: handle.0,
        })?;
        watch.active = active;
        Ok(())
    }

    fn remove_watch(&self, handle: WatchHandle) -> Result<()> {
        let removed = self.inner.watches.borrow_mut().remove(&handle.0);
        match removed {
            Some(_) => {
                tracing::trace!(watch = handle.0, "watch removed");
                Ok(())
            }
            None => Err(LoopError::UnknownHandle {
                kind: "watch",
                id: handle.0,
            }),
        }
    }

    fn add_timer(&self, period_secs: u64, callback: TimerCallback) -> Result<TimerHandle> {
        let limit = self.inner.config.max_timers;
        if self.inner.timers.borrow().len() >= limit {
            tracing::warn!(period_secs, limit, "timer table full");
            return Err(LoopError::Exhausted {
                resource: "timer",
                limit,
            });
        }

        let id = self.allocate_handle();
        let due = due_after(self.now(), period_secs);
        self.inner.timers.borrow_mut().insert(
            id,
            TimerEntry {
                period_secs,
                due,
                active: true,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        tracing::trace!(timer = id, period_secs, %due, "timer added");
        Ok(TimerHandle(id))
    }

    fn set_timer_active(&self, handle: TimerHandle, active: bool) -> Result<()> {
        let mut timers = self.inner.timers.borrow_mut();
        let timer = timers.get_mut(&handle.0).ok_or(LoopError::UnknownHandle {
            kind: "timer",
            id: handle.0,
        })?;
        timer.active = active;
        Ok(())
    }

    fn reschedule_timer(
        &self,
        handle: TimerHandle,
        period_secs: u64,
        due: DateTime<Utc>,
    ) -> Result<()> {
        let mut timers = self.inner.timers.borrow_mut();
        let timer = timers.get_mut(&handle.0).ok_or(LoopError::UnknownHandle {
            kind: "timer",
            id: handle.0,
        })?;
        timer.period_secs = period_secs;
        timer.due = due;
        Ok(())
    }

    fn remove_timer(&self, handle: TimerHandle) -> Result<()> {
        let removed = self.inner.timers.borrow_mut().remove(&handle.0);
        match removed {
            Some(_) => {
                tracing::trace!(timer = handle.0, "timer removed");
                Ok(())
            }
            None => Err(LoopError::UnknownHandle {
                kind: "timer",
                id: handle.0,
            }),
        }
    }

    fn add_func(&self, callback: FuncCallback) -> Result<FuncHandle> {
        let limit = self.inner.config.max_funcs;
        if self.inner.funcs.borrow().len() >= limit {
            tracing::warn!(limit, "function table full");
            return Err(LoopError::Exhausted {
                resource: "func",
                limit,
            });
        }

        let id = self.allocate_handle();
        self.inner
            .funcs
            .borrow_mut()
            .insert(id, Rc::new(RefCell::new(callback)));
        Ok(FuncHandle(id))
    }

    fn remove_func(&self, handle: FuncHandle) -> Result<()> {
        self.inner
            .funcs
            .borrow_mut()
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(LoopError::UnknownHandle {
                kind: "func",
                id: handle.0,
            })
    }

    fn interrupt(&self) {
        self.inner.interrupted.set(true);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
