//! The host event-loop surface.
//!
//! [`HostLoop`] is everything a library needs to hook itself into a
//! single-threaded cooperative loop: file-descriptor watches that fire on
//! readiness, periodic timers with whole-second granularity, functions run
//! once per iteration, and a way to cut the current wait short.

use std::fmt;
use std::os::fd::RawFd;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

bitflags::bitflags! {
    /// Readiness conditions on a file descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct IoEvents: u8 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXCEPT = 0x4;
    }
}

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

handle!(
    /// Registration of a file-descriptor watch.
    WatchHandle
);
handle!(
    /// Registration of a periodic timer.
    TimerHandle
);
handle!(
    /// Registration of a per-iteration function.
    FuncHandle
);

/// Called with the conditions that occurred on a watched descriptor.
pub type WatchCallback = Box<dyn FnMut(IoEvents)>;

/// Called each time a timer comes due.
pub type TimerCallback = Box<dyn FnMut()>;

/// Called once per loop iteration.
pub type FuncCallback = Box<dyn FnMut()>;

/// A single-threaded cooperative event loop.
///
/// All methods take `&self`; implementations use interior mutability and
/// must tolerate being called from inside their own callbacks.
pub trait HostLoop {
    /// Current wall-clock time as the loop sees it.
    fn now(&self) -> DateTime<Utc>;

    /// Watch `fd` for `events`.  New watches are active.
    fn add_watch(
        &self,
        fd: RawFd,
        events: IoEvents,
        callback: WatchCallback,
    ) -> Result<WatchHandle>;

    /// Include the watch in, or exclude it from, the set that is polled.
    fn set_watch_active(&self, handle: WatchHandle, active: bool) -> Result<()>;

    fn remove_watch(&self, handle: WatchHandle) -> Result<()>;

    /// Add a timer firing every `period_secs` seconds, first due one period
    /// from now.  New timers are active.
    fn add_timer(&self, period_secs: u64, callback: TimerCallback) -> Result<TimerHandle>;

    fn set_timer_active(&self, handle: TimerHandle, active: bool) -> Result<()>;

    /// Replace a timer's period and next due time.
    fn reschedule_timer(
        &self,
        handle: TimerHandle,
        period_secs: u64,
        due: DateTime<Utc>,
    ) -> Result<()>;

    fn remove_timer(&self, handle: TimerHandle) -> Result<()>;

    /// Run `callback` at the start of every iteration.
    fn add_func(&self, callback: FuncCallback) -> Result<FuncHandle>;

    fn remove_func(&self, handle: FuncHandle) -> Result<()>;

    /// Interrupt the current wait so the loop iterates again promptly.
    fn interrupt(&self);
}

/// `now` advanced by `period_secs`, saturating at the latest representable
/// time.
pub fn due_after(now: DateTime<Utc>, period_secs: u64) -> DateTime<Utc> {
    i64::try_from(period_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_mask() {
        let events = IoEvents::READ | IoEvents::EXCEPT;
        assert!(events.contains(IoEvents::READ));
        assert!(!events.contains(IoEvents::WRITE));
        assert_eq!(events & IoEvents::WRITE, IoEvents::empty());
        assert_eq!(events & IoEvents::READ, IoEvents::READ);
        assert_eq!(events.bits(), 0x5);
        assert_eq!(IoEvents::from_bits_truncate(0xff), IoEvents::all());
    }

    #[test]
    fn due_after_saturates() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp");
        assert_eq!(due_after(now, 5), now + TimeDelta::seconds(5));
        assert_eq!(due_after(now, u64::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
