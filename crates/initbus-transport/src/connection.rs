//! Connection, server, watch and timeout primitives.
//!
//! These traits are the surface a bus library exposes to whoever drives its
//! I/O.  The library owns connections, servers, watches and timeouts; the
//! driver is told about watches and timeouts through [`WatchHooks`] and
//! [`TimeoutHooks`], feeds readiness back through [`Watch::handle`] and
//! [`Timeout::handle`], and pumps queued messages with
//! [`Connection::dispatch`].
//!
//! Everything here is single-threaded: objects are shared with [`Rc`] and
//! every callback runs on the thread that owns the connection.

use std::fmt;
use std::os::fd::RawFd;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BusError;
use crate::message::{DispatchStatus, HandlerResult, Message};

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

macro_rules! identity {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Allocate a fresh, time-ordered identity.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

identity!(
    /// Stable identity of a connection, usable as a map key.
    ConnectionId
);
identity!(
    /// Stable identity of a listening server.
    ServerId
);
identity!(
    /// Stable identity of a file-descriptor watch.
    WatchId
);
identity!(
    /// Stable identity of a timeout.
    TimeoutId
);

// ---------------------------------------------------------------------------
// Watch flags
// ---------------------------------------------------------------------------

bitflags::bitflags! {
    /// Readiness conditions a watch is interested in, or that occurred.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct WatchFlags: u8 {
        const READABLE = 0x1;
        const WRITABLE = 0x2;
        const ERROR = 0x4;
        const HANGUP = 0x8;
    }
}

/// Well-known message buses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// The per-login-session bus.
    Session,
    /// The system-wide bus.
    System,
    /// The bus that started this process through activation.
    Starter,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => f.write_str("session"),
            Self::System => f.write_str("system"),
            Self::Starter => f.write_str("starter"),
        }
    }
}

// ---------------------------------------------------------------------------
// Library-owned primitives
// ---------------------------------------------------------------------------

/// Interest in readiness of one file descriptor, owned by the bus library.
pub trait Watch {
    fn id(&self) -> WatchId;

    /// The file descriptor to poll.
    fn unix_fd(&self) -> RawFd;

    /// Conditions the library wants to hear about.
    fn flags(&self) -> WatchFlags;

    /// Whether the watch should currently be polled at all.
    fn is_enabled(&self) -> bool;

    /// Tell the library that `flags` occurred on the descriptor.
    ///
    /// Returns `false` if the library ran out of resources processing it.
    fn handle(&self, flags: WatchFlags) -> bool;
}

/// A timeout the bus library wants to be woken for, periodically.
pub trait Timeout {
    fn id(&self) -> TimeoutId;

    /// Requested interval in milliseconds.
    fn interval_ms(&self) -> u32;

    fn is_enabled(&self) -> bool;

    /// Tell the library the interval elapsed.
    fn handle(&self) -> bool;
}

pub type WatchRef = Rc<dyn Watch>;
pub type TimeoutRef = Rc<dyn Timeout>;

/// Receives watch lifecycle notifications from the bus library.
pub trait WatchHooks {
    /// A new watch exists.  Returning `false` reports resource exhaustion.
    fn add_watch(&self, watch: &WatchRef) -> bool;

    /// The watch is going away.
    fn remove_watch(&self, watch: &WatchRef);

    /// The watch's enabled state changed.
    fn watch_toggled(&self, watch: &WatchRef);
}

/// Receives timeout lifecycle notifications from the bus library.
pub trait TimeoutHooks {
    /// A new timeout exists.  Returning `false` reports resource exhaustion.
    fn add_timeout(&self, timeout: &TimeoutRef) -> bool;

    /// The timeout is going away.
    fn remove_timeout(&self, timeout: &TimeoutRef);

    /// The timeout was enabled, disabled, or had its interval changed.
    fn timeout_toggled(&self, timeout: &TimeoutRef);
}

/// Handler for everything below one registered object path.
pub trait ObjectPathHandler {
    /// The path was unregistered, either on request or because the
    /// connection went away.
    fn unregister(&self, connection: &ConnectionRef);

    /// A message arrived for the path.
    fn message(&self, connection: &ConnectionRef, message: &Message) -> HandlerResult;
}

/// A filter sees every inbound message before object dispatch, in
/// installation order, until one reports [`HandlerResult::Handled`].
pub type Filter = Box<dyn FnMut(&ConnectionRef, &Message) -> HandlerResult>;

/// Callback the library uses to wake whoever drives it.
pub type WakeupFn = Box<dyn Fn()>;

/// A bus connection.
pub trait Connection {
    fn id(&self) -> ConnectionId;

    fn is_connected(&self) -> bool;

    /// Whether losing the connection should terminate the process.
    fn set_exit_on_disconnect(&self, exit: bool);

    /// Install (or with `None`, remove) the watch hooks.  Existing watches
    /// are removed from the old hooks and added to the new ones; `false`
    /// means a watch could not be added and nothing was installed.
    fn set_watch_hooks(&self, hooks: Option<Rc<dyn WatchHooks>>) -> bool;

    /// Timeout counterpart of [`Connection::set_watch_hooks`].
    fn set_timeout_hooks(&self, hooks: Option<Rc<dyn TimeoutHooks>>) -> bool;

    /// Install the callback used when queued work needs servicing.
    fn set_wakeup_main(&self, wakeup: Option<WakeupFn>);

    /// Append a message filter.  `false` on resource exhaustion.
    fn add_filter(&self, filter: Filter) -> bool;

    /// Dispatch at most one queued inbound message.
    fn dispatch(&self) -> DispatchStatus;

    /// Route messages for exactly `path` to `handler`.
    fn register_object_path(
        &self,
        path: &str,
        handler: Rc<dyn ObjectPathHandler>,
    ) -> Result<(), BusError>;

    /// Remove the handler at `path`, invoking its unregister hook.
    fn unregister_object_path(&self, path: &str) -> bool;

    /// Direct children of `parent` in the registered object tree, or `None`
    /// on resource exhaustion.
    fn list_registered(&self, parent: &str) -> Option<Vec<String>>;

    /// Queue a message for sending, returning its serial.
    fn send(&self, message: Message) -> Option<u32>;

    /// Close the connection.
    fn close(&self);
}

pub type ConnectionRef = Rc<dyn Connection>;

/// Called by a server for every inbound connection.
pub type NewConnectionFn = Box<dyn Fn(&ServerRef, ConnectionRef)>;

/// A listening endpoint.
pub trait Server {
    fn id(&self) -> ServerId;

    fn address(&self) -> String;

    fn is_connected(&self) -> bool;

    fn set_watch_hooks(&self, hooks: Option<Rc<dyn WatchHooks>>) -> bool;

    fn set_timeout_hooks(&self, hooks: Option<Rc<dyn TimeoutHooks>>) -> bool;

    fn set_new_connection(&self, callback: Option<NewConnectionFn>);

    /// Stop listening.
    fn disconnect(&self);
}

pub type ServerRef = Rc<dyn Server>;

/// Entry points of a bus library.
pub trait Transport {
    /// Open a private connection to `address`.
    fn open(&self, address: &str) -> Result<ConnectionRef, BusError>;

    /// Obtain the shared connection to a well-known bus.
    fn bus(&self, kind: BusKind) -> Result<ConnectionRef, BusError>;

    /// Start listening at `address`.
    fn listen(&self, address: &str) -> Result<ServerRef, BusError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
