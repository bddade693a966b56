//! initbus event-loop bridge.
//!
//! This crate lets a message bus library run its I/O and timers on a host's
//! single-threaded event loop, and lets the host export objects on the bus
//! from static interface tables:
//!
//! - **[`connection`]** -- [`ConnectionManager`]: opening, sharing and
//!   serving bus connections, the per-iteration dispatch hook and the
//!   disconnect notification filter.
//! - **[`watch`]** / **[`timer`]** -- [`WatchBridge`] and [`TimerBridge`],
//!   mapping bus watches and timeouts onto host-loop watches and timers.
//! - **[`object`]** -- [`ExportedObject`] registration and release.
//! - **[`interface`]** -- Static method, signal and property tables.
//! - **[`dispatch`]** -- Routing method calls to marshallers.
//! - **[`introspect`]** -- Introspection XML generated from the tables.
//! - **[`path`]** -- Escaped object path construction.
//! - **[`error`]** -- [`BridgeError`] via [`thiserror`].
//!
//! Everything runs on the loop's thread; shared state is `Rc`-based.

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod interface;
pub mod introspect;
pub mod object;
pub mod path;
pub mod timer;
pub mod watch;

// Re-export the most commonly used types at the crate root for convenience.
pub use connection::{
    ConnectHandler, ConnectionManager, ConnectionToken, DisconnectHandler, wake_loop,
};
pub use dispatch::{MethodCall, dispatch, find_method};
pub use error::{BridgeError, ErrorKind, Result};
pub use interface::{Access, Arg, ArgDirection, Interface, Marshaller, Method, Property, Signal};
pub use introspect::{Introspection, generate, introspect};
pub use object::{ExportedObject, Object, ObjectEntry};
pub use path::{build_path, decode_path_component};
pub use timer::{TimerBridge, fire_timer, timer_period};
pub use watch::{WatchBridge, translate, watch_events, watch_flags};
