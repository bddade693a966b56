//! initbus transport boundary.
//!
//! This crate defines what the event-loop bridge needs from a message bus
//! library, and nothing about how bytes move:
//!
//! - **[`message`]** -- Bus message model: types, header fields, typed body
//!   values, handler and dispatch results.
//! - **[`connection`]** -- Connection, server, watch and timeout traits plus
//!   the hook traits a driver implements to service them.
//! - **[`config`]** -- Well-known bus addresses from TOML and environment.
//! - **[`memory`]** -- An in-process bus implementing every trait, with
//!   synthetic descriptors and injectable resource-exhaustion faults.
//! - **[`names`]** -- Protocol-level interface, path and error names.
//! - **[`error`]** -- [`BusError`] and local error types via [`thiserror`].
//!
//! Everything is single-threaded and `Rc`-based.

pub mod config;
pub mod connection;
pub mod error;
pub mod memory;
pub mod message;
pub mod names;

pub use config::BusConfig;
pub use connection::{
    BusKind, Connection, ConnectionId, ConnectionRef, Filter, NewConnectionFn, ObjectPathHandler,
    Server, ServerId, ServerRef, Timeout, TimeoutHooks, TimeoutId, TimeoutRef, Transport,
    WakeupFn, Watch, WatchFlags, WatchHooks, WatchId, WatchRef,
};
pub use error::{BusError, Result, TransportError};
pub use message::{DispatchStatus, HandlerResult, Message, MessageType, Value};
