//! initbus host event loop.
//!
//! - **[`host`]** -- The [`HostLoop`] trait a bridge registers watches,
//!   periodic timers and per-iteration functions with, plus [`IoEvents`].
//! - **[`main_loop`]** -- [`MainLoop`], a single-threaded reference loop
//!   driven by caller-supplied readiness and an injectable clock.
//! - **[`config`]** -- [`LoopConfig`] capacity limits.
//! - **[`error`]** -- [`LoopError`] via [`thiserror`].

pub mod config;
pub mod error;
pub mod host;
pub mod main_loop;

pub use config::LoopConfig;
pub use error::{LoopError, Result};
pub use host::{
    FuncCallback, FuncHandle, HostLoop, IoEvents, TimerCallback, TimerHandle, WatchCallback,
    WatchHandle, due_after,
};
pub use main_loop::{MainLoop, TimerInfo, WatchInfo};
