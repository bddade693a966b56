//! Event-loop error types.

/// Errors raised by a host event loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoopError {
    /// A table of watches, timers or functions is full.
    #[error("event loop exhausted: {resource} limit of {limit} reached")]
    Exhausted {
        /// Which table filled up (`"watch"`, `"timer"` or `"func"`).
        resource: &'static str,
        limit: usize,
    },

    /// The handle does not name a live registration.
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },
}

/// Convenience alias used throughout the event-loop crate.
pub type Result<T> = std::result::Result<T, LoopError>;
