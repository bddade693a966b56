//! Bridge error types.
//!
//! Every failure the bridge reports surfaces as a [`BridgeError`].  Errors
//! the bus library reports arrive as a `(name, message)` pair and keep both
//! parts, so they can be answered on the bus unchanged; resource exhaustion
//! anywhere in the bridge collapses into [`BridgeError::NoMemory`].
//!
//! [`BridgeError::raise`] and the [`bus_error!`](crate::bus_error) macro build
//! bus-kind errors directly, for supervisors that want to answer a method
//! call with a specific error name.

use initbus_transport::{BusError, TransportError, names};
use serde::{Deserialize, Serialize};

/// Coarse classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Reported by, or destined for, the message bus.
    Bus,
    /// A resource ran out.
    NoMemory,
    /// Bus configuration could not be loaded.
    Config,
}

/// Unified error type for the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A named bus error.
    #[error("{name}: {message}")]
    Bus {
        /// Dotted error name, e.g. `org.freedesktop.DBus.Error.NoServer`.
        name: String,
        /// Human-readable description.
        message: String,
    },

    /// Resource exhaustion while building bridge state.
    #[error("not enough memory")]
    NoMemory,

    /// Bus addresses could not be loaded.
    #[error("bus configuration error: {0}")]
    Config(#[from] TransportError),
}

impl BridgeError {
    /// Build a bus-kind error from a name and message.
    pub fn raise(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bus {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Bus { .. } => ErrorKind::Bus,
            Self::NoMemory => ErrorKind::NoMemory,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// The bus error name this error is reported under.
    pub fn name(&self) -> &str {
        match self {
            Self::Bus { name, .. } => name,
            Self::NoMemory => names::ERROR_NO_MEMORY,
            Self::Config(_) => names::ERROR_FAILED,
        }
    }

    /// The human-readable message this error is reported with.
    pub fn message(&self) -> String {
        match self {
            Self::Bus { message, .. } => message.clone(),
            Self::NoMemory => "Not enough memory".to_string(),
            Self::Config(err) => err.to_string(),
        }
    }
}

impl From<BusError> for BridgeError {
    fn from(err: BusError) -> Self {
        if err.name == names::ERROR_NO_MEMORY {
            Self::NoMemory
        } else {
            Self::Bus {
                name: err.name,
                message: err.message,
            }
        }
    }
}

/// Build a bus-kind [`BridgeError`] with a formatted message.
///
/// ```rust
/// use initbus_bridge::{bus_error, ErrorKind};
///
/// let err = bus_error!("com.example.Error.UnknownJob", "Unknown job: {}", "ssh");
/// assert_eq!(err.kind(), ErrorKind::Bus);
/// assert_eq!(err.message(), "Unknown job: ssh");
/// ```
#[macro_export]
macro_rules! bus_error {
    ($name:expr, $($arg:tt)+) => {
        $crate::error::BridgeError::raise($name, ::std::format!($($arg)+))
    };
}

/// Convenience alias used throughout the bridge crate.
pub type Result<T> = std::result::Result<T, BridgeError>;
