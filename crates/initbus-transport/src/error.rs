//! Transport error types.
//!
//! Two kinds of failure live here.  [`BusError`] is the `(name, message)`
//! pair the bus library reports when an operation such as opening a
//! connection fails; it mirrors the error structure carried on the wire so
//! that it can be bridged into other error models unchanged.  [`TransportError`]
//! covers local failures of this crate itself, currently configuration
//! loading.

use serde::{Deserialize, Serialize};

/// Error reported by the bus library: a well-known error name plus a
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct BusError {
    /// Dotted error name, e.g. `org.freedesktop.DBus.Error.NoServer`.
    pub name: String,
    /// Human-readable description.
    pub message: String,
}

impl BusError {
    /// Build a new error from its name and message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Local errors raised by this crate.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A configuration file could not be read.
    #[error("failed to read bus config `{path}`: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A configuration document could not be parsed.
    #[error("failed to parse bus config: {reason}")]
    ConfigParse { reason: String },
}

/// Convenience alias used throughout the transport crate.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names;

    #[test]
    fn bus_error_display_joins_name_and_message() {
        let err = BusError::new(names::ERROR_NO_SERVER, "nobody listening");
        assert_eq!(
            err.to_string(),
            "org.freedesktop.DBus.Error.NoServer: nobody listening"
        );
        let source: &dyn std::error::Error = &err;
        assert!(source.source().is_none());
    }
}
