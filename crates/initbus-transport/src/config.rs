//! Bus address configuration.
//!
//! [`BusConfig`] resolves the well-known buses to concrete addresses.  It can
//! be read from a TOML file, from the standard environment variables, or
//! both (environment wins), and falls back to the conventional system bus
//! socket when nothing else is configured.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::connection::BusKind;
use crate::error::{Result, TransportError};

/// Address of the system bus when nothing overrides it.
pub const DEFAULT_SYSTEM_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

pub const ENV_SESSION_ADDRESS: &str = "DBUS_SESSION_BUS_ADDRESS";
pub const ENV_SYSTEM_ADDRESS: &str = "DBUS_SYSTEM_BUS_ADDRESS";
pub const ENV_STARTER_ADDRESS: &str = "DBUS_STARTER_ADDRESS";

/// Addresses of the well-known buses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Session bus address; there is no default session bus.
    #[serde(default)]
    pub session_address: Option<String>,

    /// System bus address.
    #[serde(default = "BusConfig::default_system_address")]
    pub system_address: String,

    /// Address of the bus that activated this process, if any.
    #[serde(default)]
    pub starter_address: Option<String>,

    /// Whether shared bus connections terminate the process when lost.
    ///
    /// Default: **true**, matching the usual bus library behaviour.  Hosts
    /// that manage disconnection themselves turn it off per connection.
    #[serde(default = "BusConfig::default_exit_on_disconnect")]
    pub exit_on_disconnect: bool,
}

impl BusConfig {
    fn default_system_address() -> String {
        DEFAULT_SYSTEM_ADDRESS.to_string()
    }

    const fn default_exit_on_disconnect() -> bool {
        true
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TransportError::ConfigParse {
            reason: e.to_string(),
        })
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| {
            TransportError::ConfigRead {
                path: path.display().to_string(),
                source,
            }
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "bus config loaded");
        Ok(config)
    }

    /// Defaults overlaid with the standard environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overlay the standard environment variables onto this configuration.
    #[must_use]
    pub fn with_env(mut self) -> Self {
        if let Some(address) = env_non_empty(ENV_SESSION_ADDRESS) {
            self.session_address = Some(address);
        }
        if let Some(address) = env_non_empty(ENV_SYSTEM_ADDRESS) {
            self.system_address = address;
        }
        if let Some(address) = env_non_empty(ENV_STARTER_ADDRESS) {
            self.starter_address = Some(address);
        }
        self
    }

    /// The configured address of `kind`, if any.
    pub fn address(&self, kind: BusKind) -> Option<&str> {
        match kind {
            BusKind::Session => self.session_address.as_deref(),
            BusKind::System => Some(&self.system_address),
            BusKind::Starter => self.starter_address.as_deref(),
        }
    }

    /// Set the address of `kind`.
    #[must_use]
    pub fn with_address(mut self, kind: BusKind, address: impl Into<String>) -> Self {
        let address = address.into();
        match kind {
            BusKind::Session => self.session_address = Some(address),
            BusKind::System => self.system_address = address,
            BusKind::Starter => self.starter_address = Some(address),
        }
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            session_address: None,
            system_address: Self::default_system_address(),
            starter_address: None,
            exit_on_disconnect: Self::default_exit_on_disconnect(),
        }
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
