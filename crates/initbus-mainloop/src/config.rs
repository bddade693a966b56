//! Event-loop capacity limits.

use serde::{Deserialize, Serialize};

/// Capacity limits of a [`MainLoop`](crate::MainLoop).
///
/// Registrations beyond a limit fail with
/// [`LoopError::Exhausted`](crate::LoopError::Exhausted), which is how callers
/// observe resource exhaustion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Maximum number of file-descriptor watches.
    pub max_watches: usize,
    /// Maximum number of timers.
    pub max_timers: usize,
    /// Maximum number of per-iteration functions.
    pub max_funcs: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_watches: 1024,
            max_timers: 1024,
            max_funcs: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: LoopConfig = toml::from_str("max_funcs = 4").expect("valid toml");
        assert_eq!(cfg.max_funcs, 4);
        assert_eq!(cfg.max_watches, LoopConfig::default().max_watches);
        assert_eq!(cfg.max_timers, LoopConfig::default().max_timers);
    }
}
