//! Runtime configuration.
//!
//! Configuration is plain data with serde defaults so that a host can keep
//! a `[runtime]` style section in its own TOML file and hand the parsed
//! value to [`Runtime::with_config`](crate::Runtime::with_config).

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default name of the global table that exposes host registrations.
pub const DEFAULT_NAMESPACE: &str = "host";

/// Settings applied when a [`Runtime`](crate::Runtime) is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Load the safe standard libraries (string, table, math, ...) at open.
    /// The base library is always present.
    pub open_std_libs: bool,

    /// Global table that host-registered functions and types are published
    /// into. Empty publishes straight into the global table.
    pub namespace: String,

    /// Maximum number of frames captured in a fault traceback
    pub traceback_depth: usize,

    /// Optional cap on engine allocations, in bytes
    pub memory_limit: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            open_std_libs: true,
            namespace: DEFAULT_NAMESPACE.to_string(),
            traceback_depth: 16,
            memory_limit: None,
        }
    }
}

impl RuntimeConfig {
    /// Parse a config from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Reject values the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !self.namespace.is_empty() && !is_identifier(&self.namespace) {
            return Err(BridgeError::Config(format!(
                "namespace '{}' is not a valid identifier",
                self.namespace
            )));
        }
        if self.memory_limit == Some(0) {
            return Err(BridgeError::Config(
                "memory_limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
