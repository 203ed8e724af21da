//! Protocol configuration.
//!
//! # Examples
//!
//! ```
//! use forkline::config::ProtocolConfig;
//!
//! let config = ProtocolConfig::from_toml_str("default_branch = \"trunk\"").unwrap();
//! assert_eq!(config.default_branch, "trunk");
//! assert!(config.watch.sync);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::overlay::OverlayMode;

/// Top-level configuration shared by adapters built on this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Branch a fresh system starts on. Default: "main".
    pub default_branch: String,
    /// Author recorded on snapshots. Default: "system".
    pub author: String,
    pub overlay: OverlayConfig,
    pub watch: WatchConfig,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
            author: "system".to_string(),
            overlay: OverlayConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

/// Overlay defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Mode used when a caller does not pick one. Default: gated.
    pub default_mode: OverlayMode,
}

/// Watch defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Deliver callbacks on the mutating thread. Default: true.
    pub sync: bool,
    /// Poll period for engines without push notification. Default: 1000.
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            sync: true,
            poll_interval_ms: 1000,
        }
    }
}

impl ProtocolConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }
}
