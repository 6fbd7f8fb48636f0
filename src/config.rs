//! Configuration for tcpcom.
//!
//! User config location: $XDG_CONFIG_HOME/tcpcom/tcpcom.toml
//! Fallback: the platform config directory (`~/.config` on Linux)
//!
//! Every field is optional; missing fields take their defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TransportError};
use crate::listener::DEFAULT_BIND_ADDRESS;

const CONFIG_DIR_NAME: &str = "tcpcom";
const CONFIG_FILE_NAME: &str = "tcpcom.toml";

/// Transport settings shared by the CLI and embedding applications.
///
/// Durations are in milliseconds. A zero read timeout waits indefinitely
/// and a zero heartbeat interval disables heartbeats.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Address listening sockets bind to
    pub bind_address: SocketAddr,
    pub connect_timeout_ms: u64,
    /// Size of the buffer handed to `on_receive`
    pub read_buffer_size: usize,
    pub read_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_payload: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS,
            connect_timeout_ms: 2000,
            read_buffer_size: 4096,
            read_timeout_ms: 0,
            heartbeat_interval_ms: 0,
            heartbeat_payload: "heartbeat".to_string(),
        }
    }
}

impl TransportConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).map_err(|e| TransportError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate the config file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TransportError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            TransportError::Config { message } => {
                TransportError::config(format!("{}: {}", path.display(), message))
            }
            other => other,
        })
    }

    /// Load the user config if it exists.
    ///
    /// Returns `Ok(None)` when there is no user config file.
    pub fn load_user() -> Result<Option<Self>> {
        match user_config_path() {
            Some(path) if path.exists() => {
                log::debug!(target: "tcpcom::config", "Loading user config from {}", path.display());
                Self::load(&path).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Reject settings no channel could run with.
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(TransportError::config("read_buffer_size must be positive"));
        }
        if self.heartbeat_interval_ms > 0 && self.heartbeat_payload.is_empty() {
            return Err(TransportError::config(
                "heartbeat_payload must not be empty when heartbeats are enabled",
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `None` when reads wait indefinitely.
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    /// `None` when heartbeats are disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }
}

/// Returns the path to the user configuration file.
///
/// The path is determined by:
/// 1. If $XDG_CONFIG_HOME is set: $XDG_CONFIG_HOME/tcpcom/tcpcom.toml
/// 2. Otherwise: the platform config directory joined with tcpcom/tcpcom.toml
///
/// Returns None if neither location can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(xdg_config) if !xdg_config.is_empty() => PathBuf::from(xdg_config),
        _ => dirs::config_dir()?,
    };
    Some(base.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}
