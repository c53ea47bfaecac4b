//! Configuration module for pipehub
//!
//! A hub process reads one [`HubConfig`] at startup. The file is either TOML
//! (`.toml`) or JSON (any other extension); every field has a default, so a
//! partial file is valid.
//!
//! # Config Location
//!
//! Without an explicit path the config is looked up in the platform config
//! directory:
//! - **Linux**: `~/.config/pipehub/hub.toml`
//! - **macOS**: `~/Library/Application Support/pipehub/hub.toml`
//! - **Windows**: `%APPDATA%\pipehub\hub.toml`
//!
//! # Example
//!
//! ```toml
//! [hub]
//! role = "slave"
//! name = "render-node"
//! master_address = "10.0.0.1:31093"
//!
//! [transport]
//! send_timeout_ms = 5000
//!
//! [logging]
//! filter = "info,pipehub=trace"
//! directory = "/var/log/pipehub"
//! ```

use crate::error::{PipehubError, Result};
use crate::id::{Id, Identity};
use crate::message::frame::MAX_PAYLOAD_SIZE;
use crate::transport::local::QueueSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::message::MESSAGE_SIZE;

/// Directory name below the platform config directory
pub const APP_DIR: &str = "pipehub";

/// Default config filename
pub const CONFIG_FILE: &str = "hub.toml";

/// Default control port of a hub
pub const DEFAULT_HUB_PORT: u16 = 31093;

/// Default bulk data port of a hub
pub const DEFAULT_DATA_PORT: u16 = 31094;

/// Default limit for a blocking queue send in milliseconds
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 1000;

/// Default number of messages a local queue holds
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default receive wait slice in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Default tracing filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,pipehub=debug";

/// Path of the default config file, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_DIR).join(CONFIG_FILE))
}

// ==================== Sections ====================

/// Whether this hub coordinates the session or joins one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubRole {
    #[default]
    Master,
    Slave,
}

impl HubRole {
    pub fn identity(self) -> Identity {
        match self {
            HubRole::Master => Identity::Hub,
            HubRole::Slave => Identity::SlaveHub,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub role: HubRole,
    pub name: String,
    /// Address to accept UI, manager and hub connections on
    pub listen_address: String,
    pub port: u16,
    pub data_port: u16,
    /// Master to join; required for slave hubs
    pub master_address: Option<String>,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            role: HubRole::Master,
            name: "localhost".to_string(),
            listen_address: "0.0.0.0".to_string(),
            port: DEFAULT_HUB_PORT,
            data_port: DEFAULT_DATA_PORT,
            master_address: None,
        }
    }
}

impl HubSection {
    /// Id of this hub before the master assigned one.
    pub fn initial_id(&self) -> Id {
        match self.role {
            HubRole::Master => Id::MASTER_HUB,
            HubRole::Slave => Id::INVALID,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }
}

/// Shared region of the modules started by this hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionSection {
    pub name: String,
    pub module_id: i32,
    pub rank: i32,
}

impl Default for RegionSection {
    fn default() -> Self {
        Self {
            name: "pipehub".to_string(),
            module_id: 0,
            rank: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub queue_capacity: usize,
    pub send_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Largest raw payload accepted behind an envelope
    pub max_payload: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }
}

impl TransportSection {
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            capacity: self.queue_capacity,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Used when `RUST_LOG` is not set
    pub filter: String,
    /// Daily rolling log files are written here when set
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            directory: None,
            file_prefix: "pipehub.log".to_string(),
        }
    }
}

// ==================== Hub Config ====================

/// Complete configuration of one hub process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub hub: HubSection,
    pub region: RegionSection,
    pub transport: TransportSection,
    pub logging: LoggingSection,
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("toml"))
}

impl HubConfig {
    /// Load a config file; the format follows the extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipehubError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = if is_toml(path) {
            toml::from_str(&content)
                .map_err(|e| PipehubError::Config(format!("Failed to parse config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| PipehubError::Config(format!("Failed to parse config: {}", e)))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save to `path`, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                PipehubError::Config(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }

        let content = if is_toml(path) {
            toml::to_string_pretty(self)
                .map_err(|e| PipehubError::Config(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| PipehubError::Config(format!("Failed to serialize config: {}", e)))?
        };

        std::fs::write(path, content).map_err(|e| {
            PipehubError::Config(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    /// Reject settings the hub cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.hub.role == HubRole::Slave && self.hub.master_address.is_none() {
            return Err(PipehubError::Config(
                "slave hub needs hub.master_address".to_string(),
            ));
        }
        if self.transport.queue_capacity == 0 {
            return Err(PipehubError::Config(
                "transport.queue_capacity must be positive".to_string(),
            ));
        }
        if self.transport.send_timeout_ms == 0 || self.transport.poll_interval_ms == 0 {
            return Err(PipehubError::Config(
                "transport timeouts must be positive".to_string(),
            ));
        }
        if self.transport.poll_interval_ms > self.transport.send_timeout_ms {
            return Err(PipehubError::Config(
                "transport.poll_interval_ms exceeds send_timeout_ms".to_string(),
            ));
        }
        Ok(())
    }
}
