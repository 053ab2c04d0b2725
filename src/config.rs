// src/config.rs
//
// Link configuration, persisted as TOML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::io::IoError;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Serial device name ("/dev/ttyACM0", "COM3", ...)
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Deadline for a correlated command, also bounds reader shutdown
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// How long the reader idles when no byte is available
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Emit `LinkEvent::Trace` for every write and read
    #[serde(default)]
    pub trace: bool,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// JSON and text frames longer than this are discarded
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

fn default_port() -> String {
    if cfg!(windows) {
        "COM3".to_string()
    } else {
        "/dev/ttyACM0".to_string()
    }
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_command_timeout_ms() -> u64 {
    3000
}

fn default_poll_interval_ms() -> u64 {
    20
}

fn default_event_capacity() -> usize {
    256
}

fn default_max_frame_len() -> usize {
    4096
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            command_timeout_ms: default_command_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            trace: false,
            event_capacity: default_event_capacity(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl LinkConfig {
    /// Default config for the given device name.
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// `<config dir>/canbus-triple/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("canbus-triple").join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<LinkConfig, IoError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| IoError::configuration(format!("Failed to read {}: {}", path.display(), e)))?;

        toml::from_str(&content)
            .map_err(|e| IoError::configuration(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<LinkConfig, IoError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), IoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IoError::configuration(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| IoError::configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| IoError::configuration(format!("Failed to write {}: {}", path.display(), e)))
    }
}
