// Peer configuration with defaults, persisted as JSON

use crate::room::connection::{DEFAULT_BIND_HOST, DEFAULT_CONNECT_HOST};
use crate::room::envelope::MAX_FRAME_LEN;
use crate::room::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Username used when none is configured
pub const DEFAULT_USERNAME: &str = "Anonymous";

/// Port used when none is configured
pub const DEFAULT_PORT: u16 = 1234;

/// Settings for one peer. Missing fields in a config file take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub username: String,
    pub port: u16,
    /// Local host the listener binds to
    pub bind_host: String,
    /// Host to connect to when none is given
    pub address: String,
    /// Largest accepted frame in bytes
    pub max_frame_len: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            username: DEFAULT_USERNAME.to_string(),
            port: DEFAULT_PORT,
            bind_host: DEFAULT_BIND_HOST.to_string(),
            address: DEFAULT_CONNECT_HOST.to_string(),
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl PeerConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("Failed to read {:?}: {}", path, e)))?;

        let config: PeerConfig = serde_json::from_str(&text)
            .map_err(|e| ChatError::Config(format!("Failed to parse {:?}: {}", path, e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default file if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Self::default_path();
                if default_path.exists() {
                    tracing::debug!("Loading config from {:?}", default_path);
                    Self::load(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Write as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ChatError::Config(format!("Failed to create {:?}: {}", parent, e)))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ChatError::Config(e.to_string()))?;

        std::fs::write(path, json)
            .map_err(|e| ChatError::Config(format!("Failed to write {:?}: {}", path, e)))
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        state_dir().join("config.json")
    }

    /// Apply a username override; blank names fall back to the default
    pub fn set_username(&mut self, username: Option<String>) {
        if let Some(username) = username {
            self.username = username;
        }
        if self.username.trim().is_empty() {
            self.username = DEFAULT_USERNAME.to_string();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_frame_len == 0 {
            return Err(ChatError::Config("max_frame_len must be positive".to_string()));
        }
        Ok(())
    }
}

/// Per-user state directory
pub fn state_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".keyroom")
}
