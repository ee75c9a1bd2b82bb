//! Daemon configuration
//!
//! Loaded from TOML. Every section and field has a default, so an empty file
//! (or no file at all) yields a working configuration.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::ConfigError;

/// Name of the configuration file inside the platform config directory
pub const CONFIG_FILE_NAME: &str = "spotd.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub engine: EngineConfig,
    pub audio: AudioConfig,
}

/// Command server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Listen backlog
    pub backlog: i32,
    /// Longest line accepted before it is handed to the parser unterminated
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            max_line_length: MAX_LINE_LENGTH,
        }
    }
}

/// Session engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub cache_location: PathBuf,
    pub settings_location: PathBuf,
    pub user_agent: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let dirs = project_dirs();
        Self {
            cache_location: dirs
                .as_ref()
                .map(|d| d.cache_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from("/tmp")),
            settings_location: dirs
                .as_ref()
                .map(|d| d.config_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from("/tmp")),
            user_agent: format!("spotd/{}", VERSION),
        }
    }
}

/// Settings for the bundled simulated session engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a freshly resolved track stays in the loading state
    pub metadata_delay_ms: u64,
    pub track_duration_secs: f32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Frequency of the generated tone
    pub tone_hz: f32,
    /// Re-poll interval reported when the engine has nothing scheduled
    pub idle_poll_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            metadata_delay_ms: 200,
            track_duration_secs: 30.0,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            tone_hz: 440.0,
            idle_poll_ms: 1000,
        }
    }
}

/// Where relayed audio ends up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Discard frames
    #[default]
    Null,
    /// Play on a local device (requires the `device-output` feature)
    Device,
}

/// Audio output settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub output: OutputKind,
    /// Output device name; the host default when unset
    pub device: Option<String>,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "spotd")
}

/// Default location of the configuration file, if the platform has one
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join(CONFIG_FILE_NAME))
}

impl AppConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read a configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Load the configuration.
    ///
    /// An explicit path must exist. Without one, the default location is
    /// used when a file is present there, and built-in defaults otherwise.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            tracing::info!("Loading configuration from {}", path.display());
            return Self::from_file(path);
        }

        match default_config_path() {
            Some(path) if path.is_file() => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::from_file(&path)
            }
            _ => {
                tracing::debug!("No configuration file, using defaults");
                Ok(Self::default())
            }
        }
    }
}
