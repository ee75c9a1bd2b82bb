//! Error types for the playback daemon

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the daemon
#[derive(Error, Debug)]
pub enum Error {
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Command server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Socket bind to {addr} failed: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    #[error("Could not create thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid link: {0}")]
    InvalidLink(String),

    #[error("Failed to load track: {0}")]
    LoadFailed(String),

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Unable to create session: {0}")]
    CreateFailed(String),

    #[error("Could not create session thread: {0}")]
    ThreadSpawn(String),
}

/// Audio output errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Could not create audio thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result type alias for the daemon
pub type Result<T> = std::result::Result<T, Error>;
