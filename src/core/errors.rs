// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the daemon.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations. The outer HTTP layer maps these variants to status
/// codes; background loops log and swallow them.
#[derive(Error, Debug)]
pub enum BlockforgeError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Server jar missing: {0}")]
    JarMissing(String),

    #[error("RCON unavailable: {0}")]
    RconUnavailable(String),

    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Download failed: {0}")]
    DownloadError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serde(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BlockforgeError {
    /// Shorthand for the most common lookup failure.
    pub fn not_found(what: impl Into<String>) -> Self {
        BlockforgeError::NotFound(what.into())
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for BlockforgeError {
    fn clone(&self) -> Self {
        match self {
            BlockforgeError::Io(e) => BlockforgeError::Io(Arc::clone(e)),
            BlockforgeError::NotFound(s) => BlockforgeError::NotFound(s.clone()),
            BlockforgeError::PermissionDenied => BlockforgeError::PermissionDenied,
            BlockforgeError::Conflict(s) => BlockforgeError::Conflict(s.clone()),
            BlockforgeError::InvalidArgument(s) => BlockforgeError::InvalidArgument(s.clone()),
            BlockforgeError::JarMissing(s) => BlockforgeError::JarMissing(s.clone()),
            BlockforgeError::RconUnavailable(s) => BlockforgeError::RconUnavailable(s.clone()),
            BlockforgeError::SpawnError(s) => BlockforgeError::SpawnError(s.clone()),
            BlockforgeError::DownloadError(s) => BlockforgeError::DownloadError(s.clone()),
            BlockforgeError::Timeout(s) => BlockforgeError::Timeout(s.clone()),
            BlockforgeError::Serde(s) => BlockforgeError::Serde(s.clone()),
            BlockforgeError::Internal(s) => BlockforgeError::Internal(s.clone()),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for BlockforgeError {
    fn from(e: std::io::Error) -> Self {
        BlockforgeError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for BlockforgeError {
    fn from(e: serde_json::Error) -> Self {
        BlockforgeError::Serde(format!("JSON: {e}"))
    }
}

impl From<serde_yaml::Error> for BlockforgeError {
    fn from(e: serde_yaml::Error) -> Self {
        BlockforgeError::Serde(format!("YAML: {e}"))
    }
}

impl From<toml::de::Error> for BlockforgeError {
    fn from(e: toml::de::Error) -> Self {
        BlockforgeError::Serde(format!("TOML: {e}"))
    }
}

impl From<toml::ser::Error> for BlockforgeError {
    fn from(e: toml::ser::Error) -> Self {
        BlockforgeError::Serde(format!("TOML: {e}"))
    }
}

impl From<reqwest::Error> for BlockforgeError {
    fn from(e: reqwest::Error) -> Self {
        BlockforgeError::DownloadError(e.to_string())
    }
}

impl From<zip::result::ZipError> for BlockforgeError {
    fn from(e: zip::result::ZipError) -> Self {
        BlockforgeError::Internal(format!("archive error: {e}"))
    }
}

impl From<cron::error::Error> for BlockforgeError {
    fn from(e: cron::error::Error) -> Self {
        BlockforgeError::InvalidArgument(format!("cron: {e}"))
    }
}

impl From<rcon::Error> for BlockforgeError {
    fn from(e: rcon::Error) -> Self {
        BlockforgeError::RconUnavailable(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for BlockforgeError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        BlockforgeError::Timeout(e.to_string())
    }
}
