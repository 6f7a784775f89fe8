//! Generic TOML configuration loading, shared by every binary in the workspace.
//!
//! Concrete configuration structs (e.g. `ecu_scheduler::config::EcuConfig`)
//! implement [`serde::de::DeserializeOwned`] and get [`ConfigLoader::load`]
//! for free via the blanket impl below; they layer their own semantic
//! validation on top.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Log verbosity level for configuration (independent of the `tracing::Level`
/// the binary actually initializes with — this is what a calibration file
/// may request as a default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace-level verbosity.
    Trace,
    /// Debug-level verbosity.
    Debug,
    /// Info-level verbosity (default).
    Info,
    /// Warning-level verbosity.
    Warn,
    /// Error-level verbosity.
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),
    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),
    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Trait for loading configuration from TOML files.
///
/// Returns [`ConfigError::FileNotFound`] if the file does not exist,
/// [`ConfigError::ParseError`] if TOML syntax is invalid. Callers apply
/// their own `.validate()` pass afterward for semantic checks.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file at `path`.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.display().to_string())
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load configuration from an in-memory TOML string (for tests).
    fn load_from_str(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
