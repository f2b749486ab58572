//! Error types for service configuration.

use std::path::PathBuf;
use thiserror::Error;

/// Errors loading or validating a [`ServiceConfig`](crate::ServiceConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML, or has unknown or mistyped keys.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is out of range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}
