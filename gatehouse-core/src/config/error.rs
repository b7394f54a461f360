//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    // ─────────────────────────────────────────────────────────────────────────
    // Value validation errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Invalid URL format.
    #[error("invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    /// Invalid duration string.
    #[error("invalid duration for '{field}': {message}")]
    InvalidDuration { field: String, message: String },

    /// Invalid human-readable byte size.
    #[error("invalid size '{value}': {message}")]
    InvalidSize { value: String, message: String },

    /// A value is present but not usable.
    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // I/O and parsing errors
    // ─────────────────────────────────────────────────────────────────────────
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    ParseError(#[from] serde_saphyr::Error),

    /// I/O error reading config file.
    #[error("I/O error reading {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Empty configuration file.
    #[error("configuration file is empty")]
    EmptyConfigFile,
}
