//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or persisting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        /// Path that was attempted.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The file could not be written.
    #[error("failed to write config file '{path}': {source}")]
    WriteError {
        /// Path that was attempted.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The file contents are not valid JSON for the schema.
    #[error("invalid config in '{path}': {source}")]
    ParseError {
        /// Path that was attempted.
        path: String,
        /// Underlying serde error.
        source: serde_json::Error,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
