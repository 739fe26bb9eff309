//! Admin API error types.

use thiserror::Error;

/// Errors that can occur in the admin server.
#[derive(Debug, Error)]
pub enum AdminError {
    /// The admin listener could not be bound.
    #[error("failed to bind admin listener '{address}': {source}")]
    BindError {
        /// Address that was attempted.
        address: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The admin server is already running.
    #[error("admin server already started")]
    AlreadyStarted,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for admin server operations.
pub type AdminResult<T> = Result<T, AdminError>;
