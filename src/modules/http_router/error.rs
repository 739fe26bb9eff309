//! Host router error types.

use thiserror::Error;

/// Errors that can occur in the host router.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The router listener could not be bound.
    #[error("failed to bind '{address}': {source}")]
    BindError {
        /// Address that was attempted.
        address: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The router is already running.
    #[error("host router already started")]
    AlreadyStarted,

    /// Proxying the request to the upstream backend failed.
    #[error("upstream request failed: {0}")]
    UpstreamError(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for host router operations.
pub type RouterResult<T> = Result<T, RouterError>;
