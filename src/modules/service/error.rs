//! Service engine error types.

use thiserror::Error;

/// Errors that can occur in the service engine.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The listener could not be bound.
    #[error("failed to bind '{address}': {source}")]
    BindError {
        /// Address that was attempted.
        address: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// A backend address did not parse as `ip:port`.
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    /// The service listener is already running.
    #[error("service '{0}' already started")]
    AlreadyStarted(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;
