//! Registry error types.

use thiserror::Error;

use crate::modules::service::ServiceError;

/// Errors that can occur applying a registry mutation.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// AddService for a name that is already registered.
    #[error("service '{0}' already exists")]
    ServiceExists(String),

    /// The named service is not registered.
    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    /// The named backend is not part of the service.
    #[error("backend '{backend}' not found in service '{service}'")]
    BackendNotFound {
        /// Owning service name.
        service: String,
        /// Backend name that was looked up.
        backend: String,
    },

    /// Starting or mutating the underlying service failed.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
