//! TLS module error types.

use thiserror::Error;

/// Errors that can occur loading certificates or building TLS state.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A certificate file could not be loaded.
    #[error("failed to load certificate '{path}': {message}")]
    CertificateLoadError {
        /// Path that was attempted.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// A private key file could not be loaded.
    #[error("failed to load private key '{path}': {message}")]
    PrivateKeyLoadError {
        /// Path that was attempted.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// The certificate could not be parsed for SAN extraction.
    #[error("failed to parse certificate '{path}': {message}")]
    CertificateParseError {
        /// Path that was attempted.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// The key type is unsupported by the TLS provider.
    #[error("unsupported key in '{path}': {message}")]
    UnsupportedKey {
        /// Path that was attempted.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// The certificate directory could not be read.
    #[error("failed to read certificate directory '{path}': {source}")]
    DirectoryError {
        /// Directory that was attempted.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },
}

/// Result type for TLS operations.
pub type TlsResult<T> = Result<T, TlsError>;
