//! # TLS
//!
//! Certificate discovery from a directory of `<name>.pem` / `<name>.key`
//! pairs and SNI-based certificate selection for the HTTPS router.

pub mod certificate;
pub mod error;
pub mod sni;

pub use certificate::{load_cert_dir, CertificateBundle};
pub use error::{TlsError, TlsResult};
pub use sni::SniResolver;

use std::path::Path;

use tokio_rustls::rustls::ServerConfig;

/// Load every certificate pair in `dir` and build a server config that
/// resolves certificates by SNI.
pub fn server_config_from_dir(dir: &Path) -> TlsResult<std::sync::Arc<ServerConfig>> {
    let mut resolver = SniResolver::new();
    for bundle in load_cert_dir(dir)? {
        resolver.add_bundle(&bundle)?;
    }
    Ok(resolver.into_server_config())
}
