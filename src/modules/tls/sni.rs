//! SNI-based certificate selection.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use tokio_rustls::rustls::crypto::aws_lc_rs::sign::any_supported_type;
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::ServerConfig;
use tracing::debug;

use super::certificate::CertificateBundle;
use super::error::{TlsError, TlsResult};

/// Picks the certificate matching the ClientHello's `server_name`.
///
/// Exact SAN matches win over wildcards; a `*.domain` SAN matches exactly
/// one label. There is no default certificate, so an unmatched name fails
/// the handshake.
#[derive(Default)]
pub struct SniResolver {
    exact: HashMap<String, Arc<CertifiedKey>>,
    wildcards: Vec<(String, Arc<CertifiedKey>)>,
}

impl Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .field(
                "wildcards",
                &self.wildcards.iter().map(|(s, _)| s).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl SniResolver {
    /// Create an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a certificate bundle under every DNS name it covers.
    pub fn add_bundle(&mut self, bundle: &CertificateBundle) -> TlsResult<()> {
        let signing_key =
            any_supported_type(bundle.private_key()).map_err(|e| TlsError::UnsupportedKey {
                path: bundle.name().to_string(),
                message: e.to_string(),
            })?;

        let certified = Arc::new(CertifiedKey::new(
            bundle.certificates().to_vec(),
            signing_key,
        ));

        for name in bundle.sni_names() {
            if let Some(suffix) = name.strip_prefix("*.") {
                self.wildcards
                    .push((suffix.to_string(), Arc::clone(&certified)));
            } else {
                self.exact.insert(name.clone(), Arc::clone(&certified));
            }
        }

        debug!(bundle = %bundle.name(), names = ?bundle.sni_names(), "certificate registered");
        Ok(())
    }

    /// Number of registered names, exact plus wildcard.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }

    /// Whether no names are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty()
    }

    /// Find the certificate for an SNI value.
    #[must_use]
    pub fn lookup(&self, sni: &str) -> Option<Arc<CertifiedKey>> {
        let sni = sni.to_ascii_lowercase();

        if let Some(key) = self.exact.get(&sni) {
            return Some(Arc::clone(key));
        }

        for (suffix, key) in &self.wildcards {
            if wildcard_matches(suffix, &sni) {
                return Some(Arc::clone(key));
            }
        }

        None
    }

    /// Build a rustls server config around this resolver.
    #[must_use]
    pub fn into_server_config(self) -> Arc<ServerConfig> {
        Arc::new(
            ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(self)),
        )
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?;
        let resolved = self.lookup(sni);
        if resolved.is_none() {
            debug!(sni = %sni, "no certificate for server name");
        }
        resolved
    }
}

/// Whether `hostname` is `<single-label>.<suffix>`.
fn wildcard_matches(suffix: &str, hostname: &str) -> bool {
    let Some(stripped) = hostname.strip_suffix(suffix) else {
        return false;
    };
    let Some(label) = stripped.strip_suffix('.') else {
        return false;
    };
    !label.is_empty() && !label.contains('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_single_label() {
        assert!(wildcard_matches("vhost1.test", "star.vhost1.test"));
        assert!(!wildcard_matches("vhost1.test", "vhost1.test"));
        assert!(!wildcard_matches("vhost1.test", "a.b.vhost1.test"));
        assert!(!wildcard_matches("vhost1.test", ".vhost1.test"));
        assert!(!wildcard_matches("vhost1.test", "other.test"));
    }

    #[test]
    fn empty_resolver_finds_nothing() {
        let resolver = SniResolver::new();
        assert!(resolver.is_empty());
        assert!(resolver.lookup("www.test").is_none());
    }
}
