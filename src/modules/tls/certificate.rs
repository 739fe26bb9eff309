//! Certificate loading and directory discovery.
//!
//! Certificates are discovered from a directory of `<name>.pem` +
//! `<name>.key` pairs. The DNS names each certificate covers come from its
//! Subject Alternative Names, so a bundle never needs hostnames configured
//! by hand.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls_pemfile::{certs, private_key};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, info, warn};

use super::error::{TlsError, TlsResult};

/// A loaded certificate chain, its private key, and the SNI names the
/// leaf certificate covers.
pub struct CertificateBundle {
    /// Bundle name, taken from the file stem.
    name: String,

    /// Certificate chain, leaf first.
    certificates: Vec<CertificateDer<'static>>,

    /// Private key.
    private_key: PrivateKeyDer<'static>,

    /// DNS names from the leaf certificate's SANs (falling back to the
    /// subject CN when no SAN extension is present).
    sni_names: Vec<String>,
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("name", &self.name)
            .field("certificates", &self.certificates.len())
            .field("sni_names", &self.sni_names)
            .finish()
    }
}

impl CertificateBundle {
    /// Load one `<name>.pem` + `<name>.key` pair.
    pub fn load(name: &str, cert_path: &Path, key_path: &Path) -> TlsResult<Self> {
        let certificates = load_certificates(cert_path)?;
        if certificates.is_empty() {
            return Err(TlsError::CertificateLoadError {
                path: cert_path.display().to_string(),
                message: "no certificates found in file".to_string(),
            });
        }

        let private_key = load_private_key(key_path)?;
        let sni_names = extract_dns_names(&certificates[0], cert_path)?;

        debug!(name = %name, sni_names = ?sni_names, "certificate bundle loaded");

        Ok(Self {
            name: name.to_string(),
            certificates,
            private_key,
            sni_names,
        })
    }

    /// Bundle name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The certificate chain, leaf first.
    #[must_use]
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    /// The private key.
    #[must_use]
    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    /// The DNS names this bundle serves.
    #[must_use]
    pub fn sni_names(&self) -> &[String] {
        &self.sni_names
    }
}

/// Load every certificate pair in a directory.
///
/// A `.pem` file with no matching `.key` sibling, or a pair that fails to
/// parse, is logged and skipped so one bad bundle does not take the HTTPS
/// listener down.
pub fn load_cert_dir(dir: &Path) -> TlsResult<Vec<CertificateBundle>> {
    let entries = std::fs::read_dir(dir).map_err(|e| TlsError::DirectoryError {
        path: dir.display().to_string(),
        source: e,
    })?;

    let mut bundles = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| TlsError::DirectoryError {
            path: dir.display().to_string(),
            source: e,
        })?;

        let cert_path = entry.path();
        if cert_path.extension().and_then(|e| e.to_str()) != Some("pem") {
            continue;
        }
        let Some(stem) = cert_path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let key_path = cert_path.with_extension("key");
        if !key_path.exists() {
            warn!(cert = %cert_path.display(), "no matching .key file, skipping");
            continue;
        }

        match CertificateBundle::load(stem, &cert_path, &key_path) {
            Ok(bundle) => bundles.push(bundle),
            Err(e) => warn!(cert = %cert_path.display(), error = %e, "skipping certificate"),
        }
    }

    info!(dir = %dir.display(), bundles = bundles.len(), "certificates loaded");
    Ok(bundles)
}

/// Read all certificates from a PEM file.
fn load_certificates(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| TlsError::CertificateLoadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateLoadError {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

/// Read the private key from a PEM file.
fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| TlsError::PrivateKeyLoadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| TlsError::PrivateKeyLoadError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| TlsError::PrivateKeyLoadError {
            path: path.display().to_string(),
            message: "no private key found in file".to_string(),
        })
}

/// Extract the DNS names a leaf certificate covers: the SAN DNS entries,
/// or the subject CN when the certificate has no SAN extension.
fn extract_dns_names(cert: &CertificateDer<'_>, path: &Path) -> TlsResult<Vec<String>> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).map_err(|e| {
        TlsError::CertificateParseError {
            path: path.display().to_string(),
            message: e.to_string(),
        }
    })?;

    let mut names = Vec::new();

    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for general_name in &san.value.general_names {
            if let x509_parser::extensions::GeneralName::DNSName(dns) = general_name {
                names.push(dns.to_ascii_lowercase());
            }
        }
    }

    if names.is_empty() {
        for cn in parsed.subject().iter_common_name() {
            if let Ok(value) = cn.as_str() {
                names.push(value.to_ascii_lowercase());
            }
        }
    }

    if names.is_empty() {
        return Err(TlsError::CertificateParseError {
            path: path.display().to_string(),
            message: "certificate carries no DNS names".to_string(),
        });
    }

    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("switchyard-certs-{}-{}", std::process::id(), name));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn empty_directory_yields_no_bundles() {
        let dir = temp_dir("empty");
        let bundles = load_cert_dir(&dir).unwrap();
        assert!(bundles.is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_directory_is_an_error() {
        let mut dir = std::env::temp_dir();
        dir.push("switchyard-no-such-dir");
        assert!(matches!(
            load_cert_dir(&dir),
            Err(TlsError::DirectoryError { .. })
        ));
    }

    #[test]
    fn pem_without_key_is_skipped() {
        let dir = temp_dir("orphan");
        std::fs::write(dir.join("lonely.pem"), b"not a cert").unwrap();

        let bundles = load_cert_dir(&dir).unwrap();
        assert!(bundles.is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn invalid_pair_is_skipped_not_fatal() {
        let dir = temp_dir("garbage");
        std::fs::write(dir.join("bad.pem"), b"garbage").unwrap();
        std::fs::write(dir.join("bad.key"), b"garbage").unwrap();

        let bundles = load_cert_dir(&dir).unwrap();
        assert!(bundles.is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
