//! Mutual-TLS material for the service-discovery and control-plane clients.
//!
//! Both clients are given the same three PEM files: a CA bundle used to
//! verify the server, and a client certificate/key pair presented to it.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing PEM: {0}")]
    Pem(#[source] std::io::Error),

    #[error("no certificates found in {0}")]
    NoCertificates(&'static str),

    #[error("no private key found in client key")]
    NoPrivateKey,

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// PEM-encoded CA bundle plus client certificate and key.
#[derive(Clone)]
pub struct TlsMaterial {
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_pem", &self.ca_pem.len())
            .field("cert_pem", &self.cert_pem.len())
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl TlsMaterial {
    /// Material from PEM bytes already in memory. Nothing is parsed until
    /// a client config is built from it.
    pub fn from_pem(
        ca_pem: impl Into<Vec<u8>>,
        cert_pem: impl Into<Vec<u8>>,
        key_pem: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            ca_pem: ca_pem.into(),
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    /// Read the three PEM files from disk.
    pub fn load(ca: &Path, cert: &Path, key: &Path) -> Result<Self, TlsError> {
        Ok(Self {
            ca_pem: read(ca)?,
            cert_pem: read(cert)?,
            key_pem: read(key)?,
        })
    }

    /// Build a rustls client config that verifies the server against the CA
    /// bundle and presents the client certificate. TLS 1.2 is the floor.
    pub fn client_config(&self) -> Result<ClientConfig, TlsError> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(&self.ca_pem, "CA bundle")? {
            roots.add(cert)?;
        }

        let chain = parse_certs(&self.cert_pem, "client certificate")?;
        let key = parse_key(&self.key_pem)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
            .with_root_certificates(roots)
            .with_client_auth_cert(chain, key)?;

        Ok(config)
    }
}

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn parse_certs(pem: &[u8], what: &'static str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::Pem)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(what));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(TlsError::Pem)?
        .ok_or(TlsError::NoPrivateKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
    use rustls::client::ResolvesClientCert;

    fn generate() -> TlsMaterial {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(vec!["overlay-ca".into()]).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let client_key = KeyPair::generate().unwrap();
        let client_cert = CertificateParams::new(vec!["client".into()])
            .unwrap()
            .signed_by(&client_key, &ca_cert, &ca_key)
            .unwrap();

        TlsMaterial::from_pem(
            ca_cert.pem(),
            client_cert.pem(),
            client_key.serialize_pem(),
        )
    }

    #[test]
    fn builds_client_config_from_generated_material() {
        let material = generate();
        let config = material.client_config().unwrap();
        assert!(config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn loads_material_from_files() {
        let material = generate();
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.crt");
        let cert = dir.path().join("client.crt");
        let key = dir.path().join("client.key");
        std::fs::write(&ca, &material.ca_pem).unwrap();
        std::fs::write(&cert, &material.cert_pem).unwrap();
        std::fs::write(&key, &material.key_pem).unwrap();

        let loaded = TlsMaterial::load(&ca, &cert, &key).unwrap();
        assert_eq!(loaded.ca_pem, material.ca_pem);
        loaded.client_config().unwrap();
    }

    #[test]
    fn missing_file_is_reported_with_path() {
        let err = TlsMaterial::load(
            Path::new("/nonexistent/ca.crt"),
            Path::new("/nonexistent/c.crt"),
            Path::new("/nonexistent/c.key"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.crt"));
    }

    #[test]
    fn empty_ca_bundle_is_rejected() {
        let mut material = generate();
        material.ca_pem = b"not a certificate".to_vec();
        assert!(matches!(
            material.client_config(),
            Err(TlsError::NoCertificates("CA bundle"))
        ));
    }

    #[test]
    fn missing_key_is_rejected() {
        let mut material = generate();
        material.key_pem = Vec::new();
        assert!(matches!(material.client_config(), Err(TlsError::NoPrivateKey)));
    }

    #[test]
    fn debug_output_redacts_key() {
        let material = generate();
        let rendered = format!("{material:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("PRIVATE KEY"));
    }
}
