//! Server TLS configuration with mandatory client-certificate verification.
//!
//! The handshake policy is fixed: minimum TLS 1.2, cipher suites restricted
//! to ECDHE with AES-GCM (RSA or ECDSA signatures), and a client certificate
//! verifiable against the configured CA bundle is required before any
//! middleware runs. A handshake without one is rejected at the TLS layer.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tracing::info;

use crate::config::ProxyConfig;

/// Holds the immutable rustls server configuration for the listener.
pub struct TlsProvider {
    server_config: Arc<ServerConfig>,
}

impl TlsProvider {
    /// Load key material and build the mTLS server configuration.
    pub fn new(cfg: &ProxyConfig) -> anyhow::Result<Self> {
        let cert_chain = load_certificates(&cfg.tls_cert_path)?;
        info!("Loaded {} server certificates", cert_chain.len());

        let private_key = load_private_key(&cfg.tls_key_path)?;

        let client_ca = load_client_ca(&cfg.ca_cert_path)?;
        info!("Loaded {} client CA certificates", client_ca.len());

        let provider = Arc::new(restricted_provider());

        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(client_ca), provider.clone())
                .build()
                .map_err(|e| anyhow!("failed to build client certificate verifier: {e}"))?;

        let mut server_config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .map_err(|e| anyhow!("failed to set TLS protocol versions: {e}"))?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| anyhow!("failed to build TLS server config: {e}"))?;

        server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Self {
            server_config: Arc::new(server_config),
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }
}

/// Ring crypto provider narrowed to ECDHE + AES-GCM suites.
///
/// The TLS 1.3 AES-GCM suites are included alongside the TLS 1.2 ECDHE
/// suites; 1.3 key exchange is always ephemeral.
fn restricted_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: vec![
            ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
            ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        ],
        ..ring::default_provider()
    }
}

/// Load certificates from a PEM file.
fn load_certificates(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open certificate file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in {}", path.display()))?;

    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", path.display()));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file (PKCS#8, PKCS#1 or SEC1).
fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open private key file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("failed to parse private key in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

/// Build the root store used to verify client certificates.
fn load_client_ca(path: &Path) -> anyhow::Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certificates(path)? {
        root_store
            .add(cert)
            .with_context(|| format!("failed to add CA certificate from {}", path.display()))?;
    }
    Ok(root_store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_offers_only_aes_gcm_suites() {
        let provider = restricted_provider();
        assert_eq!(provider.cipher_suites.len(), 6);
        for suite in &provider.cipher_suites {
            let name = format!("{:?}", suite.suite());
            assert!(name.contains("AES_128_GCM") || name.contains("AES_256_GCM"));
        }
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        let err = load_certificates(Path::new("/nonexistent/server.crt")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/server.crt"));
    }
}
