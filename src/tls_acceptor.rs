//! TLS accept path with client-identity capture.
//!
//! Wraps the tokio-rustls acceptor so the verified peer certificate can be
//! bound to the connection before HTTP serving begins. The extracted
//! identity (subject common name plus SHA-256 digest of the DER-encoded
//! leaf) is injected into every request on the connection and surfaces
//! upstream as the `X-Client-Cert-*` headers.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::ServerConnection;
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::debug;
use x509_parser::prelude::*;

/// Identity of the authenticated peer on one connection.
#[derive(Clone, Debug)]
pub struct ClientIdentity {
    pub remote_addr: SocketAddr,
    /// Subject common name of the verified client certificate
    pub common_name: Option<String>,
    /// SHA-256 hex digest of the DER-encoded client certificate
    pub fingerprint: Option<String>,
}

/// TLS acceptor that requires and records a verified client certificate.
///
/// Certificate verification itself happens inside the rustls handshake
/// (the server config carries the CA-bundle verifier); connections that
/// fail it never reach the caller.
#[derive(Clone)]
pub struct MutualTlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl MutualTlsAcceptor {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            inner: tokio_rustls::TlsAcceptor::from(config),
        }
    }

    /// Perform the handshake and extract the peer identity.
    pub async fn accept(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> io::Result<(TlsStream<TcpStream>, ClientIdentity)> {
        let tls_stream = self.inner.accept(stream).await.map_err(|e| {
            debug!(peer = %remote_addr, error = %e, "TLS handshake failed");
            e
        })?;

        let identity = {
            let (_, connection) = tls_stream.get_ref();
            identity_from_connection(connection, remote_addr)
        };

        Ok((tls_stream, identity))
    }
}

fn identity_from_connection(
    connection: &ServerConnection,
    remote_addr: SocketAddr,
) -> ClientIdentity {
    let leaf = connection
        .peer_certificates()
        .and_then(|certs| certs.first());

    match leaf {
        Some(cert) => ClientIdentity {
            remote_addr,
            common_name: certificate_common_name(cert.as_ref()),
            fingerprint: Some(certificate_fingerprint(cert.as_ref())),
        },
        None => ClientIdentity {
            remote_addr,
            common_name: None,
            fingerprint: None,
        },
    }
}

/// SHA-256 hex digest of a DER-encoded certificate.
pub fn certificate_fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Subject common name of a DER-encoded certificate.
pub fn certificate_common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(ToOwned::to_owned);
    name
}
