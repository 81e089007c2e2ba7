//! Single-origin reverse proxy forwarder.
//!
//! Terminal link of the chain. The origin is fixed at startup; requests are
//! forwarded with their path and query intact (joined after any origin path
//! prefix), the `Host` header rewritten to the origin, and the proxy's
//! identity headers appended. Forwarding failures map to a fixed 502 — the
//! request stays countable and shippable by the observation layer above.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::uri::{Authority, Scheme};
use axum::http::{header, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error, info};

use crate::tls_acceptor::ClientIdentity;

/// Headers never forwarded to the origin.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "transfer-encoding",
    "upgrade",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

/// Reverse proxy to the configured upstream origin.
pub struct Forwarder {
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>,
    scheme: Scheme,
    authority: Authority,
    base_path: String,
}

impl Forwarder {
    pub fn new(upstream_url: &str) -> anyhow::Result<Self> {
        let uri: Uri = upstream_url
            .parse()
            .with_context(|| format!("invalid upstream URL: {upstream_url}"))?;

        let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| anyhow!("upstream URL must include a host: {upstream_url}"))?;
        let base_path = uri.path().trim_end_matches('/').to_owned();

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        info!(upstream = %upstream_url, "forwarder configured");

        Ok(Self {
            client,
            scheme,
            authority,
            base_path,
        })
    }

    /// Forward one request to the origin.
    pub async fn forward(&self, mut request: Request<Body>) -> Response {
        let identity = request.extensions().get::<ClientIdentity>().cloned();
        let peer_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip());

        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!(
            "{}://{}{}{}",
            self.scheme, self.authority, self.base_path, path_and_query
        );
        let target_uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                error!(target = %target, error = %e, "failed to build upstream URI");
                return bad_gateway();
            }
        };
        *request.uri_mut() = target_uri;

        let headers = request.headers_mut();
        for name in HOP_BY_HOP_HEADERS {
            headers.remove(name);
        }

        // Rewrite Host to the origin
        if let Ok(host) = HeaderValue::from_str(self.authority.as_str()) {
            headers.insert(header::HOST, host);
        }

        headers.insert("x-forwarded-by", HeaderValue::from_static("aegis-zero"));

        if let Some(identity) = &identity {
            if let Some(cn) = identity.common_name.as_deref() {
                if let Ok(value) = HeaderValue::from_str(cn) {
                    headers.insert("x-client-cert-cn", value);
                }
            }
            if let Some(fingerprint) = identity.fingerprint.as_deref() {
                if let Ok(value) = HeaderValue::from_str(fingerprint) {
                    headers.insert("x-client-cert-fingerprint", value);
                }
            }
        }

        if let Some(ip) = peer_ip {
            append_forwarded_for(headers, &ip.to_string());
        }

        match self.client.request(request).await {
            Ok(upstream_response) => {
                let (parts, body) = upstream_response.into_parts();
                debug!(status = %parts.status, "upstream response");
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => {
                error!(upstream = %self.authority, error = %e, "error forwarding request");
                bad_gateway()
            }
        }
    }
}

/// Axum fallback handler: everything that is not the health route ends here.
pub async fn forward_handler(
    State(forwarder): State<Arc<Forwarder>>,
    request: Request<Body>,
) -> Response {
    forwarder.forward(request).await
}

fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
}

fn append_forwarded_for(headers: &mut axum::http::HeaderMap, ip: &str) {
    let value = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => format!("{existing}, {ip}"),
        None => ip.to_owned(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}
