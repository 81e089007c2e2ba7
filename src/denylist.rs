//! Denylist enforcement backed by the shared key-value store.
//!
//! The store is written by the anomaly detector; the proxy only reads.
//! Presence of `blocklist:ip:<client>` means blocked, whatever the value —
//! TTLs are the writer's concern. The lookup fails open: the denylist is an
//! optimization over the detector, and losing the store must not take the
//! proxy down with it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::events::{EventShipper, RequestEvent};
use crate::flow::{client_key, TrafficFeatures};
use crate::observe::request_size_estimate;

const DENYLIST_KEY_PREFIX: &str = "blocklist:ip:";

/// Thin wrapper over the external key-value store.
#[derive(Clone)]
pub struct DenylistClient {
    conn: ConnectionManager,
}

impl DenylistClient {
    /// Connect and verify the store is reachable. Startup fails if it is
    /// not; only runtime errors degrade to fail-open.
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = ConnectionManager::new(client).await?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(endpoint = %redis_url, reply = %pong, "connected to denylist store");

        Ok(Self { conn })
    }

    /// Is this client key currently blocked?
    pub async fn is_blocked(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(format!("{DENYLIST_KEY_PREFIX}{key}"))
            .await?;
        Ok(exists)
    }
}

/// State for the denylist middleware.
#[derive(Clone)]
pub struct DenylistState {
    pub client: DenylistClient,
    pub shipper: Arc<EventShipper>,
}

/// First link of the chain: the cheapest reject path.
///
/// On a hit the request is answered 403 and no downstream middleware runs;
/// a deny event still goes to the streaming log (denials are signal for the
/// detector) with zeroed features, since the flow tracker only observes
/// authenticated, non-denied traffic.
pub async fn denylist_middleware(
    State(state): State<DenylistState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let key = client_key(request.headers(), peer);

    match state.client.is_blocked(&key).await {
        Ok(true) => {
            warn!(client_ip = %key, "denylisted client rejected");
            state.shipper.ship(denied_event(&request, key));
            return (StatusCode::FORBIDDEN, "Forbidden - IP Blocked").into_response();
        }
        Ok(false) => {}
        Err(e) => {
            // Fail open: availability of the store must not gate traffic
            warn!(client_ip = %key, error = %e, "denylist lookup failed, failing open");
        }
    }

    next.run(request).await
}

fn denied_event(request: &Request<Body>, client_ip: String) -> RequestEvent {
    RequestEvent {
        timestamp: Utc::now(),
        client_ip,
        method: request.method().to_string(),
        url: request.uri().to_string(),
        user_agent: request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned(),
        status: StatusCode::FORBIDDEN.as_u16(),
        duration_ms: 0,
        request_size: request_size_estimate(request.headers()),
        response_size: 0,
        protocol: format!("{:?}", request.version()),
        features: TrafficFeatures::default(),
    }
}
