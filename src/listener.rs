//! TLS listener, router assembly and connection serving.
//!
//! The chain order is a contract, outermost first: denylist (cheapest
//! reject), token validation (reject before tracking), flow accounting and
//! event emission (observes only authenticated, non-denied traffic), then
//! the forwarder. Moving the tracker ahead of token validation would poison
//! the feature distribution with unauthenticated probes; putting the
//! denylist after token validation would spend signature checks on clients
//! already known bad. The health route is attached outside the layered
//! stack and bypasses all of it.

use std::io;
use std::net::SocketAddr;
use std::pin::{pin, Pin};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower::ServiceExt;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info, warn};

use crate::auth::{auth_middleware, AuthState};
use crate::denylist::{denylist_middleware, DenylistState};
use crate::forward::{forward_handler, Forwarder};
use crate::observe::{observe_middleware, ObserveState};
use crate::tls_acceptor::{ClientIdentity, MutualTlsAcceptor};

/// Health endpoint path, exempt from all middleware.
pub const HEALTH_PATH: &str = "/health";

/// How often each connection checks whether it has gone idle.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Timeouts applied by the serving loop.
#[derive(Clone, Copy, Debug)]
pub struct ListenerSettings {
    /// Deadline for reading a request's headers.
    pub read_timeout: Duration,
    /// Connections with no socket activity for this long are closed.
    pub idle_timeout: Duration,
    /// How long to wait for in-flight connections on shutdown.
    pub shutdown_grace: Duration,
}

impl ListenerSettings {
    pub fn from_config(cfg: &crate::config::ProxyConfig) -> Self {
        Self {
            read_timeout: cfg.read_timeout(),
            idle_timeout: cfg.idle_timeout(),
            shutdown_grace: cfg.shutdown_grace(),
        }
    }
}

/// Assemble the middleware chain and routes.
///
/// `request_timeout` is the per-request write deadline, applied outside the
/// whole chain.
pub fn build_router(
    denylist: DenylistState,
    auth: AuthState,
    observe: ObserveState,
    forwarder: Arc<Forwarder>,
    request_timeout: Duration,
) -> Router {
    // Layers wrap bottom-up: the last layer added runs first
    Router::new()
        .fallback(forward_handler)
        .layer(middleware::from_fn_with_state(observe, observe_middleware))
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .layer(middleware::from_fn_with_state(denylist, denylist_middleware))
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(forwarder)
        .route(HEALTH_PATH, get(health))
}

async fn health() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"status":"healthy","service":"aegis-zero-proxy"}"#,
    )
}

/// Accept TLS connections and serve them until `shutdown` flips.
///
/// The listener is bound by the caller so bind failures stay on the startup
/// path. On shutdown the loop stops accepting, asks in-flight connections
/// to finish gracefully, and waits up to the grace period for them.
pub async fn serve(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    app: Router,
    settings: ListenerSettings,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr().context("listener has no address")?;
    info!("🔒 mTLS reverse proxy listening on {}", local_addr);

    let acceptor = MutualTlsAcceptor::new(tls_config);

    // Every connection task holds a sender clone; recv() returning None
    // after we drop ours means the last connection finished
    let (conn_tx, mut conn_rx) = mpsc::channel::<()>(1);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let app = app.clone();
                let shutdown = shutdown.clone();
                let conn_guard = conn_tx.clone();

                tokio::spawn(async move {
                    let _guard = conn_guard;
                    // Handshakes without a verifiable client certificate end
                    // here: the connection drops with no HTTP response
                    let (tls_stream, identity) = match acceptor.accept(stream, remote_addr).await {
                        Ok(accepted) => accepted,
                        Err(_) => return,
                    };
                    serve_connection(tls_stream, identity, remote_addr, app, shutdown, settings)
                        .await;
                });
            }
            _ = shutdown.changed() => break,
        }
    }

    info!("listener stopped accepting, draining in-flight connections");
    drop(conn_tx);
    if tokio::time::timeout(settings.shutdown_grace, conn_rx.recv())
        .await
        .is_err()
    {
        warn!(
            grace_secs = settings.shutdown_grace.as_secs(),
            "shutdown grace elapsed with connections still active"
        );
    }

    Ok(())
}

async fn serve_connection(
    tls_stream: tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
    identity: ClientIdentity,
    remote_addr: SocketAddr,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
    settings: ListenerSettings,
) {
    let service = hyper::service::service_fn(move |mut request: hyper::Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(remote_addr));
        request.extensions_mut().insert(identity.clone());
        app.clone().oneshot(request.map(Body::new))
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(settings.read_timeout);
    builder.http2().timer(TokioTimer::new());

    let activity = IdleActivity::new();
    let stream = IdleTrackedStream::new(tls_stream, activity.clone());
    let connection = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    let mut connection = pin!(connection);

    let mut idle_check = tokio::time::interval(IDLE_CHECK_INTERVAL);
    let mut draining = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    debug!(peer = %remote_addr, error = %e, "connection closed with error");
                }
                break;
            }
            _ = shutdown.changed(), if !draining => {
                draining = true;
                connection.as_mut().graceful_shutdown();
            }
            _ = idle_check.tick(), if !draining => {
                if activity.idle_for() >= settings.idle_timeout {
                    debug!(peer = %remote_addr, "closing idle connection");
                    draining = true;
                    connection.as_mut().graceful_shutdown();
                }
            }
        }
    }
}

/// Shared record of a connection's most recent socket activity.
#[derive(Clone)]
struct IdleActivity {
    started: Instant,
    last_active_ms: Arc<AtomicU64>,
}

impl IdleActivity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_active_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_active_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let last = self.last_active_ms.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.saturating_sub(last))
    }
}

/// Pass-through stream that timestamps every successful read and write,
/// so the serving loop can enforce the idle-connection timeout.
struct IdleTrackedStream<S> {
    inner: S,
    activity: IdleActivity,
}

impl<S> IdleTrackedStream<S> {
    fn new(inner: S, activity: IdleActivity) -> Self {
        Self { inner, activity }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) {
            this.activity.touch();
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(poll, Poll::Ready(Ok(_))) {
            this.activity.touch();
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
