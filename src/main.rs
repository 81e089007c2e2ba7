//! Aegis Zero - zero-trust edge proxy
//!
//! Terminates mutually authenticated TLS, enforces the shared denylist and
//! RS256 bearer credentials, forwards accepted traffic to a single upstream
//! origin, and ships one structured event per request (with per-client flow
//! features) to the streaming log consumed by the anomaly detector.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use aegis_zero_proxy::auth::{AuthState, TokenValidator};
use aegis_zero_proxy::config::ProxyConfig;
use aegis_zero_proxy::denylist::{DenylistClient, DenylistState};
use aegis_zero_proxy::events::EventShipper;
use aegis_zero_proxy::flow::FlowTracker;
use aegis_zero_proxy::forward::Forwarder;
use aegis_zero_proxy::listener::{build_router, serve, ListenerSettings};
use aegis_zero_proxy::observe::ObserveState;
use aegis_zero_proxy::tls::TlsProvider;

/// Aegis Zero - zero-trust edge proxy
#[derive(Parser, Debug)]
#[command(name = "aegis-zero-proxy")]
#[command(version, about, long_about = None)]
struct Args {
    /// Run configuration validation only (don't start the server)
    #[arg(long)]
    validate: bool,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON")]
    json_logs: bool,
}

/// Interval between idle-eviction sweeps of the flow tracker.
const FLOW_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls CryptoProvider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = Args::parse();

    let config = ProxyConfig::from_env()?;
    init_logging(&config.log_level, args.json_logs)?;

    info!("═══════════════════════════════════════════════");
    info!("  Aegis Zero v{} - Zero Trust Edge Proxy", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════");
    info!("  Listen:   0.0.0.0:{} (mTLS required)", config.port);
    info!("  Upstream: {}", config.upstream_url);
    info!("  Denylist: {}", config.redis_url);
    info!("  Events:   {} → {}", config.kafka_brokers.join(","), config.kafka_topic);
    info!("═══════════════════════════════════════════════");

    if args.validate {
        // TLS material and verification key must still load cleanly
        TlsProvider::new(&config)?;
        TokenValidator::from_pem_file(&config.jwt_public_key_path)?;
        info!("Configuration validation successful, exiting");
        return Ok(());
    }

    // Component construction order mirrors the chain: every failure here is
    // fatal before the listener binds
    let validator = TokenValidator::from_pem_file(&config.jwt_public_key_path)?;
    info!("Token validator initialized (RS256 family pinned)");

    let denylist = DenylistClient::connect(&config.redis_connection_url())
        .await
        .context("failed to connect to denylist store")?;

    let shipper = Arc::new(EventShipper::new(&config.kafka_brokers, &config.kafka_topic)?);
    info!(topic = %config.kafka_topic, "event shipper initialized");

    let tracker = Arc::new(FlowTracker::new());
    if let Some(idle) = config.flow_idle() {
        info!(idle_secs = idle.as_secs(), "flow idle eviction enabled");
        let sweep_tracker = tracker.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLOW_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let evicted = sweep_tracker.evict_idle(idle);
                if evicted > 0 {
                    debug!(evicted, remaining = sweep_tracker.len(), "evicted idle flows");
                }
            }
        });
    }

    let forwarder = Arc::new(Forwarder::new(&config.upstream_url)?);

    let tls = TlsProvider::new(&config)?;
    info!("TLS configured: min version 1.2, ECDHE + AES-GCM only, client certificates required");

    let app = build_router(
        DenylistState {
            client: denylist.clone(),
            shipper: shipper.clone(),
        },
        AuthState {
            validator: Arc::new(validator),
        },
        ObserveState {
            tracker: tracker.clone(),
            shipper: shipper.clone(),
        },
        forwarder,
        config.write_timeout(),
    );

    // Bind before spawning so startup failures stay synchronous
    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let settings = ListenerSettings::from_config(&config);
    let mut server = tokio::spawn(serve(
        listener,
        tls.server_config(),
        app,
        settings,
        shutdown_rx,
    ));

    tokio::select! {
        result = &mut server => {
            result.context("listener task panicked")??;
            anyhow::bail!("listener exited unexpectedly");
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
        }
    }

    // Stop accepting, drain in-flight requests, then flush the pipeline
    let _ = shutdown_tx.send(true);
    if let Err(e) = server.await.context("listener task panicked")? {
        error!(error = %e, "listener error during shutdown");
    }

    shipper.close(config.shutdown_grace()).await;
    drop(denylist);

    info!("Aegis Zero proxy stopped");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

/// Wait for OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("Failed to install SIGQUIT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigquit.recv() => {
            info!("Received SIGQUIT");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    // Fallback: just wait forever
    std::future::pending::<()>().await;
}
