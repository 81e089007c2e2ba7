//! Environment-driven configuration.
//!
//! Every runtime parameter is externalized — no hardcoded ports, paths, or
//! endpoints. The deployment contract is plain environment variables with
//! documented defaults; `UPSTREAM_URL` is the only required key. Validation
//! happens once at startup and failures are fatal before the listener binds.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use http::Uri;
use serde::Serialize;

/// Resolved proxy configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyConfig {
    /// Listen port for the TLS listener (`PORT`, default 8443)
    pub port: u16,
    /// Logging verbosity (`LOG_LEVEL`, default "info")
    pub log_level: String,
    /// Single forward origin (`UPSTREAM_URL`, required)
    pub upstream_url: String,
    /// Server certificate (`TLS_CERT_PATH`)
    pub tls_cert_path: PathBuf,
    /// Server private key (`TLS_KEY_PATH`)
    pub tls_key_path: PathBuf,
    /// CA bundle for client-certificate verification (`CA_CERT_PATH`)
    pub ca_cert_path: PathBuf,
    /// RS256 verification key (`JWT_PUBLIC_KEY_PATH`)
    pub jwt_public_key_path: PathBuf,
    /// Comma-separated broker list (`KAFKA_BROKERS`)
    pub kafka_brokers: Vec<String>,
    /// Event topic (`KAFKA_TOPIC`)
    pub kafka_topic: String,
    /// Denylist endpoint (`REDIS_URL`)
    pub redis_url: String,
    /// Request read deadline in seconds (`READ_TIMEOUT_SECS`, default 30)
    pub read_timeout_secs: u64,
    /// Request write deadline in seconds (`WRITE_TIMEOUT_SECS`, default 30)
    pub write_timeout_secs: u64,
    /// Keep-alive idle timeout in seconds (`IDLE_TIMEOUT_SECS`, default 120)
    pub idle_timeout_secs: u64,
    /// Shutdown drain window in seconds (`SHUTDOWN_GRACE_SECS`, default 30)
    pub shutdown_grace_secs: u64,
    /// Flow idle-eviction threshold in seconds (`FLOW_IDLE_SECS`).
    /// 0 (the default) disables eviction: flow states then live for the
    /// process lifetime.
    pub flow_idle_secs: u64,
}

impl ProxyConfig {
    /// Read configuration from the environment and validate it.
    pub fn from_env() -> anyhow::Result<Self> {
        let cfg = Self {
            port: env_parse("PORT", 8443)?,
            log_level: env_str("LOG_LEVEL", "info"),
            upstream_url: env_str("UPSTREAM_URL", ""),
            tls_cert_path: env_str("TLS_CERT_PATH", "/certs/server.crt").into(),
            tls_key_path: env_str("TLS_KEY_PATH", "/certs/server.key").into(),
            ca_cert_path: env_str("CA_CERT_PATH", "/certs/ca.crt").into(),
            jwt_public_key_path: env_str("JWT_PUBLIC_KEY_PATH", "/certs/jwt_public.pem").into(),
            kafka_brokers: env_str("KAFKA_BROKERS", "localhost:9092")
                .split(',')
                .map(|b| b.trim().to_owned())
                .filter(|b| !b.is_empty())
                .collect(),
            kafka_topic: env_str("KAFKA_TOPIC", "request-logs"),
            redis_url: env_str("REDIS_URL", "localhost:6379"),
            read_timeout_secs: env_parse("READ_TIMEOUT_SECS", 30)?,
            write_timeout_secs: env_parse("WRITE_TIMEOUT_SECS", 30)?,
            idle_timeout_secs: env_parse("IDLE_TIMEOUT_SECS", 120)?,
            shutdown_grace_secs: env_parse("SHUTDOWN_GRACE_SECS", 30)?,
            flow_idle_secs: env_parse("FLOW_IDLE_SECS", 0)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check invariants that must hold before any component starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.upstream_url.is_empty() {
            bail!("UPSTREAM_URL is required");
        }

        let uri: Uri = self
            .upstream_url
            .parse()
            .with_context(|| format!("invalid UPSTREAM_URL: {}", self.upstream_url))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            other => bail!(
                "UPSTREAM_URL must be http or https, got {:?}",
                other.unwrap_or("none")
            ),
        }
        if uri.authority().is_none() {
            bail!("UPSTREAM_URL must include a host");
        }

        if self.kafka_brokers.is_empty() {
            bail!("KAFKA_BROKERS must name at least one broker");
        }

        Ok(())
    }

    /// Socket address the listener binds.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// Denylist endpoint as a URL the client library accepts.
    ///
    /// Deployments commonly set bare `host:port`; a scheme is prepended
    /// when absent so both forms work.
    pub fn redis_connection_url(&self) -> String {
        if self.redis_url.contains("://") {
            self.redis_url.clone()
        } else {
            format!("redis://{}", self.redis_url)
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Idle-eviction threshold, if eviction is enabled.
    pub fn flow_idle(&self) -> Option<Duration> {
        (self.flow_idle_secs > 0).then(|| Duration::from_secs(self.flow_idle_secs))
    }
}

fn env_str(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_owned(),
    }
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value
            .parse()
            .with_context(|| format!("invalid value for {key}: {value}")),
        _ => Ok(default),
    }
}
