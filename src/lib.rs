//! Aegis Zero - zero-trust edge proxy
//!
//! A reverse proxy that:
//! - Terminates mutually authenticated TLS and binds the verified client
//!   certificate to each request
//! - Enforces a shared denylist and RS256 bearer credentials, in that order
//! - Tracks per-client sliding-window traffic statistics as ML features
//! - Forwards accepted traffic to a single upstream origin
//! - Ships one structured event per request to a partitioned streaming log

pub mod auth;
pub mod config;
pub mod denylist;
pub mod events;
pub mod flow;
pub mod forward;
pub mod listener;
pub mod observe;
pub mod tls;
pub mod tls_acceptor;

// Re-export commonly used types
pub use auth::{AuthState, TokenValidator};
pub use config::ProxyConfig;
pub use denylist::{DenylistClient, DenylistState};
pub use events::{EventShipper, RequestEvent};
pub use flow::{client_key, FlowTracker, TrafficFeatures, FLOW_WINDOW};
pub use forward::Forwarder;
pub use listener::{build_router, serve, ListenerSettings, HEALTH_PATH};
pub use observe::{ObserveState, HEADER_OVERHEAD_BYTES};
pub use tls::TlsProvider;
pub use tls_acceptor::{ClientIdentity, MutualTlsAcceptor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
