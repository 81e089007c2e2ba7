//! Bearer-token validation middleware.
//!
//! Tokens are JWTs verified against a single RSA public key loaded at
//! startup. The signing algorithm is pinned to the RS256 family: the token
//! header is checked before verification and the validator's algorithm list
//! is restricted to the same set, so an otherwise well-formed token signed
//! with HS256 (or anything non-RSA) is rejected outright. That closes the
//! algorithm-confusion hole where the public key doubles as an HMAC secret.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use tracing::{debug, warn};

use crate::listener::HEALTH_PATH;

const RSA_FAMILY: [Algorithm; 3] = [Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

/// Verifies bearer credentials against a fixed RSA public key.
///
/// The key is immutable for the process lifetime; a reloadable key source
/// would slot in behind this same constructor seam.
pub struct TokenValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    /// Load the verification key from a PEM file. Fails on unreadable files
    /// and on keys that are not RSA public keys.
    pub fn from_pem_file(path: &Path) -> anyhow::Result<Self> {
        let pem = std::fs::read(path)
            .with_context(|| format!("failed to read public key file {}", path.display()))?;
        Self::from_rsa_pem(&pem)
    }

    pub fn from_rsa_pem(pem: &[u8]) -> anyhow::Result<Self> {
        let decoding_key = DecodingKey::from_rsa_pem(pem)
            .context("verification key is not an RSA public key")?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.algorithms = RSA_FAMILY.to_vec();
        // Expiry is enforced when present; tokens without `exp` are valid
        validation.set_required_spec_claims::<&str>(&[]);

        Ok(Self {
            decoding_key,
            validation,
        })
    }

    /// Verify a bearer token and return its claims.
    pub fn verify(&self, token: &str) -> Result<serde_json::Value, jsonwebtoken::errors::Error> {
        let header = jsonwebtoken::decode_header(token)?;
        if !RSA_FAMILY.contains(&header.alg) {
            return Err(jsonwebtoken::errors::ErrorKind::InvalidAlgorithm.into());
        }

        let data =
            jsonwebtoken::decode::<serde_json::Value>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }
}

/// State for the token-validation middleware.
#[derive(Clone)]
pub struct AuthState {
    pub validator: Arc<TokenValidator>,
}

/// Second link of the chain: reject unauthenticated traffic before it is
/// tracked. The health route is exempt unconditionally.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.uri().path() == HEALTH_PATH {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(auth_header) = auth_header else {
        debug!(peer = ?peer, "missing Authorization header");
        return unauthorized();
    };

    let Some(token) = bearer_token(auth_header) else {
        debug!(peer = ?peer, "malformed Authorization header");
        return unauthorized();
    };

    match state.validator.verify(token) {
        Ok(claims) => {
            // Best-effort subject logging; malformed claims never reject
            if let Some(sub) = claims.get("sub").and_then(|v| v.as_str()) {
                debug!(subject = %sub, "authenticated request");
            }
            next.run(request).await
        }
        Err(e) => {
            warn!(peer = ?peer, error = %e, "token validation failed");
            unauthorized()
        }
    }
}

/// Parse `Bearer <token>` with a case-insensitive scheme match.
fn bearer_token(header: &str) -> Option<&str> {
    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next()?;
    let token = parts.next()?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token)
    } else {
        None
    }
}

fn unauthorized() -> Response {
    // Fixed body; diagnostic detail stays in the server log
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}
