//! Shared-secret authentication for the subscriber and status surfaces
//!
//! Tokens are accepted from `Authorization: Bearer <token>` or a `token`
//! query parameter (browsers cannot set headers on WebSocket upgrades).

use crate::metrics::MetricsRecorder;
use axum::extract::{Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// Decides whether a presented token is allowed in
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: Option<&str>) -> bool;

    /// True when every request is accepted
    fn is_open(&self) -> bool {
        false
    }
}

/// No secret configured
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _token: Option<&str>) -> bool {
        true
    }

    fn is_open(&self) -> bool {
        true
    }
}

/// Single shared secret, compared in constant time
#[derive(Clone)]
pub struct SharedSecret {
    digest: [u8; 32],
}

impl SharedSecret {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            digest: Sha256::digest(secret.as_ref()).into(),
        }
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

impl Authenticator for SharedSecret {
    fn authenticate(&self, token: Option<&str>) -> bool {
        let Some(token) = token else {
            return false;
        };
        // Fixed-length digests keep the comparison time independent of the input
        let presented: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        presented
            .iter()
            .zip(self.digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Authenticator for an optional secret
pub fn from_secret(secret: Option<&str>) -> Arc<dyn Authenticator> {
    match secret {
        Some(secret) => Arc::new(SharedSecret::new(secret)),
        None => Arc::new(AllowAll),
    }
}

/// Token from `Authorization: Bearer ...` (scheme is case-insensitive)
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Query parameters carrying a token
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: Option<String>,
}

impl TokenQuery {
    /// Decoded `token` parameter, empty treated as absent
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|token| !token.is_empty())
    }
}

/// Percent-decoded `token` parameter of a request URI
///
/// A query string that does not parse yields no token.
pub fn query_token(uri: &Uri) -> Option<String> {
    let Query(query) = Query::<TokenQuery>::try_from_uri(uri).ok()?;
    query.token().map(str::to_owned)
}

/// Header token first, then the query parameter
pub fn request_token<'a>(headers: &'a HeaderMap, query: Option<&'a str>) -> Option<&'a str> {
    bearer_token(headers).or(query)
}

/// Authenticator plus failure accounting, shared by the HTTP surfaces
#[derive(Clone)]
pub struct AuthGate {
    authenticator: Arc<dyn Authenticator>,
    metrics: Arc<MetricsRecorder>,
}

impl AuthGate {
    pub fn new(authenticator: Arc<dyn Authenticator>, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            authenticator,
            metrics,
        }
    }

    /// Check a request's credentials, counting failures
    ///
    /// `query_token` is the already decoded `token` query parameter.
    pub fn check(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        if self.authenticator.is_open() {
            return true;
        }
        let allowed = self
            .authenticator
            .authenticate(request_token(headers, query_token));
        if !allowed {
            self.metrics.auth_failures.inc();
            debug!("Authentication failed");
        }
        allowed
    }

    pub fn is_open(&self) -> bool {
        self.authenticator.is_open()
    }
}

/// axum middleware rejecting unauthenticated requests with 401
pub async fn require_auth(State(gate): State<AuthGate>, request: Request, next: Next) -> Response {
    let token = query_token(request.uri());
    if !gate.check(request.headers(), token.as_deref()) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    next.run(request).await
}
