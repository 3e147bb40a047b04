//! Axum HTTP surface for the token bridge.
//!
//! | Route | Body | Success |
//! |-------|------|---------|
//! | `POST /oauth/authorize` | JSON [`AuthorizeRequest`] | 200 `{code, expires_in}` |
//! | `POST /oauth/token` | JSON or form [`TokenRequest`] | 200 `{access_token, token_type, expires_in, scope}` |
//! | `POST /oauth/register` | JSON [`ClientRegistration`] | 201 [`RegisteredClient`] |
//! | `POST /oauth/revoke` | JSON or form `{token}` | 200, also for unknown tokens |
//! | `GET /.well-known/oauth-authorization-server` | | 200 [`ServerMetadata`] |
//!
//! Failures use the OAuth error body `{error, error_description}`. Every
//! POST route is rate limited per caller address before the body is read;
//! rejected calls get 429 with `Retry-After`. The address is the first
//! `X-Forwarded-For` hop, else the peer address when the router is served
//! with [`ConnectInfo`](axum::extract::ConnectInfo).
//!
//! [`RegisteredClient`]: crate::client::RegisteredClient

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode, header, request::Parts},
    response::IntoResponse,
    routing::{get, post},
};
use calcplane_control::{FixedWindowLimiter, RateLimiter};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    bridge::{AuthorizeRequest, TokenBridge, TokenRequest},
    client::ClientRegistration,
    error::{OAuthError, Result},
};

/// Header consulted first for the caller's address.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Largest request body accepted by any route.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct OAuthState {
    bridge: Arc<TokenBridge>,
    limiter: Arc<dyn RateLimiter>,
}

impl std::fmt::Debug for OAuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthState").field("bridge", &self.bridge).finish_non_exhaustive()
    }
}

impl OAuthState {
    /// Creates state with an in-process rate limiter that prunes ended
    /// windows at the bridge's configured interval.
    #[must_use]
    pub fn new(bridge: Arc<TokenBridge>) -> Self {
        let limiter = FixedWindowLimiter::from_config(bridge.config().rate_limit());
        Self { bridge, limiter: Arc::new(limiter) }
    }

    /// Replaces the rate limiter, e.g. with a store-backed one shared by
    /// every process.
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Counts the call against the caller's budget, then reads the body.
    async fn admit(&self, endpoint: &str, request: Request) -> Result<(HeaderMap, Bytes)> {
        let (parts, body) = request.into_parts();
        self.check_rate(endpoint, &caller(&parts)).await?;
        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|err| OAuthError::invalid_request(format!("unreadable body: {err}")))?;
        Ok((parts.headers, body))
    }

    async fn check_rate(&self, endpoint: &str, caller: &str) -> Result<()> {
        let config = self.bridge.config().rate_limit();
        let decision = self
            .limiter
            .check(&format!("oauth:{endpoint}:{caller}"), config.window(), config.max_requests())
            .await?;
        debug!(endpoint, remaining = decision.remaining, "rate limit checked");
        Ok(())
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn caller(parts: &Parts) -> String {
    if let Some(forwarded) = forwarded_for(&parts.headers) {
        return forwarded.to_owned();
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "anonymous".to_owned(), |ConnectInfo(addr)| addr.ip().to_string())
}

/// Authorization server metadata (RFC 8414).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetadata {
    /// Issuer URL.
    pub issuer: String,
    /// Authorization endpoint.
    pub authorization_endpoint: String,
    /// Token endpoint.
    pub token_endpoint: String,
    /// Dynamic registration endpoint.
    pub registration_endpoint: String,
    /// Revocation endpoint.
    pub revocation_endpoint: String,
    /// Always `["code"]`.
    pub response_types_supported: Vec<String>,
    /// Always `["authorization_code"]`.
    pub grant_types_supported: Vec<String>,
    /// Always `["S256"]`.
    pub code_challenge_methods_supported: Vec<String>,
    /// Always `["none"]`.
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

impl ServerMetadata {
    /// Metadata for an issuer base URL.
    #[must_use]
    pub fn for_issuer(issuer: &str) -> Self {
        let issuer = issuer.trim_end_matches('/');
        Self {
            issuer: issuer.to_owned(),
            authorization_endpoint: format!("{issuer}/oauth/authorize"),
            token_endpoint: format!("{issuer}/oauth/token"),
            registration_endpoint: format!("{issuer}/oauth/register"),
            revocation_endpoint: format!("{issuer}/oauth/revoke"),
            response_types_supported: vec!["code".into()],
            grant_types_supported: vec!["authorization_code".into()],
            code_challenge_methods_supported: vec!["S256".into()],
            token_endpoint_auth_methods_supported: vec!["none".into()],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RevocationRequest {
    #[serde(default)]
    token: Option<String>,
}

/// Creates the OAuth router.
pub fn oauth_router(state: OAuthState) -> Router {
    Router::new()
        .route("/oauth/authorize", post(authorize))
        .route("/oauth/token", post(token))
        .route("/oauth/register", post(register))
        .route("/oauth/revoke", post(revoke))
        .route("/.well-known/oauth-authorization-server", get(metadata))
        .with_state(state)
}

/// Decodes a form body when the content type says so, JSON otherwise.
fn decode_body<T: DeserializeOwned>(headers: &HeaderMap, body: &[u8]) -> Result<T> {
    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    if is_form {
        serde_urlencoded::from_bytes(body)
            .map_err(|err| OAuthError::invalid_request(format!("malformed form body: {err}")))
    } else {
        serde_json::from_slice(body)
            .map_err(|err| OAuthError::invalid_request(format!("malformed JSON body: {err}")))
    }
}

async fn authorize(State(state): State<OAuthState>, request: Request) -> Result<impl IntoResponse> {
    let (headers, body) = state.admit("authorize", request).await?;
    let request: AuthorizeRequest = decode_body(&headers, &body)?;
    Ok(Json(state.bridge.authorize(&request).await?))
}

async fn token(State(state): State<OAuthState>, request: Request) -> Result<impl IntoResponse> {
    let (headers, body) = state.admit("token", request).await?;
    let request: TokenRequest = decode_body(&headers, &body)?;
    let response = state.bridge.exchange(&request).await?;
    Ok(([(header::CACHE_CONTROL, "no-store")], Json(response)))
}

async fn register(State(state): State<OAuthState>, request: Request) -> Result<impl IntoResponse> {
    let (_, body) = state.admit("register", request).await?;
    let registration: ClientRegistration = serde_json::from_slice(&body)
        .map_err(|err| OAuthError::InvalidClientMetadata(format!("malformed JSON body: {err}")))?;
    let client = state.bridge.clients().register(registration).await?;
    Ok((StatusCode::CREATED, Json(client)))
}

async fn revoke(State(state): State<OAuthState>, request: Request) -> Result<impl IntoResponse> {
    let (headers, body) = state.admit("revoke", request).await?;
    let request: RevocationRequest = decode_body(&headers, &body)?;
    let Some(token) = request.token.filter(|t| !t.is_empty()) else {
        return Err(OAuthError::invalid_request("token is required"));
    };
    state.bridge.revoke(&token).await?;
    Ok(StatusCode::OK)
}

async fn metadata(State(state): State<OAuthState>) -> Json<ServerMetadata> {
    Json(ServerMetadata::for_issuer(state.bridge.config().issuer()))
}
