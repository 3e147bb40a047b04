//! OAuth error types and their wire representation.
//!
//! Every [`OAuthError`] maps to a stable `error` code and an HTTP status:
//!
//! | Variant | `error` | Status |
//! |---------|---------|--------|
//! | [`InvalidRequest`](OAuthError::InvalidRequest) | `invalid_request` | 400 |
//! | [`InvalidClient`](OAuthError::InvalidClient) | `invalid_client` | 401 |
//! | [`InvalidGrant`](OAuthError::InvalidGrant) | `invalid_grant` | 400 |
//! | [`UnsupportedGrantType`](OAuthError::UnsupportedGrantType) | `unsupported_grant_type` | 400 |
//! | [`InvalidRedirectUri`](OAuthError::InvalidRedirectUri) | `invalid_redirect_uri` | 400 |
//! | [`InvalidClientMetadata`](OAuthError::InvalidClientMetadata) | `invalid_client_metadata` | 400 |
//! | [`RateLimited`](OAuthError::RateLimited) | `rate_limited` | 429 |
//! | [`ServerError`](OAuthError::ServerError) | `server_error` | 500 |
//!
//! Server errors keep their cause for logging but never serialize it.

use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use calcplane_control::{ConfigError, ControlError};
use calcplane_storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// Result alias for bridge operations.
pub type Result<T> = std::result::Result<T, OAuthError>;

/// Errors raised by the token bridge and its HTTP surface.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OAuthError {
    /// The request is missing a parameter or carries a malformed one.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Client authentication failed or the client is unknown.
    #[error("Invalid client: {0}")]
    InvalidClient(String),

    /// The authorization code is invalid, expired, already used, or was
    /// issued to someone else.
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    /// Only `authorization_code` is accepted.
    #[error("Unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    /// A redirect URI offered at registration is not allowed.
    #[error("Invalid redirect URI: {0}")]
    InvalidRedirectUri(String),

    /// Registration metadata other than redirect URIs was rejected.
    #[error("Invalid client metadata: {0}")]
    InvalidClientMetadata(String),

    /// The caller exhausted its request budget.
    #[error("Rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited {
        /// Time until the current window resets.
        retry_after: Duration,
    },

    /// An internal failure. The message is logged, never returned to callers.
    #[error("Server error: {message}")]
    ServerError {
        /// Internal description.
        message: String,
        /// Underlying store failure, if any.
        #[source]
        source: Option<StorageError>,
    },
}

impl OAuthError {
    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Creates a new `InvalidGrant` error.
    #[must_use]
    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self::InvalidGrant(message.into())
    }

    /// Creates a new `ServerError` without a source.
    #[must_use]
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::ServerError { message: message.into(), source: None }
    }

    /// Stable wire code for the `error` field.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidClient(_) => "invalid_client",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::InvalidRedirectUri(_) => "invalid_redirect_uri",
            Self::InvalidClientMetadata(_) => "invalid_client_metadata",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidClient(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ServerError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Human-readable text that is safe to return to the caller.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::InvalidRequest(msg)
            | Self::InvalidClient(msg)
            | Self::InvalidGrant(msg)
            | Self::UnsupportedGrantType(msg)
            | Self::InvalidRedirectUri(msg)
            | Self::InvalidClientMetadata(msg) => msg.clone(),
            Self::RateLimited { retry_after } => {
                format!("too many requests, retry after {}s", retry_after_secs(*retry_after))
            },
            Self::ServerError { .. } => "internal server error".to_owned(),
        }
    }

    /// Status and JSON body for this error.
    #[must_use]
    pub fn to_status_and_payload(&self) -> (StatusCode, OAuthErrorResponse) {
        (
            self.status(),
            OAuthErrorResponse {
                error: self.error_code().to_owned(),
                error_description: self.description(),
            },
        )
    }
}

/// Whole seconds for a `Retry-After` header, never zero.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 { secs + 1 } else { secs.max(1) }
}

/// OAuth-style error body: `{"error": ..., "error_description": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthErrorResponse {
    /// Stable error code.
    pub error: String,
    /// Human-readable detail.
    pub error_description: String,
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        if let Self::ServerError { message, source } = &self {
            error!(error = %message, source = ?source, "oauth request failed");
        }
        let (status, payload) = self.to_status_and_payload();
        let mut response = (status, Json(payload)).into_response();
        if let Self::RateLimited { retry_after } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
        }
        response
    }
}

impl From<StorageError> for OAuthError {
    fn from(err: StorageError) -> Self {
        Self::ServerError { message: "store operation failed".to_owned(), source: Some(err) }
    }
}

impl From<ControlError> for OAuthError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::RateLimitExceeded { retry_after, .. } => Self::RateLimited { retry_after },
            ControlError::Storage(source) => source.into(),
            other => Self::server_error(other.to_string()),
        }
    }
}

impl From<ConfigError> for OAuthError {
    fn from(err: ConfigError) -> Self {
        Self::server_error(err.to_string())
    }
}
