//! OAuth authorization-code bridge onto calcplane internal tokens.
//!
//! Third-party agents speak OAuth 2.1 (authorization code + PKCE). Users
//! already hold long-lived internal API tokens. The bridge lets a user
//! delegate a set of internal tokens to an agent without the agent ever
//! seeing them:
//!
//! ```text
//!  user ── tokens[] ──▶ POST /oauth/authorize ──▶ code (10 min, one use)
//!  agent ── code + verifier ──▶ POST /oauth/token ──▶ bridge access token
//!  agent ── bridge token ──▶ API ──▶ TokenBridge::resolve ──▶ internal tokens
//! ```
//!
//! All state lives in the shared [`KvStore`](calcplane_storage::KvStore), so
//! any process can finish an exchange another process started.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use calcplane_oauth::{BridgeConfig, InternalTokenValidator, OAuthState, TokenBridge, oauth_router};
//! use calcplane_storage::MemoryStore;
//!
//! # async fn example(validator: Arc<dyn InternalTokenValidator>) -> Result<(), Box<dyn std::error::Error>> {
//! let bridge = TokenBridge::new(Arc::new(MemoryStore::new()), validator, BridgeConfig::default())?;
//! let app = oauth_router(OAuthState::new(Arc::new(bridge)));
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables [`testutil`] (static token validator, PKCE pairs).
//! - **`failpoints`**: Activates `fail` fail points for fault-injection tests.

#![deny(unsafe_code)]

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod pkce;
pub mod scope;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
pub mod token;

pub use bridge::{
    AccessTokenResponse, AuthorizationGrant, AuthorizeRequest, ResolvedToken, TokenBridge,
    TokenRequest,
};
pub use client::{ClientRegistration, ClientRegistry, RedirectPolicy, RegisteredClient};
pub use config::{BridgeConfig, StaticClient};
pub use error::{OAuthError, OAuthErrorResponse, Result};
pub use http::{OAuthState, ServerMetadata, oauth_router};
pub use pkce::CodeChallengeMethod;
pub use scope::Scope;
pub use token::{InternalTokenInfo, InternalTokenValidator};
