//! Shared test utilities for the token bridge.
//!
//! Feature-gated behind `testutil` so it never leaks into production builds.
//!
//! ```ignore
//! // Requires the `testutil` feature to be enabled.
//! use calcplane_oauth::testutil::{StaticTokenValidator, pkce_pair};
//!
//! let validator = StaticTokenValidator::new().with_token("cpt_0123456789abcdef", "alice", ["service:tax"]);
//! let (verifier, challenge) = pkce_pair();
//! ```

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use calcplane_storage::StorageError;
use parking_lot::RwLock;

use crate::{
    pkce::challenge_for,
    token::{InternalTokenInfo, InternalTokenValidator},
};

/// An [`InternalTokenValidator`] over a fixed in-memory table.
#[derive(Debug, Default)]
pub struct StaticTokenValidator {
    tokens: RwLock<HashMap<String, InternalTokenInfo>>,
    lookups: AtomicU64,
}

impl StaticTokenValidator {
    /// Creates an empty validator; every token is unknown.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an active token.
    #[must_use]
    pub fn with_token<'a>(
        self,
        token: &str,
        user_id: &str,
        scopes: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        self.tokens.write().insert(
            token.to_owned(),
            InternalTokenInfo {
                user_id: user_id.to_owned(),
                scopes: scopes.into_iter().map(str::to_owned).collect(),
                active: true,
            },
        );
        self
    }

    /// Adds a known but inactive token.
    #[must_use]
    pub fn with_inactive(self, token: &str, user_id: &str) -> Self {
        self.tokens.write().insert(
            token.to_owned(),
            InternalTokenInfo { user_id: user_id.to_owned(), scopes: Default::default(), active: false },
        );
        self
    }

    /// Marks a token inactive.
    pub fn deactivate(&self, token: &str) {
        if let Some(info) = self.tokens.write().get_mut(token) {
            info.active = false;
        }
    }

    /// Number of lookups served.
    #[must_use]
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl InternalTokenValidator for StaticTokenValidator {
    async fn lookup(&self, token: &str) -> Result<Option<InternalTokenInfo>, StorageError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.tokens.read().get(token).cloned())
    }
}

/// Generates a fresh `(code_verifier, code_challenge)` pair.
#[must_use]
pub fn pkce_pair() -> (String, String) {
    let bytes: [u8; 32] = rand::random();
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = challenge_for(&verifier);
    (verifier, challenge)
}
