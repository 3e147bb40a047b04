//! Internal token validation collaborator.
//!
//! Internal tokens are the long-lived API tokens users already hold. The
//! bridge never interprets them; it asks an [`InternalTokenValidator`]
//! whether each one is active, who owns it, and which resource scopes it
//! grants.

use std::collections::BTreeSet;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use calcplane_storage::StorageError;
use zeroize::Zeroizing;

/// Shortest internal token the bridge will forward to the validator.
pub const MIN_INTERNAL_TOKEN_LEN: usize = 16;

/// Longest internal token the bridge will forward to the validator.
pub const MAX_INTERNAL_TOKEN_LEN: usize = 256;

/// What the validator knows about one internal token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalTokenInfo {
    /// Owning user.
    pub user_id: String,
    /// Resource scopes the token grants.
    pub scopes: BTreeSet<String>,
    /// `false` once the token has been revoked or has expired.
    pub active: bool,
}

/// Looks up internal tokens.
#[async_trait]
pub trait InternalTokenValidator: Send + Sync {
    /// Returns the token's metadata, or `None` if the token is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backing store cannot be reached.
    async fn lookup(&self, token: &str) -> Result<Option<InternalTokenInfo>, StorageError>;
}

/// Cheap syntactic check applied before any lookup.
#[must_use]
pub fn is_well_formed(token: &str) -> bool {
    (MIN_INTERNAL_TOKEN_LEN..=MAX_INTERNAL_TOKEN_LEN).contains(&token.len())
        && token.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Mints an unguessable identifier: `prefix` followed by 32 random bytes,
/// base64url-encoded.
pub(crate) fn mint(prefix: &str) -> String {
    let bytes: Zeroizing<[u8; 32]> = Zeroizing::new(rand::random());
    format!("{prefix}{}", URL_SAFE_NO_PAD.encode(&bytes[..]))
}

/// First characters of a secret, for log lines.
#[must_use]
pub fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(6).collect();
    format!("{prefix}…")
}
