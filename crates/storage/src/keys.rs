//! Key builders for every namespace the control plane writes into the
//! shared store.
//!
//! Centralizing the layout keeps producers and consumers of a key in
//! agreement and makes the shared keyspace auditable in one place.

/// Distributed lock key for a resource.
#[must_use]
pub fn lock(resource_key: &str) -> String {
    format!("lock:{resource_key}")
}

/// Optimistic version counter for a resource.
#[must_use]
pub fn version(resource_key: &str) -> String {
    format!("version:{resource_key}")
}

/// Shared-tier result cache entry.
#[must_use]
pub fn result(fingerprint: &str) -> String {
    format!("result:{fingerprint}")
}

/// Blob-tier result URL.
#[must_use]
pub fn result_blob(fingerprint: &str) -> String {
    format!("results/{fingerprint}.bin")
}

/// Fixed-window rate limit counter.
#[must_use]
pub fn rate_limit(identifier: &str, window_start_ms: i64) -> String {
    format!("ratelimit:{identifier}:{window_start_ms}")
}

/// Authorization code record (hash).
#[must_use]
pub fn oauth_code(code: &str) -> String {
    format!("oauth:code:{code}")
}

/// Internal tokens bound to an authorization code (set).
#[must_use]
pub fn oauth_code_tokens(code: &str) -> String {
    format!("oauth:code:{code}:tokens")
}

/// Bridge access token record (hash).
#[must_use]
pub fn oauth_access_token(token: &str) -> String {
    format!("oauth:access:{token}")
}

/// Bridge access tokens issued to a user (set).
#[must_use]
pub fn oauth_user_tokens(user_id: &str) -> String {
    format!("oauth:user:{user_id}:access")
}

/// Dynamically registered client record.
#[must_use]
pub fn oauth_client(client_id: &str) -> String {
    format!("oauth:client:{client_id}")
}
