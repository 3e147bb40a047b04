//! OAuth client registry: dynamic registration (RFC 7591 subset), static
//! clients and redirect URI checks.
//!
//! A redirect URI presented at authorization is accepted when:
//!
//! 1. the client is static and lists the URI exactly, or
//! 2. the client was registered dynamically and lists the URI exactly, or
//! 3. the client is unknown and the URI matches an allowed pattern.
//!
//! Registrations expire after the configured TTL and must be renewed by
//! registering again.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use calcplane_control::{Clock, ConfigError, SystemClock};
use calcplane_storage::{KvStore, keys};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    config::BridgeConfig,
    error::{OAuthError, Result},
    token::mint,
};

/// Maximum redirect URIs per registration.
pub const MAX_REDIRECT_URIS: usize = 10;

/// Maximum length of a single redirect URI.
pub const MAX_REDIRECT_URI_LEN: usize = 2048;

/// Maximum length of `client_name`.
pub const MAX_CLIENT_NAME_LEN: usize = 200;

const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
const AUTH_METHOD_NONE: &str = "none";

// ---------------------------------------------------------------------------
// Redirect policy
// ---------------------------------------------------------------------------

/// Compiled redirect URI allow-list.
#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    patterns: Vec<Regex>,
}

impl RedirectPolicy {
    /// Compiles glob patterns where `*` matches any run of characters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a pattern is not an `http://` or
    /// `https://` pattern.
    pub fn compile(patterns: &[String]) -> std::result::Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                if !pattern.starts_with("https://") && !pattern.starts_with("http://") {
                    return Err(invalid_pattern(pattern, "must start with http:// or https://"));
                }
                let body: Vec<String> = pattern.split('*').map(regex::escape).collect();
                Regex::new(&format!("^{}$", body.join(".*")))
                    .map_err(|err| invalid_pattern(pattern, &err.to_string()))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Returns `true` if `uri` is structurally safe and matches a pattern.
    #[must_use]
    pub fn allows(&self, uri: &str) -> bool {
        is_safe_uri(uri) && self.patterns.iter().any(|re| re.is_match(uri))
    }
}

fn invalid_pattern(pattern: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: "allowed_redirect_patterns",
        reason: format!("{pattern}: {reason}"),
    }
}

/// Rejects URIs a glob could otherwise be tricked into accepting: userinfo
/// (`http://localhost:1@evil.example`), fragments, whitespace and empty hosts.
fn is_safe_uri(uri: &str) -> bool {
    if uri.len() > MAX_REDIRECT_URI_LEN
        || uri.contains('#')
        || uri.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return false;
    }
    let Some((_, rest)) = uri.split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    !authority.is_empty() && !authority.contains('@') && !authority.starts_with(':')
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Dynamic registration request body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientRegistration {
    /// Display name.
    #[serde(default)]
    pub client_name: Option<String>,
    /// Redirect URIs the client will use.
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Requested grant types; only `authorization_code` is supported.
    #[serde(default)]
    pub grant_types: Option<Vec<String>>,
    /// Token endpoint authentication; only `none` (public PKCE clients).
    #[serde(default)]
    pub token_endpoint_auth_method: Option<String>,
}

/// A dynamically registered client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredClient {
    /// Minted client identifier.
    pub client_id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Exact redirect URIs this client may use.
    pub redirect_uris: Vec<String>,
    /// Granted grant types.
    pub grant_types: Vec<String>,
    /// Token endpoint authentication method.
    pub token_endpoint_auth_method: String,
    /// Unix seconds of registration.
    pub client_id_issued_at: i64,
    /// Unix seconds after which the registration is gone.
    pub expires_at: i64,
}

impl RegisteredClient {
    fn to_fields(&self) -> Result<BTreeMap<String, String>> {
        let mut fields = BTreeMap::new();
        if let Some(name) = &self.client_name {
            fields.insert("client_name".to_owned(), name.clone());
        }
        fields.insert("redirect_uris".to_owned(), encode_list(&self.redirect_uris)?);
        fields.insert("grant_types".to_owned(), encode_list(&self.grant_types)?);
        fields.insert(
            "token_endpoint_auth_method".to_owned(),
            self.token_endpoint_auth_method.clone(),
        );
        fields.insert("client_id_issued_at".to_owned(), self.client_id_issued_at.to_string());
        fields.insert("expires_at".to_owned(), self.expires_at.to_string());
        Ok(fields)
    }

    fn from_fields(client_id: &str, mut fields: BTreeMap<String, String>) -> Result<Self> {
        let mut take = |name: &str| {
            fields
                .remove(name)
                .ok_or_else(|| OAuthError::server_error(format!("client record missing {name}")))
        };
        let redirect_uris = decode_list(&take("redirect_uris")?)?;
        let grant_types = decode_list(&take("grant_types")?)?;
        let token_endpoint_auth_method = take("token_endpoint_auth_method")?;
        let client_id_issued_at = parse_i64(&take("client_id_issued_at")?)?;
        let expires_at = parse_i64(&take("expires_at")?)?;
        Ok(Self {
            client_id: client_id.to_owned(),
            client_name: fields.remove("client_name"),
            redirect_uris,
            grant_types,
            token_endpoint_auth_method,
            client_id_issued_at,
            expires_at,
        })
    }
}

pub(crate) fn encode_list(items: &[String]) -> Result<String> {
    serde_json::to_string(items).map_err(|err| OAuthError::server_error(err.to_string()))
}

pub(crate) fn decode_list(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|err| OAuthError::server_error(err.to_string()))
}

pub(crate) fn parse_i64(raw: &str) -> Result<i64> {
    raw.parse().map_err(|_| OAuthError::server_error(format!("malformed integer field {raw:?}")))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Client lookups and registration.
pub struct ClientRegistry {
    store: Arc<dyn KvStore>,
    policy: RedirectPolicy,
    static_clients: HashMap<String, Vec<String>>,
    registration_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("static_clients", &self.static_clients.len())
            .field("registration_ttl", &self.registration_ttl)
            .finish_non_exhaustive()
    }
}

impl ClientRegistry {
    /// Creates a registry over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a redirect pattern does not compile.
    pub fn new(
        store: Arc<dyn KvStore>,
        config: &BridgeConfig,
    ) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            store,
            policy: RedirectPolicy::compile(config.allowed_redirect_patterns())?,
            static_clients: config
                .static_clients()
                .iter()
                .map(|c| (c.client_id.clone(), c.redirect_uris.clone()))
                .collect(),
            registration_ttl: config.client_registration_ttl(),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replaces the clock used for registration timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns `true` if `client_id` is pre-provisioned.
    #[must_use]
    pub fn is_static(&self, client_id: &str) -> bool {
        self.static_clients.contains_key(client_id)
    }

    /// Registers a new public client.
    ///
    /// # Errors
    ///
    /// - [`OAuthError::InvalidRedirectUri`] if no URI is given, too many are
    ///   given, or one does not match the allowed patterns
    /// - [`OAuthError::InvalidClientMetadata`] for unsupported grant types,
    ///   authentication methods or an oversized name
    /// - [`OAuthError::ServerError`] if the store fails
    #[instrument(skip(self, registration), fields(redirect_uris = registration.redirect_uris.len()))]
    pub async fn register(&self, registration: ClientRegistration) -> Result<RegisteredClient> {
        if registration.redirect_uris.is_empty() {
            return Err(OAuthError::InvalidRedirectUri(
                "at least one redirect_uri is required".into(),
            ));
        }
        if registration.redirect_uris.len() > MAX_REDIRECT_URIS {
            return Err(OAuthError::InvalidRedirectUri(format!(
                "at most {MAX_REDIRECT_URIS} redirect_uris are allowed"
            )));
        }
        if let Some(bad) = registration.redirect_uris.iter().find(|uri| !self.policy.allows(uri)) {
            warn!(redirect_uri = %bad, "registration rejected: redirect URI not allowed");
            return Err(OAuthError::InvalidRedirectUri(format!("{bad} is not allowed")));
        }
        if registration.client_name.as_ref().is_some_and(|n| n.chars().count() > MAX_CLIENT_NAME_LEN)
        {
            return Err(OAuthError::InvalidClientMetadata(format!(
                "client_name exceeds {MAX_CLIENT_NAME_LEN} characters"
            )));
        }
        let grant_types =
            registration.grant_types.unwrap_or_else(|| vec![GRANT_AUTHORIZATION_CODE.to_owned()]);
        if grant_types.is_empty() || grant_types.iter().any(|g| g != GRANT_AUTHORIZATION_CODE) {
            return Err(OAuthError::InvalidClientMetadata(
                "only the authorization_code grant is supported".into(),
            ));
        }
        let auth_method =
            registration.token_endpoint_auth_method.unwrap_or_else(|| AUTH_METHOD_NONE.to_owned());
        if auth_method != AUTH_METHOD_NONE {
            return Err(OAuthError::InvalidClientMetadata(
                "only public clients (token_endpoint_auth_method=none) are supported".into(),
            ));
        }

        let issued_at = self.clock.now_ms() / 1000;
        let ttl_secs = i64::try_from(self.registration_ttl.as_secs()).unwrap_or(i64::MAX);
        let client = RegisteredClient {
            client_id: mint("cpc_"),
            client_name: registration.client_name,
            redirect_uris: registration.redirect_uris,
            grant_types,
            token_endpoint_auth_method: auth_method,
            client_id_issued_at: issued_at,
            expires_at: issued_at.saturating_add(ttl_secs),
        };
        self.store
            .hash_set_all(
                &keys::oauth_client(&client.client_id),
                client.to_fields()?,
                Some(self.registration_ttl),
            )
            .await?;

        info!(
            audit.action = "register_client",
            audit.resource = %client.client_id,
            audit.result = "success",
            "audit_event"
        );
        Ok(client)
    }

    /// Loads a dynamically registered client.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::ServerError`] if the store fails or the record
    /// is malformed.
    pub async fn get(&self, client_id: &str) -> Result<Option<RegisteredClient>> {
        let fields = self.store.hash_get_all(&keys::oauth_client(client_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        RegisteredClient::from_fields(client_id, fields).map(Some)
    }

    /// Checks that `redirect_uri` may be used by `client_id`.
    ///
    /// # Errors
    ///
    /// - [`OAuthError::InvalidRequest`] if either value is missing or the URI
    ///   is not allowed for the client
    /// - [`OAuthError::ServerError`] if the store fails
    pub async fn check_redirect(&self, client_id: &str, redirect_uri: &str) -> Result<()> {
        if client_id.is_empty() {
            return Err(OAuthError::invalid_request("client_id is required"));
        }
        if redirect_uri.is_empty() {
            return Err(OAuthError::invalid_request("redirect_uri is required"));
        }

        let allowed = if let Some(uris) = self.static_clients.get(client_id) {
            uris.iter().any(|uri| uri == redirect_uri)
        } else if let Some(client) = self.get(client_id).await? {
            client.redirect_uris.iter().any(|uri| uri == redirect_uri)
        } else {
            self.policy.allows(redirect_uri)
        };

        if !allowed {
            warn!(client_id, redirect_uri, "redirect URI rejected");
            return Err(OAuthError::invalid_request(
                "redirect_uri is not registered for this client",
            ));
        }
        Ok(())
    }
}
