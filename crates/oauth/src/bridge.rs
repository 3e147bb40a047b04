//! OAuth token bridge: authorization code + PKCE onto internal tokens.
//!
//! ```text
//!  authorize(tokens, client, redirect, challenge)
//!        │ validate tokens, redirect, challenge
//!        ▼
//!  CODE_ISSUED ── oauth:code:{code}         (hash, code_ttl)
//!        │        oauth:code:{code}:tokens  (set,  code_ttl)
//!        │
//!  exchange(code, client, redirect, verifier)
//!        │ claim: read record, then delete it (exactly one caller wins)
//!        │ verify client, redirect and PKCE on the claimed record
//!        ▼
//!  EXCHANGED ─── oauth:access:{token}       (hash, access_token_ttl)
//!                oauth:user:{user}:access   (set,  access_token_ttl)
//! ```
//!
//! The code is deleted before any verification runs, so a failed exchange
//! leaves nothing behind to retry against. A bridge access token carries no
//! permissions of its own; [`TokenBridge::resolve`] maps it back to the
//! internal tokens it stands for.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use calcplane_control::{Clock, ConfigError, SystemClock};
use calcplane_storage::{KvStore, StorageError, keys};
use chrono::{DateTime, Utc};
use fail::fail_point;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    client::{ClientRegistry, decode_list, encode_list, parse_i64},
    config::BridgeConfig,
    error::{OAuthError, Result},
    pkce::{self, CodeChallengeMethod},
    scope::Scope,
    token::{InternalTokenValidator, is_well_formed, mint, redact},
};

/// Most internal tokens one authorization may bundle.
pub const MAX_TOKENS_PER_AUTHORIZATION: usize = 20;

/// The only grant type the token endpoint accepts.
pub const GRANT_TYPE_AUTHORIZATION_CODE: &str = "authorization_code";

const CODE_PREFIX: &str = "cpac_";
const ACCESS_TOKEN_PREFIX: &str = "cpat_";

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// Body of `POST /oauth/authorize`.
#[derive(Clone, Default, Deserialize)]
pub struct AuthorizeRequest {
    /// Requesting client.
    #[serde(default)]
    pub client_id: String,
    /// Where the client expects the code to be delivered.
    #[serde(default)]
    pub redirect_uri: String,
    /// Optional narrowing of the granted scope.
    #[serde(default)]
    pub scope: Option<String>,
    /// PKCE challenge.
    #[serde(default)]
    pub code_challenge: String,
    /// PKCE method, `S256` when omitted.
    #[serde(default)]
    pub code_challenge_method: Option<String>,
    /// Internal tokens the user is delegating.
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Opaque client state, echoed back.
    #[serde(default)]
    pub state: Option<String>,
}

impl fmt::Debug for AuthorizeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizeRequest")
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .field("scope", &self.scope)
            .field("code_challenge_method", &self.code_challenge_method)
            .field("tokens", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

/// A freshly issued authorization code.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationGrant {
    /// One-time authorization code.
    pub code: String,
    /// Seconds until the code expires.
    pub expires_in: u64,
    /// State echoed from the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl fmt::Debug for AuthorizationGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationGrant")
            .field("code", &redact(&self.code))
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// Body of `POST /oauth/token`, JSON or form-encoded.
#[derive(Clone, Default, Deserialize)]
pub struct TokenRequest {
    /// Must be `authorization_code`.
    #[serde(default)]
    pub grant_type: Option<String>,
    /// Code from the authorize step.
    #[serde(default)]
    pub code: Option<String>,
    /// Must equal the authorize step's `client_id`.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Must equal the authorize step's `redirect_uri`.
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// PKCE verifier.
    #[serde(default)]
    pub code_verifier: Option<String>,
}

impl fmt::Debug for TokenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRequest")
            .field("grant_type", &self.grant_type)
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

/// Successful token endpoint response.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenResponse {
    /// Bridge access token.
    pub access_token: String,
    /// Always `Bearer`.
    pub token_type: String,
    /// Seconds until the token expires.
    pub expires_in: u64,
    /// Granted scope, space-delimited.
    pub scope: String,
}

impl fmt::Debug for AccessTokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenResponse")
            .field("access_token", &redact(&self.access_token))
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// What a bridge access token stands for.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedToken {
    /// The bridge access token.
    pub access_token: String,
    /// Internal tokens to evaluate permissions against.
    pub internal_tokens: Vec<String>,
    /// Client the token was issued to.
    pub client_id: String,
    /// Owner of the first internal token at authorization time.
    pub user_id: String,
    /// Granted scope.
    pub scope: Scope,
    /// Issue time.
    pub issued_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Remaining lifetime at resolution time.
    pub expires_in: Duration,
}

impl fmt::Debug for ResolvedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedToken")
            .field("access_token", &redact(&self.access_token))
            .field("internal_tokens", &self.internal_tokens.len())
            .field("client_id", &self.client_id)
            .field("user_id", &self.user_id)
            .field("scope", &self.scope.to_string())
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Stored records
// ---------------------------------------------------------------------------

fn take(fields: &mut BTreeMap<String, String>, name: &str) -> Result<String> {
    fields.remove(name).ok_or_else(|| {
        OAuthError::from(StorageError::serialization(format!("bridge record missing {name}")))
    })
}

struct CodeRecord {
    client_id: String,
    redirect_uri: String,
    code_challenge: String,
    method: CodeChallengeMethod,
    scope: String,
    user_id: String,
    expires_at_ms: i64,
}

impl CodeRecord {
    fn into_fields(self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("client_id".to_owned(), self.client_id),
            ("redirect_uri".to_owned(), self.redirect_uri),
            ("code_challenge".to_owned(), self.code_challenge),
            ("code_challenge_method".to_owned(), self.method.as_str().to_owned()),
            ("scope".to_owned(), self.scope),
            ("user_id".to_owned(), self.user_id),
            ("expires_at_ms".to_owned(), self.expires_at_ms.to_string()),
        ])
    }

    fn from_fields(mut fields: BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            client_id: take(&mut fields, "client_id")?,
            redirect_uri: take(&mut fields, "redirect_uri")?,
            code_challenge: take(&mut fields, "code_challenge")?,
            method: take(&mut fields, "code_challenge_method")?.parse()?,
            scope: take(&mut fields, "scope")?,
            user_id: take(&mut fields, "user_id")?,
            expires_at_ms: parse_i64(&take(&mut fields, "expires_at_ms")?)?,
        })
    }
}

struct AccessRecord {
    client_id: String,
    user_id: String,
    scope: String,
    internal_tokens: Vec<String>,
    issued_at_ms: i64,
    expires_at_ms: i64,
}

impl AccessRecord {
    fn into_fields(self) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::from([
            ("client_id".to_owned(), self.client_id),
            ("user_id".to_owned(), self.user_id),
            ("scope".to_owned(), self.scope),
            ("tokens".to_owned(), encode_list(&self.internal_tokens)?),
            ("issued_at_ms".to_owned(), self.issued_at_ms.to_string()),
            ("expires_at_ms".to_owned(), self.expires_at_ms.to_string()),
        ]))
    }

    fn from_fields(mut fields: BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            client_id: take(&mut fields, "client_id")?,
            user_id: take(&mut fields, "user_id")?,
            scope: take(&mut fields, "scope")?,
            internal_tokens: decode_list(&take(&mut fields, "tokens")?)?,
            issued_at_ms: parse_i64(&take(&mut fields, "issued_at_ms")?)?,
            expires_at_ms: parse_i64(&take(&mut fields, "expires_at_ms")?)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Issues authorization codes and bridge access tokens.
pub struct TokenBridge {
    store: Arc<dyn KvStore>,
    clients: ClientRegistry,
    validator: Arc<dyn InternalTokenValidator>,
    config: BridgeConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for TokenBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBridge")
            .field("clients", &self.clients)
            .field("code_ttl", &self.config.code_ttl())
            .field("access_token_ttl", &self.config.access_token_ttl())
            .finish_non_exhaustive()
    }
}

impl TokenBridge {
    /// Creates a bridge over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` does not validate.
    pub fn new(
        store: Arc<dyn KvStore>,
        validator: Arc<dyn InternalTokenValidator>,
        config: BridgeConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            clients: ClientRegistry::new(Arc::clone(&store), &config)?,
            store,
            validator,
            config,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replaces the clock used for issue and expiry timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clients = self.clients.with_clock(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// Client registry backing redirect checks.
    #[must_use]
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Validates an authorization request and issues a one-time code.
    ///
    /// The granted scope is the union of the internal tokens' scopes,
    /// narrowed to `scope` when one is requested. Tokens owned by different
    /// users may be mixed; the first token's owner becomes the owner of the
    /// resulting access token.
    ///
    /// # Errors
    ///
    /// - [`OAuthError::InvalidRequest`] if a token is missing, malformed or
    ///   inactive, the redirect URI is not allowed for the client, the PKCE
    ///   parameters are unsupported, or the requested scope is not granted
    /// - [`OAuthError::ServerError`] if the store or the validator fails
    #[instrument(skip(self, request), fields(client_id = %request.client_id, tokens = request.tokens.len()))]
    pub async fn authorize(&self, request: &AuthorizeRequest) -> Result<AuthorizationGrant> {
        let result = self.issue_code(request).await;
        if let Err(err) = &result {
            warn!(error_code = err.error_code(), "authorization rejected");
            info!(
                audit.action = "authorize",
                audit.resource = %request.client_id,
                audit.result = "failure",
                "audit_event"
            );
        }
        result
    }

    async fn issue_code(&self, request: &AuthorizeRequest) -> Result<AuthorizationGrant> {
        if request.tokens.is_empty() {
            return Err(OAuthError::invalid_request("at least one internal token is required"));
        }
        if request.tokens.len() > MAX_TOKENS_PER_AUTHORIZATION {
            return Err(OAuthError::invalid_request(format!(
                "at most {MAX_TOKENS_PER_AUTHORIZATION} tokens may be delegated at once"
            )));
        }
        if let Some(i) = request.tokens.iter().position(|t| !is_well_formed(t)) {
            return Err(OAuthError::invalid_request(format!("tokens[{i}] is malformed")));
        }
        let method = CodeChallengeMethod::from_param(request.code_challenge_method.as_deref())?;
        pkce::validate_challenge(&request.code_challenge, method)?;
        self.clients.check_redirect(&request.client_id, &request.redirect_uri).await?;

        let mut granted = Scope::default();
        let mut owner: Option<String> = None;
        for (i, token) in request.tokens.iter().enumerate() {
            match self.validator.lookup(token).await? {
                Some(info) if info.active => {
                    if owner.as_ref().is_some_and(|o| *o != info.user_id) {
                        debug!(index = i, "authorization mixes tokens from several users");
                    }
                    owner.get_or_insert(info.user_id);
                    granted.extend(info.scopes);
                },
                _ => {
                    return Err(OAuthError::invalid_request(format!(
                        "tokens[{i}] is invalid or inactive"
                    )));
                },
            }
        }
        let Some(user_id) = owner else {
            return Err(OAuthError::server_error("no token owner resolved"));
        };

        let scope = match request.scope.as_deref().map(Scope::parse) {
            Some(requested) if !requested.is_empty() => {
                let narrowed = granted.intersection(&requested);
                if narrowed.is_empty() {
                    return Err(OAuthError::invalid_request(
                        "requested scope is not granted by the presented tokens",
                    ));
                }
                narrowed
            },
            _ => granted,
        };

        let code = mint(CODE_PREFIX);
        let ttl = self.config.code_ttl();
        let expires_at_ms = self.clock.now_ms().saturating_add(duration_ms(ttl));

        // Tokens first: the code only becomes claimable once it is complete.
        let tokens_key = keys::oauth_code_tokens(&code);
        for token in &request.tokens {
            self.store.set_add(&tokens_key, token, Some(ttl)).await?;
        }
        let record = CodeRecord {
            client_id: request.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            code_challenge: request.code_challenge.clone(),
            method,
            scope: scope.to_string(),
            user_id,
            expires_at_ms,
        };
        self.store.hash_set_all(&keys::oauth_code(&code), record.into_fields(), Some(ttl)).await?;

        info!(
            audit.action = "authorize",
            audit.resource = %request.client_id,
            audit.result = "success",
            code = %redact(&code),
            "audit_event"
        );
        Ok(AuthorizationGrant { code, expires_in: ttl.as_secs(), state: request.state.clone() })
    }

    /// Exchanges a code and PKCE verifier for a bridge access token.
    ///
    /// The code is consumed before any check runs: whether the exchange
    /// succeeds or fails, the code cannot be presented again.
    ///
    /// # Errors
    ///
    /// - [`OAuthError::UnsupportedGrantType`] for any grant but `authorization_code`
    /// - [`OAuthError::InvalidRequest`] if a parameter is missing
    /// - [`OAuthError::InvalidGrant`] if the code is unknown, expired, already
    ///   used, or the client, redirect URI or verifier does not match
    /// - [`OAuthError::ServerError`] if the store fails
    #[instrument(skip(self, request), fields(client_id = request.client_id.as_deref().unwrap_or_default()))]
    pub async fn exchange(&self, request: &TokenRequest) -> Result<AccessTokenResponse> {
        let result = self.redeem(request).await;
        if let Err(err) = &result {
            warn!(error_code = err.error_code(), "token exchange rejected");
            info!(
                audit.action = "exchange_code",
                audit.resource = request.client_id.as_deref().unwrap_or_default(),
                audit.result = "failure",
                "audit_event"
            );
        }
        result
    }

    async fn redeem(&self, request: &TokenRequest) -> Result<AccessTokenResponse> {
        match request.grant_type.as_deref() {
            Some(GRANT_TYPE_AUTHORIZATION_CODE) => {},
            Some(other) => return Err(OAuthError::UnsupportedGrantType(other.to_owned())),
            None => return Err(OAuthError::invalid_request("grant_type is required")),
        }
        let code = required(request.code.as_deref(), "code")?;
        let client_id = required(request.client_id.as_deref(), "client_id")?;
        let redirect_uri = required(request.redirect_uri.as_deref(), "redirect_uri")?;
        let verifier = required(request.code_verifier.as_deref(), "code_verifier")?;

        fail_point!("bridge-before-code-consume", |_| {
            Err(StorageError::connection("injected bridge store failure").into())
        });

        let (record, internal_tokens) = self.claim(code).await?;

        if record.expires_at_ms <= self.clock.now_ms() {
            return Err(OAuthError::invalid_grant("authorization code has expired"));
        }
        if record.client_id != client_id {
            return Err(OAuthError::invalid_grant(
                "client_id does not match the authorization request",
            ));
        }
        if record.redirect_uri != redirect_uri {
            return Err(OAuthError::invalid_grant(
                "redirect_uri does not match the authorization request",
            ));
        }
        pkce::validate_verifier(verifier)?;
        if !pkce::verify(verifier, &record.code_challenge, record.method) {
            return Err(OAuthError::invalid_grant("code_verifier does not match code_challenge"));
        }
        if internal_tokens.is_empty() {
            return Err(OAuthError::invalid_grant("authorization code has expired"));
        }

        self.issue_access_token(record, internal_tokens).await
    }

    /// Takes the code record and its token list out of the store.
    ///
    /// `delete` reports whether this caller removed the record, so of two
    /// concurrent exchanges exactly one proceeds. A lookup failure returns
    /// before anything is deleted and leaves the code redeemable.
    async fn claim(&self, code: &str) -> Result<(CodeRecord, Vec<String>)> {
        let code_key = keys::oauth_code(code);
        let tokens_key = keys::oauth_code_tokens(code);

        let fields = self.store.hash_get_all(&code_key).await?;
        if fields.is_empty() {
            return Err(OAuthError::invalid_grant("authorization code is invalid or expired"));
        }
        if !self.store.delete(&code_key).await? {
            return Err(OAuthError::invalid_grant("authorization code has already been used"));
        }

        let tokens = self.store.set_members(&tokens_key).await;
        if let Err(err) = self.store.delete(&tokens_key).await {
            warn!(error = %err, "failed to discard authorization code tokens");
        }
        Ok((CodeRecord::from_fields(fields)?, tokens?))
    }

    async fn issue_access_token(
        &self,
        record: CodeRecord,
        internal_tokens: Vec<String>,
    ) -> Result<AccessTokenResponse> {
        let access_token = mint(ACCESS_TOKEN_PREFIX);
        let ttl = self.config.access_token_ttl();
        let issued_at_ms = self.clock.now_ms();
        let client_id = record.client_id;
        let user_id = record.user_id;
        let scope = record.scope;

        let access = AccessRecord {
            client_id: client_id.clone(),
            user_id: user_id.clone(),
            scope: scope.clone(),
            internal_tokens,
            issued_at_ms,
            expires_at_ms: issued_at_ms.saturating_add(duration_ms(ttl)),
        };
        self.store
            .hash_set_all(&keys::oauth_access_token(&access_token), access.into_fields()?, Some(ttl))
            .await?;
        self.store.set_add(&keys::oauth_user_tokens(&user_id), &access_token, Some(ttl)).await?;

        info!(
            audit.action = "exchange_code",
            audit.resource = %client_id,
            audit.result = "success",
            user_id = %user_id,
            access_token = %redact(&access_token),
            "audit_event"
        );
        Ok(AccessTokenResponse {
            access_token,
            token_type: "Bearer".to_owned(),
            expires_in: ttl.as_secs(),
            scope,
        })
    }

    /// Maps a bridge access token to the internal tokens it stands for.
    ///
    /// Returns `Ok(None)` for unknown, revoked or expired tokens.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::ServerError`] if the store fails or the record
    /// is malformed.
    pub async fn resolve(&self, access_token: &str) -> Result<Option<ResolvedToken>> {
        let fields = self.store.hash_get_all(&keys::oauth_access_token(access_token)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let record = AccessRecord::from_fields(fields)?;
        let now_ms = self.clock.now_ms();
        if record.expires_at_ms <= now_ms {
            return Ok(None);
        }
        let remaining = u64::try_from(record.expires_at_ms - now_ms).unwrap_or(0);
        Ok(Some(ResolvedToken {
            access_token: access_token.to_owned(),
            internal_tokens: record.internal_tokens,
            client_id: record.client_id,
            user_id: record.user_id,
            scope: Scope::parse(&record.scope),
            issued_at: timestamp(record.issued_at_ms),
            expires_at: timestamp(record.expires_at_ms),
            expires_in: Duration::from_millis(remaining),
        }))
    }

    /// Revokes a bridge access token.
    ///
    /// Returns `true` if a live token was removed.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::ServerError`] if the store fails.
    pub async fn revoke(&self, access_token: &str) -> Result<bool> {
        let key = keys::oauth_access_token(access_token);
        let fields = self.store.hash_get_all(&key).await?;
        let removed = self.store.delete(&key).await?;
        if let Some(user_id) = fields.get("user_id") {
            self.store.set_remove(&keys::oauth_user_tokens(user_id), access_token).await?;
        }

        info!(
            audit.action = "revoke_token",
            audit.resource = %redact(access_token),
            audit.result = if removed { "success" } else { "not_found" },
            "audit_event"
        );
        Ok(removed)
    }

    /// Lists the live bridge tokens issued to `user_id`.
    ///
    /// Index entries whose token has expired or been revoked are dropped
    /// from the index as they are found.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::ServerError`] if the store fails.
    pub async fn tokens_for_user(&self, user_id: &str) -> Result<Vec<ResolvedToken>> {
        let index_key = keys::oauth_user_tokens(user_id);
        let mut live = Vec::new();
        for token in self.store.set_members(&index_key).await? {
            match self.resolve(&token).await? {
                Some(resolved) => live.push(resolved),
                None => {
                    self.store.set_remove(&index_key, &token).await?;
                },
            }
        }
        Ok(live)
    }

    /// Revokes every bridge token issued to `user_id`. Returns how many were
    /// live.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::ServerError`] if the store fails.
    pub async fn revoke_all_for_user(&self, user_id: &str) -> Result<usize> {
        let index_key = keys::oauth_user_tokens(user_id);
        let mut revoked = 0;
        for token in self.store.set_members(&index_key).await? {
            if self.store.delete(&keys::oauth_access_token(&token)).await? {
                revoked += 1;
            }
        }
        self.store.delete(&index_key).await?;

        info!(
            audit.action = "revoke_user_tokens",
            audit.resource = %user_id,
            audit.result = "success",
            revoked,
            "audit_event"
        );
        Ok(revoked)
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(OAuthError::invalid_request(format!("{name} is required"))),
    }
}
