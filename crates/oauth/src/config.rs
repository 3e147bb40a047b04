//! Token bridge configuration.
//!
//! ```
//! use std::time::Duration;
//!
//! use calcplane_oauth::BridgeConfig;
//!
//! let config = BridgeConfig::builder()
//!     .issuer("https://calc.example.com".to_owned())
//!     .code_ttl(Duration::from_secs(300))
//!     .build()?;
//! assert_eq!(config.access_token_ttl(), Duration::from_secs(24 * 60 * 60));
//! # Ok::<(), calcplane_control::ConfigError>(())
//! ```

use std::time::Duration;

use calcplane_control::{ConfigError, RateLimitConfig};
use serde::{Deserialize, Serialize};

use crate::client::RedirectPolicy;

const DEFAULT_ISSUER: &str = "http://localhost:8080";
const DEFAULT_CODE_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_ACCESS_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_CLIENT_REGISTRATION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const MIN_CODE_TTL: Duration = Duration::from_secs(1);

/// Redirect URI patterns accepted for clients that are neither registered
/// nor configured statically.
pub const DEFAULT_REDIRECT_PATTERNS: [&str; 3] =
    ["https://*", "http://localhost:*", "http://127.0.0.1:*"];

/// A pre-provisioned client with a fixed redirect allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticClient {
    /// Client identifier presented in requests.
    pub client_id: String,
    /// Exact redirect URIs this client may use.
    pub redirect_uris: Vec<String>,
}

/// Token bridge settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Base URL advertised in server metadata.
    #[serde(default = "default_issuer")]
    pub(crate) issuer: String,

    /// Authorization code lifetime.
    #[serde(with = "humantime_serde", default = "default_code_ttl")]
    pub(crate) code_ttl: Duration,

    /// Bridge access token lifetime.
    #[serde(with = "humantime_serde", default = "default_access_token_ttl")]
    pub(crate) access_token_ttl: Duration,

    /// Dynamic client registration lifetime.
    #[serde(with = "humantime_serde", default = "default_client_registration_ttl")]
    pub(crate) client_registration_ttl: Duration,

    /// Glob patterns (`*` matches any run of characters) for redirect URIs.
    #[serde(default = "default_redirect_patterns")]
    pub(crate) allowed_redirect_patterns: Vec<String>,

    /// Pre-provisioned clients.
    #[serde(default)]
    pub(crate) static_clients: Vec<StaticClient>,

    /// Per-client budget on the HTTP endpoints.
    #[serde(default)]
    pub(crate) rate_limit: RateLimitConfig,
}

fn default_issuer() -> String {
    DEFAULT_ISSUER.to_owned()
}

fn default_code_ttl() -> Duration {
    DEFAULT_CODE_TTL
}

fn default_access_token_ttl() -> Duration {
    DEFAULT_ACCESS_TOKEN_TTL
}

fn default_client_registration_ttl() -> Duration {
    DEFAULT_CLIENT_REGISTRATION_TTL
}

fn default_redirect_patterns() -> Vec<String> {
    DEFAULT_REDIRECT_PATTERNS.iter().map(|p| (*p).to_owned()).collect()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            code_ttl: DEFAULT_CODE_TTL,
            access_token_ttl: DEFAULT_ACCESS_TOKEN_TTL,
            client_registration_ttl: DEFAULT_CLIENT_REGISTRATION_TTL,
            allowed_redirect_patterns: default_redirect_patterns(),
            static_clients: Vec::new(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[bon::bon]
impl BridgeConfig {
    /// Creates a validated bridge configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a TTL is below one second, a redirect
    /// pattern is not an `http`/`https` URL pattern, or a static client has
    /// no redirect URIs.
    #[builder]
    pub fn new(
        #[builder(default = default_issuer())] issuer: String,
        #[builder(default = DEFAULT_CODE_TTL)] code_ttl: Duration,
        #[builder(default = DEFAULT_ACCESS_TOKEN_TTL)] access_token_ttl: Duration,
        #[builder(default = DEFAULT_CLIENT_REGISTRATION_TTL)] client_registration_ttl: Duration,
        #[builder(default = default_redirect_patterns())] allowed_redirect_patterns: Vec<String>,
        #[builder(default)] static_clients: Vec<StaticClient>,
        #[builder(default)] rate_limit: RateLimitConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            issuer,
            code_ttl,
            access_token_ttl,
            client_registration_ttl,
            allowed_redirect_patterns,
            static_clients,
            rate_limit,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks field bounds and compiles the redirect patterns.
    ///
    /// # Errors
    ///
    /// See [`BridgeConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, ttl) in [
            ("code_ttl", self.code_ttl),
            ("access_token_ttl", self.access_token_ttl),
            ("client_registration_ttl", self.client_registration_ttl),
        ] {
            if ttl < MIN_CODE_TTL {
                return Err(ConfigError::BelowMinimum {
                    field,
                    value: format!("{ttl:?}"),
                    min: "1s".into(),
                });
            }
        }
        if !self.issuer.starts_with("https://") && !self.issuer.starts_with("http://") {
            return Err(ConfigError::Invalid {
                field: "issuer",
                reason: format!("{} is not an http(s) URL", self.issuer),
            });
        }
        RedirectPolicy::compile(&self.allowed_redirect_patterns)?;
        for client in &self.static_clients {
            if client.client_id.is_empty() || client.redirect_uris.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "static_clients",
                    reason: format!("client {:?} needs an id and redirect URIs", client.client_id),
                });
            }
        }
        self.rate_limit.validate()
    }

    /// Issuer URL.
    #[must_use]
    pub fn issuer(&self) -> &str {
        self.issuer.trim_end_matches('/')
    }

    /// Authorization code lifetime.
    #[must_use]
    pub fn code_ttl(&self) -> Duration {
        self.code_ttl
    }

    /// Access token lifetime.
    #[must_use]
    pub fn access_token_ttl(&self) -> Duration {
        self.access_token_ttl
    }

    /// Client registration lifetime.
    #[must_use]
    pub fn client_registration_ttl(&self) -> Duration {
        self.client_registration_ttl
    }

    /// Redirect URI patterns.
    #[must_use]
    pub fn allowed_redirect_patterns(&self) -> &[String] {
        &self.allowed_redirect_patterns
    }

    /// Pre-provisioned clients.
    #[must_use]
    pub fn static_clients(&self) -> &[StaticClient] {
        &self.static_clients
    }

    /// HTTP rate limit.
    #[must_use]
    pub fn rate_limit(&self) -> &RateLimitConfig {
        &self.rate_limit
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.code_ttl(), Duration::from_secs(600));
        assert_eq!(config.access_token_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.client_registration_ttl(), Duration::from_secs(30 * 86_400));
        assert_eq!(config.allowed_redirect_patterns().len(), 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_deserialize_humantime() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{
                "issuer": "https://calc.example.com/",
                "code_ttl": "5m",
                "access_token_ttl": "12h",
                "static_clients": [
                    { "client_id": "desktop", "redirect_uris": ["http://localhost:7777/cb"] }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.issuer(), "https://calc.example.com");
        assert_eq!(config.code_ttl(), Duration::from_secs(300));
        assert_eq!(config.access_token_ttl(), Duration::from_secs(12 * 3600));
        assert_eq!(config.static_clients().len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = serde_json::from_str::<BridgeConfig>(r#"{ "code_tll": "5m" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_zero_ttl() {
        let err = BridgeConfig::builder().code_ttl(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "code_ttl", .. }));
    }

    #[test]
    fn test_builder_rejects_bad_pattern() {
        let err = BridgeConfig::builder()
            .allowed_redirect_patterns(vec!["javascript:*".into()])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "allowed_redirect_patterns", .. }));
    }

    #[test]
    fn test_static_client_without_redirects_rejected() {
        let err = BridgeConfig::builder()
            .static_clients(vec![StaticClient { client_id: "cli".into(), redirect_uris: vec![] }])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "static_clients", .. }));
    }
}
