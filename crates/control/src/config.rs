//! Control plane configuration.
//!
//! Every section deserializes with defaults (durations use humantime strings
//! such as `"30s"` or `"10m"`) and can also be built in code through a
//! validating builder:
//!
//! ```
//! use std::time::Duration;
//!
//! use calcplane_control::LockConfig;
//!
//! let config = LockConfig::builder()
//!     .ttl(Duration::from_secs(10))
//!     .build()?;
//! assert_eq!(config.acquire_timeout(), Duration::from_secs(10));
//! # Ok::<(), calcplane_control::ConfigError>(())
//! ```
//!
//! Deserialized configs are not validated automatically; call
//! [`ControlPlaneConfig::validate`] after loading.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(500);

const DEFAULT_POOL_CAPACITY: usize = 50;

const DEFAULT_MEMORY_CAPACITY: u64 = 10_000;
const DEFAULT_MEMORY_TTL: Duration = Duration::from_secs(60);
const DEFAULT_SHARED_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_BLOB_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_BLOB_THRESHOLD_BYTES: usize = 64 * 1024;

const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_RATE_MAX_REQUESTS: u32 = 60;
const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

const MIN_LOCK_TTL: Duration = Duration::from_millis(100);

fn below_minimum(field: &'static str, value: impl ToString, min: impl ToString) -> ConfigError {
    ConfigError::BelowMinimum { field, value: value.to_string(), min: min.to_string() }
}

fn require_nonzero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(below_minimum(field, format!("{value:?}"), "1ms"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Distributed lock
// ---------------------------------------------------------------------------

/// Distributed lock timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// How long a held lock survives without being released.
    #[serde(with = "humantime_serde", default = "default_lock_ttl")]
    pub(crate) ttl: Duration,

    /// How long `acquire` polls before giving up. Defaults to `ttl`.
    #[serde(with = "humantime_serde", default)]
    pub(crate) acquire_timeout: Option<Duration>,

    /// First polling delay.
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub(crate) initial_backoff: Duration,

    /// Upper bound on the polling delay.
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub(crate) max_backoff: Duration,
}

fn default_lock_ttl() -> Duration {
    DEFAULT_LOCK_TTL
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_LOCK_TTL,
            acquire_timeout: None,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[bon::bon]
impl LockConfig {
    /// Creates a validated lock configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `ttl` is shorter than 100ms, a backoff is
    /// zero, or `initial_backoff` exceeds `max_backoff`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_LOCK_TTL)] ttl: Duration,
        acquire_timeout: Option<Duration>,
        #[builder(default = DEFAULT_INITIAL_BACKOFF)] initial_backoff: Duration,
        #[builder(default = DEFAULT_MAX_BACKOFF)] max_backoff: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { ttl, acquire_timeout, initial_backoff, max_backoff };
        config.validate()?;
        Ok(config)
    }

    /// Checks field bounds.
    ///
    /// # Errors
    ///
    /// See [`LockConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl < MIN_LOCK_TTL {
            return Err(below_minimum("ttl", format!("{:?}", self.ttl), "100ms"));
        }
        require_nonzero("initial_backoff", self.initial_backoff)?;
        require_nonzero("max_backoff", self.max_backoff)?;
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::Invalid {
                field: "initial_backoff",
                reason: "must not exceed max_backoff".into(),
            });
        }
        Ok(())
    }

    /// Lock TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Acquisition deadline, falling back to the TTL.
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout.unwrap_or(self.ttl)
    }

    /// First polling delay.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Polling delay cap.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }
}

// ---------------------------------------------------------------------------
// Instance pool
// ---------------------------------------------------------------------------

/// Compute instance pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum number of live instances per process.
    #[serde(default = "default_pool_capacity")]
    pub(crate) capacity: usize,

    /// Lock settings used to deduplicate creation across processes.
    #[serde(default)]
    pub(crate) lock: LockConfig,
}

fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { capacity: DEFAULT_POOL_CAPACITY, lock: LockConfig::default() }
    }
}

#[bon::bon]
impl PoolConfig {
    /// Creates a validated pool configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if `capacity` is zero, or any
    /// error from [`LockConfig::validate`].
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_POOL_CAPACITY)] capacity: usize,
        #[builder(default)] lock: LockConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self { capacity, lock };
        config.validate()?;
        Ok(config)
    }

    /// Checks field bounds.
    ///
    /// # Errors
    ///
    /// See [`PoolConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(below_minimum("capacity", 0, 1));
        }
        self.lock.validate()
    }

    /// Maximum number of live instances.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Creation lock settings.
    #[must_use]
    pub fn lock(&self) -> &LockConfig {
        &self.lock
    }
}

// ---------------------------------------------------------------------------
// Result cache
// ---------------------------------------------------------------------------

/// Multi-tier result cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultCacheConfig {
    /// Maximum entries held in process memory.
    #[serde(default = "default_memory_capacity")]
    pub(crate) memory_capacity: u64,

    /// Upper bound on how long an entry stays in process memory.
    #[serde(with = "humantime_serde", default = "default_memory_ttl")]
    pub(crate) memory_ttl: Duration,

    /// TTL applied when a lower tier backfills the shared store.
    #[serde(with = "humantime_serde", default = "default_shared_ttl")]
    pub(crate) shared_ttl: Duration,

    /// Durable entries older than this are treated as misses.
    #[serde(with = "humantime_serde", default = "default_blob_max_age")]
    pub(crate) blob_max_age: Duration,

    /// Payloads at least this large are also written to the durable tier.
    #[serde(default = "default_blob_threshold_bytes")]
    pub(crate) blob_threshold_bytes: usize,
}

fn default_memory_capacity() -> u64 {
    DEFAULT_MEMORY_CAPACITY
}

fn default_memory_ttl() -> Duration {
    DEFAULT_MEMORY_TTL
}

fn default_shared_ttl() -> Duration {
    DEFAULT_SHARED_TTL
}

fn default_blob_max_age() -> Duration {
    DEFAULT_BLOB_MAX_AGE
}

fn default_blob_threshold_bytes() -> usize {
    DEFAULT_BLOB_THRESHOLD_BYTES
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            memory_ttl: DEFAULT_MEMORY_TTL,
            shared_ttl: DEFAULT_SHARED_TTL,
            blob_max_age: DEFAULT_BLOB_MAX_AGE,
            blob_threshold_bytes: DEFAULT_BLOB_THRESHOLD_BYTES,
        }
    }
}

#[bon::bon]
impl ResultCacheConfig {
    /// Creates a validated cache configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if `memory_capacity` or any TTL
    /// is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MEMORY_CAPACITY)] memory_capacity: u64,
        #[builder(default = DEFAULT_MEMORY_TTL)] memory_ttl: Duration,
        #[builder(default = DEFAULT_SHARED_TTL)] shared_ttl: Duration,
        #[builder(default = DEFAULT_BLOB_MAX_AGE)] blob_max_age: Duration,
        #[builder(default = DEFAULT_BLOB_THRESHOLD_BYTES)] blob_threshold_bytes: usize,
    ) -> Result<Self, ConfigError> {
        let config =
            Self { memory_capacity, memory_ttl, shared_ttl, blob_max_age, blob_threshold_bytes };
        config.validate()?;
        Ok(config)
    }

    /// Checks field bounds.
    ///
    /// # Errors
    ///
    /// See [`ResultCacheConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_capacity == 0 {
            return Err(below_minimum("memory_capacity", 0, 1));
        }
        require_nonzero("memory_ttl", self.memory_ttl)?;
        require_nonzero("shared_ttl", self.shared_ttl)?;
        require_nonzero("blob_max_age", self.blob_max_age)
    }

    /// Maximum in-memory entries.
    #[must_use]
    pub fn memory_capacity(&self) -> u64 {
        self.memory_capacity
    }

    /// In-memory TTL cap.
    #[must_use]
    pub fn memory_ttl(&self) -> Duration {
        self.memory_ttl
    }

    /// Shared-tier backfill TTL.
    #[must_use]
    pub fn shared_ttl(&self) -> Duration {
        self.shared_ttl
    }

    /// Maximum age of a durable entry.
    #[must_use]
    pub fn blob_max_age(&self) -> Duration {
        self.blob_max_age
    }

    /// Durable-tier size threshold.
    #[must_use]
    pub fn blob_threshold_bytes(&self) -> usize {
        self.blob_threshold_bytes
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Fixed-window rate limit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Window length.
    #[serde(with = "humantime_serde", default = "default_rate_window")]
    pub(crate) window: Duration,

    /// Requests allowed per identifier per window.
    #[serde(default = "default_rate_max_requests")]
    pub(crate) max_requests: u32,

    /// How often the in-process limiter drops expired windows.
    #[serde(with = "humantime_serde", default = "default_prune_interval")]
    pub(crate) prune_interval: Duration,
}

fn default_rate_window() -> Duration {
    DEFAULT_RATE_WINDOW
}

fn default_rate_max_requests() -> u32 {
    DEFAULT_RATE_MAX_REQUESTS
}

fn default_prune_interval() -> Duration {
    DEFAULT_PRUNE_INTERVAL
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_RATE_WINDOW,
            max_requests: DEFAULT_RATE_MAX_REQUESTS,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
        }
    }
}

#[bon::bon]
impl RateLimitConfig {
    /// Creates a validated rate limit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if `max_requests` is zero or the
    /// window is shorter than one millisecond.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_RATE_WINDOW)] window: Duration,
        #[builder(default = DEFAULT_RATE_MAX_REQUESTS)] max_requests: u32,
        #[builder(default = DEFAULT_PRUNE_INTERVAL)] prune_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { window, max_requests, prune_interval };
        config.validate()?;
        Ok(config)
    }

    /// Checks field bounds.
    ///
    /// # Errors
    ///
    /// See [`RateLimitConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(below_minimum("max_requests", 0, 1));
        }
        if self.window < Duration::from_millis(1) {
            return Err(below_minimum("window", format!("{:?}", self.window), "1ms"));
        }
        require_nonzero("prune_interval", self.prune_interval)
    }

    /// Window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests allowed per window.
    #[must_use]
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Pruning cadence.
    #[must_use]
    pub fn prune_interval(&self) -> Duration {
        self.prune_interval
    }
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

/// All control plane settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct ControlPlaneConfig {
    /// Instance pool settings.
    #[serde(default)]
    #[builder(default)]
    pub pool: PoolConfig,

    /// Result cache settings.
    #[serde(default)]
    #[builder(default)]
    pub cache: ResultCacheConfig,

    /// Calculation request rate limit.
    #[serde(default)]
    #[builder(default)]
    pub rate_limit: RateLimitConfig,

    /// TTL for freshly computed results in the shared tier.
    #[serde(with = "humantime_serde", default = "default_shared_ttl")]
    #[builder(default = DEFAULT_SHARED_TTL)]
    pub result_ttl: Duration,
}

impl ControlPlaneConfig {
    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.cache.validate()?;
        self.rate_limit.validate()?;
        require_nonzero("result_ttl", self.result_ttl)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControlPlaneConfig::default();
        assert_eq!(config.pool.capacity(), 50);
        assert_eq!(config.pool.lock().ttl(), Duration::from_secs(30));
        assert_eq!(config.pool.lock().acquire_timeout(), Duration::from_secs(30));
        assert_eq!(config.cache.memory_capacity(), 10_000);
        assert_eq!(config.cache.blob_threshold_bytes(), 64 * 1024);
        assert_eq!(config.rate_limit.max_requests(), 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_humantime_and_defaults() {
        let config: ControlPlaneConfig = serde_json::from_value(serde_json::json!({
            "pool": { "capacity": 8, "lock": { "ttl": "5s", "acquire_timeout": "750ms" } },
            "rate_limit": { "window": "1s", "max_requests": 3 }
        }))
        .unwrap();

        assert_eq!(config.pool.capacity(), 8);
        assert_eq!(config.pool.lock().ttl(), Duration::from_secs(5));
        assert_eq!(config.pool.lock().acquire_timeout(), Duration::from_millis(750));
        assert_eq!(config.rate_limit.window(), Duration::from_secs(1));
        assert_eq!(config.cache, ResultCacheConfig::default());
        assert_eq!(config.result_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let result: Result<LockConfig, _> =
            serde_json::from_value(serde_json::json!({ "ttl": "1s", "tll": "2s" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_zero_capacity() {
        let err = PoolConfig::builder().capacity(0).build().unwrap_err();
        assert_eq!(
            err,
            ConfigError::BelowMinimum { field: "capacity", value: "0".into(), min: "1".into() }
        );
    }

    #[test]
    fn test_builder_rejects_inverted_backoff() {
        let err = LockConfig::builder()
            .initial_backoff(Duration::from_secs(2))
            .max_backoff(Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "initial_backoff", .. }));
    }

    #[test]
    fn test_builder_rejects_tiny_lock_ttl() {
        let err = LockConfig::builder().ttl(Duration::from_millis(5)).build().unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "ttl", .. }));
    }

    #[test]
    fn test_rate_limit_rejects_zero_budget() {
        let err = RateLimitConfig::builder().max_requests(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "max_requests", .. }));
    }
}
