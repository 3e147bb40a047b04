//! Control plane error types.
//!
//! [`ControlError`] is the taxonomy every control-plane operation reports:
//!
//! | Variant | Caller action |
//! |---------|---------------|
//! | [`LockTimeout`](ControlError::LockTimeout) | retry later |
//! | [`VersionConflict`](ControlError::VersionConflict) | refetch, then retry |
//! | [`Validation`](ControlError::Validation) | fix the request; never retried |
//! | [`RateLimitExceeded`](ControlError::RateLimitExceeded) | back off until `reset_at_ms` |
//! | [`ComputeFault`](ControlError::ComputeFault) | surface to the user; not retried |
//! | [`Storage`](ControlError::Storage) | retry if transient |

use std::time::Duration;

use calcplane_storage::StorageError;
use thiserror::Error;

use crate::{compute::ComputeFault, validator::ValidationError};

/// Result alias for control-plane operations.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors raised by the control plane.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControlError {
    /// Another holder kept the distributed lock past the acquisition deadline.
    #[error("Timed out after {}ms waiting for lock on {key}", waited.as_millis())]
    LockTimeout {
        /// Resource key whose lock could not be acquired.
        key: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The caller's expected version no longer matches the stored version.
    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Resource key whose version moved.
        key: String,
        /// Version presented by the caller.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// The mutation was rejected before reaching the compute provider.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The identifier exhausted its request budget for the current window.
    #[error("Rate limit exceeded for {identifier}, retry after {}ms", retry_after.as_millis())]
    RateLimitExceeded {
        /// Rate-limited identifier.
        identifier: String,
        /// Unix milliseconds at which the current window ends.
        reset_at_ms: i64,
        /// Time remaining until the window resets.
        retry_after: Duration,
    },

    /// The compute provider reported a fault.
    #[error("Compute fault: {0}")]
    ComputeFault(#[from] ComputeFault),

    /// A shared-store operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration was rejected.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ControlError {
    /// Creates a new `LockTimeout` error.
    #[must_use]
    pub fn lock_timeout(key: impl Into<String>, waited: Duration) -> Self {
        Self::LockTimeout { key: key.into(), waited }
    }

    /// Creates a new `VersionConflict` error.
    #[must_use]
    pub fn version_conflict(key: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::VersionConflict { key: key.into(), expected, actual }
    }

    /// Stable machine-readable code for client-facing error payloads.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::LockTimeout { .. } => "lock_timeout",
            Self::VersionConflict { .. } => "version_conflict",
            Self::Validation(_) => "validation_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::ComputeFault(_) => "compute_fault",
            Self::Storage(_) => "storage_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Returns `true` if repeating the same call later may succeed without
    /// the caller changing anything.
    ///
    /// `VersionConflict` is deliberately excluded: the caller must refetch
    /// before retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } | Self::RateLimitExceeded { .. } => true,
            Self::Storage(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Suggested delay before retrying, when the error carries one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric or duration field is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Offending field.
        field: &'static str,
        /// Rejected value.
        value: String,
        /// Smallest accepted value.
        min: String,
    },

    /// Two fields are inconsistent with each other.
    #[error("{field} is invalid: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
