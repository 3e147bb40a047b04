//! Storage error types and result alias.
//!
//! Every [`KvStore`](crate::KvStore) and [`BlobStore`](crate::BlobStore)
//! implementation maps its internal failures onto [`StorageError`].
//!
//! # Error Types
//!
//! - [`StorageError::NotFound`] - Key does not exist
//! - [`StorageError::Conflict`] - An atomic precondition did not hold
//! - [`StorageError::WrongType`] - Key holds a different kind of entry
//! - [`StorageError::Connection`] - Network or connection-related failures
//! - [`StorageError::Serialization`] - Data encoding/decoding failures
//! - [`StorageError::Internal`] - Backend-specific internal errors
//! - [`StorageError::Timeout`] - Operation exceeded time limit

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Errors preserve their source chain via the `#[source]` attribute.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested key was not found.
    #[error("Key not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// An atomic precondition (compare-and-swap, conditional set) failed.
    #[error("Conflict on key: {key}")]
    Conflict {
        /// The contended key.
        key: String,
    },

    /// The key holds an entry of a different kind (e.g. a hash where a
    /// plain value was expected).
    #[error("Wrong entry type for key {key}: expected {expected}")]
    WrongType {
        /// The offending key.
        key: String,
        /// The entry kind the operation requires.
        expected: &'static str,
    },

    /// Connection or network error.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Serialization or deserialization error.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Internal storage backend error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Operation timed out.
    #[error("Operation timeout")]
    Timeout,
}

impl StorageError {
    /// Creates a new `NotFound` error for the given key.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `Conflict` error for the given key.
    #[must_use]
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }

    /// Creates a new `WrongType` error.
    #[must_use]
    pub fn wrong_type(key: impl Into<String>, expected: &'static str) -> Self {
        Self::WrongType { key: key.into(), expected }
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Returns `true` for failures that may succeed if the same call is
    /// repeated (connection loss, timeouts).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_with_source("json encoding failed", err)
    }
}
