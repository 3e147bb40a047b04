//! Optimistic concurrency versions.
//!
//! A version is a monotonically increasing counter per resource key (for
//! example `"{service_id}:{area}"`). Writers present the version they last
//! observed; the write is accepted only if it still matches, and the counter
//! is bumped atomically with the check.
//!
//! Two implementations share the [`VersionTracker`] trait:
//!
//! - [`VersionMap`]: process-local, guarded by a single mutex
//! - [`StoreVersionMap`]: shared through a [`KvStore`] using compare-and-swap

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use calcplane_storage::{KvStore, StorageError, keys};
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::error::{ControlError, Result};

/// How many times a store-backed bump retries a lost compare-and-swap race
/// when the caller did not pin an expected version.
const MAX_UNCONDITIONAL_ATTEMPTS: usize = 16;

/// Check-and-bump version counters.
#[async_trait]
pub trait VersionTracker: Send + Sync {
    /// Returns the current version of `key` (0 if never written).
    async fn current_version(&self, key: &str) -> Result<u64>;

    /// Atomically verifies `expected` (when given) and increments the
    /// version of `key`, returning the new version.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::VersionConflict`] if `expected` is `Some` and
    /// differs from the stored version. The version is left unchanged.
    async fn check_and_bump(&self, key: &str, expected: Option<u64>) -> Result<u64>;
}

/// Process-local version counters.
#[derive(Debug, Default)]
pub struct VersionMap {
    versions: Mutex<HashMap<String, u64>>,
}

impl VersionMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> u64 {
        self.versions.lock().get(key).copied().unwrap_or(0)
    }

    /// Synchronous check-and-bump.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::VersionConflict`] on a stale `expected`.
    pub fn bump(&self, key: &str, expected: Option<u64>) -> Result<u64> {
        let mut versions = self.versions.lock();
        let current = versions.get(key).copied().unwrap_or(0);
        if let Some(expected) = expected
            && expected != current
        {
            return Err(ControlError::version_conflict(key, expected, current));
        }
        let next = current + 1;
        versions.insert(key.to_owned(), next);
        Ok(next)
    }
}

#[async_trait]
impl VersionTracker for VersionMap {
    async fn current_version(&self, key: &str) -> Result<u64> {
        Ok(self.get(key))
    }

    async fn check_and_bump(&self, key: &str, expected: Option<u64>) -> Result<u64> {
        self.bump(key, expected)
    }
}

/// Version counters shared through a [`KvStore`].
///
/// Versions are stored as decimal strings under `version:{key}`.
#[derive(Clone)]
pub struct StoreVersionMap {
    store: Arc<dyn KvStore>,
}

impl StoreVersionMap {
    /// Creates a version map backed by `store`.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    async fn read(&self, storage_key: &str) -> Result<(u64, Option<Vec<u8>>)> {
        match self.store.get(storage_key).await? {
            None => Ok((0, None)),
            Some(raw) => {
                let version = std::str::from_utf8(&raw)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| {
                        StorageError::serialization(format!(
                            "malformed version at {storage_key}"
                        ))
                    })?;
                Ok((version, Some(raw.to_vec())))
            },
        }
    }
}

impl std::fmt::Debug for StoreVersionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreVersionMap").finish_non_exhaustive()
    }
}

#[async_trait]
impl VersionTracker for StoreVersionMap {
    async fn current_version(&self, key: &str) -> Result<u64> {
        Ok(self.read(&keys::version(key)).await?.0)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn check_and_bump(&self, key: &str, expected: Option<u64>) -> Result<u64> {
        let storage_key = keys::version(key);
        for _ in 0..MAX_UNCONDITIONAL_ATTEMPTS {
            let (current, raw) = self.read(&storage_key).await?;
            if let Some(expected) = expected
                && expected != current
            {
                return Err(ControlError::version_conflict(key, expected, current));
            }

            let next = current + 1;
            if self
                .store
                .compare_and_swap(&storage_key, raw.as_deref(), next.to_string().into_bytes())
                .await?
            {
                debug!(version = next, "version bumped");
                return Ok(next);
            }

            if let Some(expected) = expected {
                let (actual, _) = self.read(&storage_key).await?;
                return Err(ControlError::version_conflict(key, expected, actual));
            }
        }

        Err(StorageError::conflict(storage_key).into())
    }
}
