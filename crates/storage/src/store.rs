//! Shared key-value store trait definition.
//!
//! This module defines the [`KvStore`] trait, the abstraction over the shared,
//! multi-writer key-value store that every process instance of the control
//! plane talks to. All implementations ([`MemoryStore`](crate::MemoryStore),
//! network-backed stores) implement this trait.
//!
//! # Atomicity
//!
//! Every method is a single atomic operation at the store level. Callers
//! build their protocols (locks, counters, one-time codes) out of these
//! primitives and never out of a read followed by a write:
//!
//! | Method | Store-native equivalent |
//! |--------|-------------------------|
//! | [`set_if_absent`](KvStore::set_if_absent) | `SET key value NX PX ttl` |
//! | [`compare_and_delete`](KvStore::compare_and_delete) | scripted `GET` + `DEL` |
//! | [`compare_and_swap`](KvStore::compare_and_swap) | scripted `GET` + `SET` |
//! | [`increment`](KvStore::increment) | `INCRBY` (+ `PEXPIRE` on create) |
//! | [`delete`](KvStore::delete) | `DEL` (reports whether a key was removed) |
//!
//! # Expiry
//!
//! A key whose TTL has elapsed is logically absent for every operation, even
//! if the backend has not physically removed it yet.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageResult;

/// Abstract shared key-value store.
///
/// Implementations must be thread-safe (`Send + Sync`) and are used as
/// `Arc<dyn KvStore>` throughout the control plane. Every operation is an
/// asynchronous I/O call and therefore a scheduling yield point.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use calcplane_storage::{KvStore, MemoryStore};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = MemoryStore::new();
///
/// assert!(store.set_if_absent("lock:a", b"owner-1".to_vec(), Duration::from_secs(5)).await.unwrap());
/// assert!(!store.set_if_absent("lock:a", b"owner-2".to_vec(), Duration::from_secs(5)).await.unwrap());
/// assert!(store.compare_and_delete("lock:a", b"owner-1").await.unwrap());
/// # });
/// ```
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Retrieves a plain value by key.
    ///
    /// Returns `Ok(None)` if the key is absent or expired.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>>;

    /// Stores a plain value without expiry, clearing any existing TTL.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Stores a plain value that expires after `ttl`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<()>;

    /// Deletes a key of any kind.
    ///
    /// Returns `true` if a live key was removed. Because removal and the
    /// report are one atomic step, exactly one of several concurrent callers
    /// observes `true`, which makes `delete` usable as a take-once primitive.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Atomically stores `value` with expiry `ttl` only if `key` is absent.
    ///
    /// Returns `true` if the value was stored.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<bool>;

    /// Atomically deletes `key` only if its current value equals `expected`.
    ///
    /// Returns `true` if the key was deleted. An absent or expired key, or
    /// one holding different bytes, is left untouched and yields `false`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StorageResult<bool>;

    /// Atomically replaces the value of `key` if it matches `expected`.
    ///
    /// - `expected: None` succeeds only when the key is absent (insert-if-absent).
    /// - `expected: Some(bytes)` succeeds only when the current value is byte-identical.
    ///
    /// Returns `true` on success. The new value does not expire.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<bool>;

    /// Atomically adds `delta` to the integer counter at `key`, creating it
    /// at zero if absent. `ttl_if_new` is applied only when the counter is
    /// created by this call.
    ///
    /// Returns the counter value after the increment.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn increment(
        &self,
        key: &str,
        delta: i64,
        ttl_if_new: Option<Duration>,
    ) -> StorageResult<i64>;

    /// Replaces the hash at `key` with `fields`, optionally expiring it.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn hash_set_all(
        &self,
        key: &str,
        fields: BTreeMap<String, String>,
        ttl: Option<Duration>,
    ) -> StorageResult<()>;

    /// Returns every field of the hash at `key` (empty if absent).
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn hash_get_all(&self, key: &str) -> StorageResult<BTreeMap<String, String>>;

    /// Adds `member` to the set at `key`. `ttl` (if given) refreshes the
    /// expiry of the whole set. Returns `true` if the member was new.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> StorageResult<bool>;

    /// Removes `member` from the set at `key`. Returns `true` if it was present.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_remove(&self, key: &str, member: &str) -> StorageResult<bool>;

    /// Returns whether `member` belongs to the set at `key`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_is_member(&self, key: &str, member: &str) -> StorageResult<bool>;

    /// Returns all members of the set at `key` in sorted order.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_members(&self, key: &str) -> StorageResult<Vec<String>>;

    /// Sets or replaces the expiry of an existing key.
    ///
    /// Returns `false` if the key does not exist.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool>;

    /// Returns the remaining lifetime of `key`, or `None` if it is absent or
    /// has no expiry.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>>;

    /// Verifies the store is reachable.
    #[must_use = "health check results indicate store availability and must be inspected"]
    async fn health_check(&self) -> StorageResult<()>;
}
