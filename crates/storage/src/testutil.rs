//! Shared test utilities for code built on the storage abstractions.
//!
//! Feature-gated behind `testutil` so it never leaks into production builds.
//!
//! ```toml
//! [dev-dependencies]
//! calcplane-storage = { path = "../storage", features = ["testutil"] }
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    blob::BlobStore,
    error::{StorageError, StorageResult},
    store::KvStore,
};

/// A [`KvStore`] and [`BlobStore`] whose every operation fails with
/// [`StorageError::Connection`], simulating an unreachable store.
#[derive(Debug, Default)]
pub struct FailingStore {
    calls: AtomicU64,
}

impl FailingStore {
    /// Creates a new failing store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many operations were attempted against this store.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn fail<T>(&self) -> StorageResult<T> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Err(StorageError::connection("store unreachable"))
    }
}

#[async_trait]
impl KvStore for FailingStore {
    async fn get(&self, _key: &str) -> StorageResult<Option<Bytes>> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: Vec<u8>) -> StorageResult<()> {
        self.fail()
    }

    async fn set_with_ttl(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> StorageResult<()> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> StorageResult<bool> {
        self.fail()
    }

    async fn set_if_absent(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> StorageResult<bool> {
        self.fail()
    }

    async fn compare_and_delete(&self, _key: &str, _expected: &[u8]) -> StorageResult<bool> {
        self.fail()
    }

    async fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<&[u8]>,
        _new_value: Vec<u8>,
    ) -> StorageResult<bool> {
        self.fail()
    }

    async fn increment(
        &self,
        _key: &str,
        _delta: i64,
        _ttl_if_new: Option<Duration>,
    ) -> StorageResult<i64> {
        self.fail()
    }

    async fn hash_set_all(
        &self,
        _key: &str,
        _fields: BTreeMap<String, String>,
        _ttl: Option<Duration>,
    ) -> StorageResult<()> {
        self.fail()
    }

    async fn hash_get_all(&self, _key: &str) -> StorageResult<BTreeMap<String, String>> {
        self.fail()
    }

    async fn set_add(&self, _key: &str, _member: &str, _ttl: Option<Duration>) -> StorageResult<bool> {
        self.fail()
    }

    async fn set_remove(&self, _key: &str, _member: &str) -> StorageResult<bool> {
        self.fail()
    }

    async fn set_is_member(&self, _key: &str, _member: &str) -> StorageResult<bool> {
        self.fail()
    }

    async fn set_members(&self, _key: &str) -> StorageResult<Vec<String>> {
        self.fail()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> StorageResult<bool> {
        self.fail()
    }

    async fn ttl(&self, _key: &str) -> StorageResult<Option<Duration>> {
        self.fail()
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.fail()
    }
}

#[async_trait]
impl BlobStore for FailingStore {
    async fn get(&self, _url: &str) -> StorageResult<Option<Bytes>> {
        self.fail()
    }

    async fn put(&self, _url: &str, _payload: Bytes) -> StorageResult<()> {
        self.fail()
    }

    async fn delete(&self, _url: &str) -> StorageResult<()> {
        self.fail()
    }
}

/// A [`KvStore`] that delegates to an inner store but fails chosen
/// operations a set number of times first.
///
/// ```ignore
/// let store = FlakyStore::new(Arc::new(MemoryStore::new()));
/// store.fail_next("hash_get_all", 1);
/// ```
pub struct FlakyStore {
    inner: Arc<dyn KvStore>,
    pending: Mutex<HashMap<&'static str, u32>>,
}

impl std::fmt::Debug for FlakyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyStore").field("pending", &*self.pending.lock()).finish_non_exhaustive()
    }
}

impl FlakyStore {
    /// Wraps `inner` with no failures scheduled.
    #[must_use]
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self { inner, pending: Mutex::new(HashMap::new()) }
    }

    /// Makes the next `times` calls to `operation` (a [`KvStore`] method
    /// name) fail with [`StorageError::Connection`].
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        *self.pending.lock().entry(operation).or_insert(0) += times;
    }

    fn trip(&self, operation: &'static str) -> StorageResult<()> {
        let mut pending = self.pending.lock();
        match pending.get_mut(operation) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(StorageError::connection(format!("{operation} failed")))
            },
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        self.trip("get")?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.trip("set")?;
        self.inner.set(key, value).await
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        self.trip("set_with_ttl")?;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.trip("delete")?;
        self.inner.delete(key).await
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<bool> {
        self.trip("set_if_absent")?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StorageResult<bool> {
        self.trip("compare_and_delete")?;
        self.inner.compare_and_delete(key, expected).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<bool> {
        self.trip("compare_and_swap")?;
        self.inner.compare_and_swap(key, expected, new_value).await
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        ttl_if_new: Option<Duration>,
    ) -> StorageResult<i64> {
        self.trip("increment")?;
        self.inner.increment(key, delta, ttl_if_new).await
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: BTreeMap<String, String>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        self.trip("hash_set_all")?;
        self.inner.hash_set_all(key, fields, ttl).await
    }

    async fn hash_get_all(&self, key: &str) -> StorageResult<BTreeMap<String, String>> {
        self.trip("hash_get_all")?;
        self.inner.hash_get_all(key).await
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> StorageResult<bool> {
        self.trip("set_add")?;
        self.inner.set_add(key, member, ttl).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> StorageResult<bool> {
        self.trip("set_remove")?;
        self.inner.set_remove(key, member).await
    }

    async fn set_is_member(&self, key: &str, member: &str) -> StorageResult<bool> {
        self.trip("set_is_member")?;
        self.inner.set_is_member(key, member).await
    }

    async fn set_members(&self, key: &str) -> StorageResult<Vec<String>> {
        self.trip("set_members")?;
        self.inner.set_members(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        self.trip("expire")?;
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>> {
        self.trip("ttl")?;
        self.inner.ttl(key).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.trip("health_check")?;
        self.inner.health_check().await
    }
}

/// Assert that a [`StorageResult`] is `Ok`, returning the inner value.
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StorageError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got StorageError: {e:?}", $msg),
        }
    };
}

/// Assert that a [`StorageResult`] is a [`StorageError::Connection`].
#[macro_export]
macro_rules! assert_connection_error {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Connection { .. })),
            "expected StorageError::Connection, got: {:?}",
            $result,
        );
    };
}
