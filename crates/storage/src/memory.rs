//! In-memory shared store implementation.
//!
//! This module provides [`MemoryStore`], an in-memory implementation of
//! [`KvStore`] suitable for testing, development and single-process
//! deployments.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`] for concurrent access
//! - **Atomic primitives**: Every [`KvStore`] method runs under one write lock
//! - **Typed entries**: Plain values, hashes and sets live side by side
//! - **TTL support**: Background task cleans up expired keys
//!
//! # Example
//!
//! ```
//! use calcplane_storage::{KvStore, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!
//!     store.set("greeting", b"hello".to_vec()).await.unwrap();
//!     let value = store.get("greeting").await.unwrap();
//!
//!     assert_eq!(value.unwrap().as_ref(), b"hello");
//! }
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - Clones share data, separate `MemoryStore::new()` instances do not
//! - TTL cleanup runs every second; reads treat expired keys as absent immediately

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{select, sync::watch, time::sleep};
use tracing::debug;

use crate::{
    error::{StorageError, StorageResult},
    store::KvStore,
};

/// Interval between background sweeps of expired keys.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the cleanup task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Value(Bytes),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(entry: Entry, ttl: Option<Duration>) -> Self {
        Self { entry, expires_at: ttl.and_then(deadline) }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Expiry instant for `ttl` from now. A TTL too large to represent never
/// expires.
fn deadline(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}

type Data = BTreeMap<String, Slot>;

/// Returns the live slot for `key`, treating expired slots as absent.
fn live<'a>(data: &'a Data, key: &str) -> Option<&'a Slot> {
    data.get(key).filter(|slot| !slot.is_expired(Instant::now()))
}

/// Returns the live slot for `key` mutably, physically removing it first if
/// it has expired.
fn live_mut<'a>(data: &'a mut Data, key: &str) -> Option<&'a mut Slot> {
    if data.get(key).is_some_and(|slot| slot.is_expired(Instant::now())) {
        data.remove(key);
    }
    data.get_mut(key)
}

/// In-memory shared store.
///
/// # Cloning
///
/// `MemoryStore` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data, which lets tests simulate several processes
/// talking to one shared store.
///
/// # Shutdown
///
/// The background TTL cleanup task stops automatically when all clones are
/// dropped. [`shutdown`](Self::shutdown) stops it explicitly.
#[derive(Clone)]
pub struct MemoryStore {
    data: Arc<RwLock<Data>>,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl MemoryStore {
    /// Creates a new in-memory store and spawns its TTL cleanup task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let store = Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }),
        };

        let data = Arc::downgrade(&store.data);
        tokio::spawn(async move {
            cleanup_expired_keys(data, shutdown_rx).await;
        });

        store
    }

    /// Explicitly signals the background TTL cleanup task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Returns the number of physically stored keys, including expired keys
    /// not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` if no keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").field("keys", &self.len()).finish()
    }
}

/// Background task removing expired keys every [`CLEANUP_INTERVAL`].
///
/// Holds only a weak reference so that it never keeps the data alive.
async fn cleanup_expired_keys(
    data: std::sync::Weak<RwLock<Data>>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        select! {
            _ = sleep(CLEANUP_INTERVAL) => {}
            _ = shutdown_rx.changed() => return,
        }

        let Some(data) = data.upgrade() else { return };
        let now = Instant::now();
        let expired: Vec<String> = data
            .read()
            .iter()
            .filter(|(_, slot)| slot.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        if !expired.is_empty() {
            let mut guard = data.write();
            let mut removed = 0usize;
            for key in expired {
                // Re-check: the key may have been rewritten since the scan.
                if guard.get(&key).is_some_and(|slot| slot.is_expired(now)) {
                    guard.remove(&key);
                    removed += 1;
                }
            }
            debug!(removed, "purged expired keys");
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let data = self.data.read();
        match live(&data, key) {
            None => Ok(None),
            Some(Slot { entry: Entry::Value(value), .. }) => Ok(Some(value.clone())),
            Some(_) => Err(StorageError::wrong_type(key, "value")),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.data.write().insert(key.to_owned(), Slot::new(Entry::Value(value.into()), None));
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        self.data.write().insert(key.to_owned(), Slot::new(Entry::Value(value.into()), Some(ttl)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let mut data = self.data.write();
        Ok(live_mut(&mut data, key).is_some() && data.remove(key).is_some())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<bool> {
        let mut data = self.data.write();
        if live_mut(&mut data, key).is_some() {
            return Ok(false);
        }
        data.insert(key.to_owned(), Slot::new(Entry::Value(value.into()), Some(ttl)));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StorageResult<bool> {
        let mut data = self.data.write();
        let matches = matches!(
            live_mut(&mut data, key),
            Some(Slot { entry: Entry::Value(current), .. }) if current.as_ref() == expected
        );
        if matches {
            data.remove(key);
        }
        Ok(matches)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<bool> {
        let mut data = self.data.write();
        let matches = match (expected, live_mut(&mut data, key)) {
            (None, None) => true,
            (Some(exp), Some(Slot { entry: Entry::Value(current), .. })) => {
                current.as_ref() == exp
            },
            (_, Some(Slot { entry: Entry::Hash(_) | Entry::Set(_), .. })) => {
                return Err(StorageError::wrong_type(key, "value"));
            },
            _ => false,
        };
        if matches {
            data.insert(key.to_owned(), Slot::new(Entry::Value(new_value.into()), None));
        }
        Ok(matches)
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        ttl_if_new: Option<Duration>,
    ) -> StorageResult<i64> {
        let mut data = self.data.write();
        match live_mut(&mut data, key) {
            None => {
                data.insert(
                    key.to_owned(),
                    Slot::new(Entry::Value(delta.to_string().into()), ttl_if_new),
                );
                Ok(delta)
            },
            Some(Slot { entry: Entry::Value(current), .. }) => {
                let parsed = std::str::from_utf8(current)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| StorageError::wrong_type(key, "integer"))?;
                let next = parsed
                    .checked_add(delta)
                    .ok_or_else(|| StorageError::internal(format!("counter overflow: {key}")))?;
                *current = next.to_string().into();
                Ok(next)
            },
            Some(_) => Err(StorageError::wrong_type(key, "integer")),
        }
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: BTreeMap<String, String>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        self.data.write().insert(key.to_owned(), Slot::new(Entry::Hash(fields), ttl));
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StorageResult<BTreeMap<String, String>> {
        let data = self.data.read();
        match live(&data, key) {
            None => Ok(BTreeMap::new()),
            Some(Slot { entry: Entry::Hash(fields), .. }) => Ok(fields.clone()),
            Some(_) => Err(StorageError::wrong_type(key, "hash")),
        }
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> StorageResult<bool> {
        let mut data = self.data.write();
        // Drops an expired set so the member starts a fresh one.
        let _ = live_mut(&mut data, key);
        let slot = data
            .entry(key.to_owned())
            .or_insert_with(|| Slot::new(Entry::Set(BTreeSet::new()), None));
        let Entry::Set(members) = &mut slot.entry else {
            return Err(StorageError::wrong_type(key, "set"));
        };
        let added = members.insert(member.to_owned());
        if let Some(ttl) = ttl {
            slot.expires_at = deadline(ttl);
        }
        Ok(added)
    }

    async fn set_remove(&self, key: &str, member: &str) -> StorageResult<bool> {
        let mut data = self.data.write();
        match live_mut(&mut data, key) {
            None => Ok(false),
            Some(Slot { entry: Entry::Set(members), .. }) => {
                let removed = members.remove(member);
                if members.is_empty() {
                    data.remove(key);
                }
                Ok(removed)
            },
            Some(_) => Err(StorageError::wrong_type(key, "set")),
        }
    }

    async fn set_is_member(&self, key: &str, member: &str) -> StorageResult<bool> {
        let data = self.data.read();
        match live(&data, key) {
            None => Ok(false),
            Some(Slot { entry: Entry::Set(members), .. }) => Ok(members.contains(member)),
            Some(_) => Err(StorageError::wrong_type(key, "set")),
        }
    }

    async fn set_members(&self, key: &str) -> StorageResult<Vec<String>> {
        let data = self.data.read();
        match live(&data, key) {
            None => Ok(Vec::new()),
            Some(Slot { entry: Entry::Set(members), .. }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(StorageError::wrong_type(key, "set")),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        let mut data = self.data.write();
        match live_mut(&mut data, key) {
            Some(slot) => {
                slot.expires_at = deadline(ttl);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>> {
        let data = self.data.read();
        Ok(live(&data, key)
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn health_check(&self) -> StorageResult<()> {
        fail::fail_point!("store-health-check", |_| {
            Err(StorageError::connection("injected health check failure"))
        });
        let _unused = self.data.read();
        Ok(())
    }
}
