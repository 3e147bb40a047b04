//! Compute instance pool.
//!
//! Creating a compute instance is expensive, so the pool keeps up to
//! `capacity` live instances per process and deduplicates cold starts:
//!
//! ```text
//! get(key) ─▶ hit? ──yes──▶ refresh last_accessed, return
//!               │ no
//!               ▼
//!        in-process mutex(key)        one creator per process
//!               ▼
//!        distributed lock(instance:key)  one creator across processes
//!               ▼
//!        re-check ─▶ create ─▶ insert (evicting the LRU entry if full)
//! ```
//!
//! Pooled instances are never shared between processes; only their
//! creation is serialized. Eviction only drops the pool's reference: an
//! instance is disposed once the pool and every caller still running on it
//! have released it.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use async_trait::async_trait;
use calcplane_storage::KvStore;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::{
    compute::{ComputeFault, ComputeInstance, Values},
    config::PoolConfig,
    error::Result,
    lock::DistributedLock,
    mutex::ResourceMutexRegistry,
    validator::SanitizedUpdate,
};

/// Handle given out by the pool. Dropping the last clone disposes the
/// engine.
struct Lease {
    key: String,
    instance: Arc<dyn ComputeInstance>,
}

#[async_trait]
impl ComputeInstance for Lease {
    async fn apply(&self, inputs: &Values) -> std::result::Result<Values, ComputeFault> {
        self.instance.apply(inputs).await
    }

    async fn write_cells(&self, update: &SanitizedUpdate) -> std::result::Result<(), ComputeFault> {
        self.instance.write_cells(update).await
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.instance.dispose();
        debug!(key = %self.key, "compute instance disposed");
    }
}

struct PooledInstance {
    instance: Arc<dyn ComputeInstance>,
    last_accessed_at: Instant,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live instances.
    pub len: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Lookups served by an existing instance.
    pub hits: u64,
    /// Instances created.
    pub creations: u64,
    /// Instances evicted to make room.
    pub evictions: u64,
}

/// LRU pool of compute instances keyed by resource.
pub struct InstancePool {
    entries: Mutex<HashMap<String, PooledInstance>>,
    capacity: usize,
    creators: ResourceMutexRegistry,
    lock: DistributedLock,
    hits: AtomicU64,
    creations: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl InstancePool {
    /// Creates an empty pool whose cold starts are serialized through
    /// `store`.
    pub fn new(store: Arc<dyn KvStore>, config: &PoolConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: config.capacity(),
            creators: ResourceMutexRegistry::new(),
            lock: DistributedLock::new(store, config.lock().clone()),
            hits: AtomicU64::new(0),
            creations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Returns the instance for `key`, calling `create` only if no instance
    /// exists yet.
    ///
    /// Concurrent callers for the same cold key share a single `create`
    /// call and all receive the same instance.
    ///
    /// # Errors
    ///
    /// - [`ControlError::LockTimeout`](crate::ControlError::LockTimeout) if
    ///   another process holds the creation lock too long
    /// - [`ControlError::Storage`](crate::ControlError::Storage) if the lock
    ///   store fails
    /// - whatever `create` returns
    #[instrument(skip(self, create), fields(key = %key))]
    pub async fn get<F, Fut>(&self, key: &str, create: F) -> Result<Arc<dyn ComputeInstance>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn ComputeInstance>>>,
    {
        if let Some(instance) = self.touch(key) {
            return Ok(instance);
        }

        self.creators
            .with_lock(key, || async {
                if let Some(instance) = self.touch(key) {
                    return Ok(instance);
                }
                self.lock
                    .with_lock(&instance_lock_key(key), || async {
                        if let Some(instance) = self.touch(key) {
                            return Ok(instance);
                        }
                        let started = Instant::now();
                        let instance: Arc<dyn ComputeInstance> =
                            Arc::new(Lease { key: key.to_owned(), instance: create().await? });
                        self.creations.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "compute instance created"
                        );
                        self.insert(key, Arc::clone(&instance));
                        Ok(instance)
                    })
                    .await
            })
            .await
    }

    /// Returns the instance for `key` without creating one.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<Arc<dyn ComputeInstance>> {
        self.entries.lock().get(key).map(|entry| Arc::clone(&entry.instance))
    }

    /// Returns `true` if an instance for `key` is pooled.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Evicts the instance for `key`. It is disposed once no caller holds
    /// it any more.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.entries.lock().remove(key);
        removed.is_some()
    }

    /// Evicts every instance, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        info!(
            audit.action = "pool_clear",
            audit.resource = "instance_pool",
            audit.result = "success",
            instances = drained.len(),
            "instance pool cleared"
        );
        drained.len()
    }

    /// Live instance count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no instances are pooled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            len: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            creations: self.creations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn touch(&self, key: &str) -> Option<Arc<dyn ComputeInstance>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.last_accessed_at = Instant::now();
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(&entry.instance))
    }

    fn insert(&self, key: &str, instance: Arc<dyn ComputeInstance>) {
        let evicted = {
            let mut entries = self.entries.lock();
            let lru_key = if !entries.contains_key(key) && entries.len() >= self.capacity {
                entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_accessed_at)
                    .map(|(lru_key, _)| lru_key.clone())
            } else {
                None
            };
            let evicted = lru_key.and_then(|lru_key| entries.remove_entry(&lru_key));
            entries.insert(
                key.to_owned(),
                PooledInstance { instance, last_accessed_at: Instant::now() },
            );
            evicted
        };

        if let Some((evicted_key, entry)) = evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(evicted = %evicted_key, "evicted least recently used instance");
            drop(entry);
        }
    }
}

fn instance_lock_key(key: &str) -> String {
    format!("instance:{key}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use calcplane_storage::MemoryStore;

    use super::*;
    use crate::{
        ControlError,
        testutil::{CountingProvider, create_with},
    };

    fn pool(capacity: usize) -> InstancePool {
        let config = PoolConfig::builder().capacity(capacity).build().unwrap();
        InstancePool::new(Arc::new(MemoryStore::new()), &config)
    }

    #[tokio::test]
    async fn test_hit_reuses_instance() {
        let pool = pool(4);
        let provider = CountingProvider::new();

        let first = pool.get("svc", create_with(&provider, "svc")).await.unwrap();
        let second = pool.get("svc", create_with(&provider, "svc")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.creations(), 1);
        assert_eq!(pool.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_full_pool_evicts_least_recently_used() {
        let pool = pool(2);
        let provider = CountingProvider::new();

        pool.get("a", create_with(&provider, "a")).await.unwrap();
        pool.get("b", create_with(&provider, "b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        pool.get("a", create_with(&provider, "a")).await.unwrap();
        pool.get("c", create_with(&provider, "c")).await.unwrap();

        assert!(pool.contains("a"));
        assert!(!pool.contains("b"));
        assert!(pool.contains("c"));
        assert!(provider.instance("b").unwrap().is_disposed());
        assert!(!provider.instance("a").unwrap().is_disposed());

        let stats = pool.stats();
        assert_eq!(stats.len, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.creations, 3);
    }

    #[tokio::test]
    async fn test_create_failure_is_not_pooled() {
        let pool = pool(4);
        let result = pool
            .get("svc", || async {
                Err(ControlError::ComputeFault(crate::ComputeFault::new("license unavailable")))
            })
            .await;
        assert!(matches!(result, Err(ControlError::ComputeFault(_))));
        assert!(pool.is_empty());

        let provider = CountingProvider::new();
        pool.get("svc", create_with(&provider, "svc")).await.unwrap();
        assert_eq!(provider.creations(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_clear_dispose() {
        let pool = pool(4);
        let provider = CountingProvider::new();
        pool.get("a", create_with(&provider, "a")).await.unwrap();
        pool.get("b", create_with(&provider, "b")).await.unwrap();

        assert!(pool.remove("a"));
        assert!(!pool.remove("a"));
        assert!(provider.instance("a").unwrap().is_disposed());

        assert_eq!(pool.clear(), 1);
        assert!(pool.is_empty());
        assert!(provider.instance("b").unwrap().is_disposed());
    }

    #[tokio::test]
    async fn test_evicted_instance_outlives_its_callers() {
        let pool = pool(1);
        let provider = CountingProvider::new();
        let held = pool.get("a", create_with(&provider, "a")).await.unwrap();

        pool.get("b", create_with(&provider, "b")).await.unwrap();
        assert!(!pool.contains("a"));
        assert!(!provider.instance("a").unwrap().is_disposed());

        assert!(held.apply(&Values::new()).await.is_ok());
        drop(held);
        assert!(provider.instance("a").unwrap().is_disposed());
    }
}
