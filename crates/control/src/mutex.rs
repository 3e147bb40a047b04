//! In-process mutual exclusion keyed by resource.
//!
//! [`ResourceMutexRegistry`] serializes async critical sections that share a
//! resource key while leaving distinct keys fully concurrent. Waiters are
//! served in arrival order because each key is backed by a fair
//! [`tokio::sync::Mutex`].
//!
//! Entries are removed as soon as nobody holds or waits on a key, so the
//! registry only ever contains keys that are in use.

use std::{collections::HashMap, future::Future, sync::Arc};

use parking_lot::Mutex;

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Per-key async mutex table.
#[derive(Debug, Default)]
pub struct ResourceMutexRegistry {
    locks: Mutex<HashMap<String, KeyLock>>,
}

impl ResourceMutexRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the lock for `key`.
    ///
    /// The lock is released when `f`'s future completes, returns an error,
    /// panics, or is dropped before completion.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        // Declaration order matters: the guard drops first, then our handle
        // on the key lock, then the cleanup check.
        let _cleanup = Cleanup { locks: &self.locks, key };
        let lock = Arc::clone(self.locks.lock().entry(key.to_owned()).or_default());
        let _guard = lock.lock().await;
        f().await
    }

    /// Returns `true` if some caller currently holds or waits on `key`.
    #[must_use]
    pub fn is_active(&self, key: &str) -> bool {
        self.locks.lock().contains_key(key)
    }

    /// Number of keys currently held or awaited.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.locks.lock().len()
    }
}

struct Cleanup<'a> {
    locks: &'a Mutex<HashMap<String, KeyLock>>,
    key: &'a str,
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        if locks.get(self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(self.key);
        }
    }
}
