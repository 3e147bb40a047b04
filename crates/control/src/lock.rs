//! Advisory distributed locks over a shared [`KvStore`].
//!
//! A lock is a key `lock:{resource}` whose value is a random owner id,
//! written with [`KvStore::set_if_absent`] and an expiry. Release goes
//! through [`KvStore::compare_and_delete`], so a holder whose lock already
//! expired and was re-acquired by someone else cannot delete the new
//! holder's lock.
//!
//! Locks are self-expiring. A crashed holder blocks other processes for at
//! most one TTL.
//!
//! # Acquisition
//!
//! Acquisition polls with exponential backoff plus 0-50% jitter, capped at
//! [`LockConfig::max_backoff`], until the acquisition deadline passes:
//!
//! ```text
//! attempt 0: set_if_absent ─ held ──▶ sleep ~initial_backoff
//! attempt 1: set_if_absent ─ held ──▶ sleep ~2×initial_backoff
//! ...
//! deadline reached ─────────────────▶ ControlError::LockTimeout
//! ```

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use calcplane_storage::{KvStore, keys};
use chrono::{DateTime, Utc};
use fail::fail_point;
use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::{
    config::LockConfig,
    error::{ControlError, Result},
};

/// Proof of a held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTicket {
    /// Resource the lock protects.
    pub resource_key: String,
    /// Random value identifying this acquisition.
    pub owner_id: String,
    /// When the store will expire the lock if it is never released.
    pub expires_at: DateTime<Utc>,
}

/// Distributed lock client.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
    config: LockConfig,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock").field("config", &self.config).finish_non_exhaustive()
    }
}

impl DistributedLock {
    /// Creates a lock client over `store`.
    pub fn new(store: Arc<dyn KvStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Lock settings in use.
    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquires `resource_key` using the configured TTL and deadline.
    ///
    /// # Errors
    ///
    /// - [`ControlError::LockTimeout`] if the lock stays held past the deadline
    /// - [`ControlError::Storage`] if the store fails
    pub async fn acquire(&self, resource_key: &str) -> Result<LockGuard> {
        self.acquire_with(resource_key, self.config.ttl(), self.config.acquire_timeout()).await
    }

    /// Acquires `resource_key` with an explicit TTL and acquisition deadline.
    ///
    /// # Errors
    ///
    /// See [`DistributedLock::acquire`].
    #[instrument(skip(self), fields(resource = %resource_key))]
    pub async fn acquire_with(
        &self,
        resource_key: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockGuard> {
        let started = Instant::now();
        // `None` waits without limit.
        let deadline = started.checked_add(wait);
        let mut attempt: u32 = 0;

        loop {
            if let Some(guard) = self.try_acquire(resource_key, ttl).await? {
                debug!(attempts = attempt + 1, "lock acquired");
                return Ok(guard);
            }

            let now = Instant::now();
            let mut delay = self.backoff(attempt);
            if let Some(deadline) = deadline {
                if now >= deadline {
                    let waited = now.duration_since(started);
                    warn!(waited_ms = waited.as_millis() as u64, "lock acquisition timed out");
                    return Err(ControlError::lock_timeout(resource_key, waited));
                }
                delay = delay.min(deadline - now);
            }
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Makes a single acquisition attempt.
    ///
    /// Returns `Ok(None)` if another owner holds the lock.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Storage`] if the store fails.
    pub async fn try_acquire(&self, resource_key: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        fail_point!("lock-before-acquire", |_| {
            Err(calcplane_storage::StorageError::connection("injected lock store failure").into())
        });

        let owner_id = new_owner_id();
        let lock_key = keys::lock(resource_key);
        let acquired =
            self.store.set_if_absent(&lock_key, owner_id.clone().into_bytes(), ttl).await?;
        if !acquired {
            return Ok(None);
        }

        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Ok(Some(LockGuard {
            store: Arc::clone(&self.store),
            lock_key,
            ticket: LockTicket { resource_key: resource_key.to_owned(), owner_id, expires_at },
            released: false,
        }))
    }

    /// Runs `f` while holding the lock on `resource_key`, releasing it
    /// afterwards whether `f` succeeds or fails.
    ///
    /// # Errors
    ///
    /// Returns acquisition errors, or whatever `f` returns.
    pub async fn with_lock<F, Fut, T>(&self, resource_key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(resource_key).await?;
        let outcome = f().await;
        if let Err(err) = guard.release().await {
            warn!(resource = %resource_key, error = %err, "lock release failed, lock will expire");
        }
        outcome
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .initial_backoff()
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = base.min(self.config.max_backoff());

        // 0-50% jitter
        let jitter_range = capped.as_millis() as u64 / 2;
        if jitter_range > 0 {
            capped + Duration::from_millis(rand::rng().random_range(0..=jitter_range))
        } else {
            capped
        }
    }
}

fn new_owner_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// A held lock.
///
/// Call [`release`](LockGuard::release) to free the lock promptly. A guard
/// dropped without release schedules a best-effort release on the current
/// Tokio runtime; without a runtime the lock simply expires.
#[must_use = "dropping a LockGuard releases the lock in the background"]
pub struct LockGuard {
    store: Arc<dyn KvStore>,
    lock_key: String,
    ticket: LockTicket,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("ticket", &self.ticket)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    /// The acquisition this guard represents.
    #[must_use]
    pub fn ticket(&self) -> &LockTicket {
        &self.ticket
    }

    /// Owner id written to the store.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.ticket.owner_id
    }

    /// Releases the lock if this guard still owns it.
    ///
    /// Returns `false` if the lock had already expired or been taken over.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Storage`] if the store fails; the lock then
    /// expires on its own.
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        let released = self
            .store
            .compare_and_delete(&self.lock_key, self.ticket.owner_id.as_bytes())
            .await?;
        if !released {
            debug!(resource = %self.ticket.resource_key, "lock already expired or taken over");
        }
        Ok(released)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let lock_key = std::mem::take(&mut self.lock_key);
        let owner_id = std::mem::take(&mut self.ticket.owner_id);
        handle.spawn(async move {
            if let Err(err) = store.compare_and_delete(&lock_key, owner_id.as_bytes()).await {
                warn!(key = %lock_key, error = %err, "background lock release failed");
            }
        });
    }
}
