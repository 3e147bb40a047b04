//! Fixed-window rate limiting.
//!
//! Each identifier gets `max` requests per window. Windows are aligned to
//! multiples of the window length:
//!
//! ```text
//! window_start = floor(now_ms / window_ms) * window_ms
//! ```
//!
//! A client can burst up to `2 * max` requests across a window boundary.
//!
//! Two implementations share the [`RateLimiter`] trait:
//!
//! - [`FixedWindowLimiter`]: per-process counters, pruned as requests arrive
//! - [`StoreRateLimiter`]: counters shared through [`KvStore::increment`],
//!   expired by the store

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use calcplane_storage::{KvStore, keys};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::RateLimitConfig,
    error::{ControlError, Result},
};

/// Outcome of an allowed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Always `true`; rejected requests return
    /// [`ControlError::RateLimitExceeded`] instead.
    pub allowed: bool,
    /// Requests allowed per window.
    pub limit: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Unix milliseconds at which the current window ends.
    pub reset_at_ms: i64,
}

/// Per-identifier request budget.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Counts one request for `identifier`.
    ///
    /// # Errors
    ///
    /// - [`ControlError::RateLimitExceeded`] once the window's budget is spent
    /// - [`ControlError::Storage`] if a shared counter cannot be updated
    async fn check(&self, identifier: &str, window: Duration, max: u32)
    -> Result<RateLimitDecision>;
}

struct Window {
    start_ms: i64,
    end_ms: i64,
}

impl Window {
    fn containing(now_ms: i64, window: Duration) -> Self {
        let len = i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1);
        let start_ms = now_ms.div_euclid(len) * len;
        Self { start_ms, end_ms: start_ms.saturating_add(len) }
    }
}

fn decide(
    identifier: &str,
    count: u64,
    max: u32,
    window: &Window,
    now_ms: i64,
) -> Result<RateLimitDecision> {
    if count > u64::from(max) {
        let retry_after_ms = u64::try_from(window.end_ms - now_ms).unwrap_or(0);
        debug!(identifier, count, max, "rate limit exceeded");
        return Err(ControlError::RateLimitExceeded {
            identifier: identifier.to_owned(),
            reset_at_ms: window.end_ms,
            retry_after: Duration::from_millis(retry_after_ms),
        });
    }
    Ok(RateLimitDecision {
        allowed: true,
        limit: max,
        remaining: u32::try_from(u64::from(max) - count).unwrap_or(0),
        reset_at_ms: window.end_ms,
    })
}

struct Counter {
    count: u64,
    end_ms: i64,
}

/// In-process fixed-window limiter.
///
/// Ended windows are dropped by the first request arriving at least one
/// prune interval after the previous sweep, so the counter map stays bounded
/// by the identifiers seen within roughly one window.
pub struct FixedWindowLimiter {
    counters: Mutex<Counters>,
    clock: Arc<dyn Clock>,
    prune_interval_ms: i64,
}

struct Counters {
    windows: HashMap<(String, i64), Counter>,
    last_prune_ms: i64,
}

impl Counters {
    fn prune(&mut self, now_ms: i64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, counter| counter.end_ms > now_ms);
        self.last_prune_ms = now_ms;
        before - self.windows.len()
    }
}

impl std::fmt::Debug for FixedWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("tracked_windows", &self.tracked_windows())
            .field("prune_interval_ms", &self.prune_interval_ms)
            .finish_non_exhaustive()
    }
}

impl Default for FixedWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl FixedWindowLimiter {
    /// Creates a limiter on the system clock with the default prune interval.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a limiter on `clock` with the default prune interval.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now_ms = clock.now_ms();
        Self {
            counters: Mutex::new(Counters { windows: HashMap::new(), last_prune_ms: now_ms }),
            clock,
            prune_interval_ms: duration_ms(RateLimitConfig::default().prune_interval()),
        }
    }

    /// Creates a limiter on the system clock that prunes at the configured
    /// interval.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new().with_prune_interval(config.prune_interval())
    }

    /// Replaces the prune interval.
    #[must_use]
    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval_ms = duration_ms(interval).max(1);
        self
    }

    /// Counts one request at an explicit time.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::RateLimitExceeded`] once the budget is spent.
    pub fn check_at(
        &self,
        identifier: &str,
        window: Duration,
        max: u32,
        now_ms: i64,
    ) -> Result<RateLimitDecision> {
        let current = Window::containing(now_ms, window);
        let count = {
            let mut counters = self.counters.lock();
            if now_ms.saturating_sub(counters.last_prune_ms) >= self.prune_interval_ms {
                let pruned = counters.prune(now_ms);
                if pruned > 0 {
                    debug!(pruned, "pruned expired rate limit windows");
                }
            }
            let counter = counters
                .windows
                .entry((identifier.to_owned(), current.start_ms))
                .or_insert(Counter { count: 0, end_ms: current.end_ms });
            counter.count += 1;
            counter.count
        };
        decide(identifier, count, max, &current, now_ms)
    }

    /// Drops every window that has ended, returning how many were removed.
    pub fn prune(&self) -> usize {
        let now_ms = self.clock.now_ms();
        self.counters.lock().prune(now_ms)
    }

    /// Number of live `(identifier, window)` counters.
    #[must_use]
    pub fn tracked_windows(&self) -> usize {
        self.counters.lock().windows.len()
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn check(
        &self,
        identifier: &str,
        window: Duration,
        max: u32,
    ) -> Result<RateLimitDecision> {
        self.check_at(identifier, window, max, self.clock.now_ms())
    }
}

/// Fixed-window limiter shared across processes through a [`KvStore`].
///
/// Counters live under `ratelimit:{identifier}:{window_start_ms}` and are
/// created with a TTL of one window, so the store prunes them.
#[derive(Clone)]
pub struct StoreRateLimiter {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for StoreRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRateLimiter").finish_non_exhaustive()
    }
}

impl StoreRateLimiter {
    /// Creates a limiter over `store` on the system clock.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store, clock: Arc::new(SystemClock) }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl RateLimiter for StoreRateLimiter {
    async fn check(
        &self,
        identifier: &str,
        window: Duration,
        max: u32,
    ) -> Result<RateLimitDecision> {
        let now_ms = self.clock.now_ms();
        let current = Window::containing(now_ms, window);
        let key = keys::rate_limit(identifier, current.start_ms);

        let count = self.store.increment(&key, 1, Some(window)).await.map_err(|err| {
            warn!(identifier, error = %err, "rate limit counter unavailable");
            ControlError::from(err)
        })?;
        decide(identifier, u64::try_from(count).unwrap_or(0), max, &current, now_ms)
    }
}
