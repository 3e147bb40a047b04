//! Multi-tier result cache.
//!
//! Three tiers are consulted in order, fastest first:
//!
//! | Tier | Backing | Bounded by |
//! |------|---------|------------|
//! | [`Memory`](CacheTier::Memory) | [`moka`] cache in this process | capacity and per-entry TTL |
//! | [`Shared`](CacheTier::Shared) | [`KvStore`] under `result:{fp}` | store-side key TTL |
//! | [`Blob`](CacheTier::Blob) | [`BlobStore`] under `results/{fp}.bin` | `blob_max_age` |
//!
//! A hit in a slower tier is written back into every faster tier. Only
//! payloads of at least `blob_threshold_bytes` are written to the blob tier.
//!
//! Caching is an optimization: a failing tier is logged, counted and treated
//! as a miss. Two requests racing on the same miss may both compute.
//!
//! Shared and blob entries carry an 8-byte big-endian write timestamp
//! (Unix milliseconds) ahead of the payload.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use calcplane_storage::{BlobStore, KvStore, StorageError, StorageResult, keys};
use chrono::{DateTime, Utc};
use fail::fail_point;
use moka::future::Cache;
use tracing::{debug, info, instrument, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::ResultCacheConfig,
    fingerprint::Fingerprint,
};

const ENVELOPE_HEADER_LEN: usize = 8;

/// Which tier served a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// Process memory.
    Memory,
    /// Shared key-value store.
    Shared,
    /// Durable blob store.
    Blob,
}

impl CacheTier {
    /// Lowercase tier name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Shared => "shared",
            Self::Blob => "blob",
        }
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Key the payload was stored under.
    pub fingerprint: Fingerprint,
    /// Cached bytes.
    pub payload: Bytes,
    /// Tier that served the hit.
    pub tier: CacheTier,
    /// When the payload was originally computed and stored.
    pub written_at: DateTime<Utc>,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Hits served from process memory.
    pub memory_hits: u64,
    /// Hits served from the shared store.
    pub shared_hits: u64,
    /// Hits served from the blob store.
    pub blob_hits: u64,
    /// Lookups that missed every tier.
    pub misses: u64,
    /// Tier operations that failed and were treated as misses.
    pub tier_errors: u64,
}

impl CacheStats {
    /// Total hits across tiers.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.memory_hits + self.shared_hits + self.blob_hits
    }
}

#[derive(Clone)]
struct MemoryEntry {
    payload: Bytes,
    written_at_ms: i64,
    ttl: Duration,
}

struct MemoryExpiry;

impl moka::Expiry<String, MemoryEntry> for MemoryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &MemoryEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    shared_hits: AtomicU64,
    blob_hits: AtomicU64,
    misses: AtomicU64,
    tier_errors: AtomicU64,
}

/// Memory → shared store → blob store result cache.
pub struct ResultCache {
    memory: Cache<String, MemoryEntry>,
    shared: Option<Arc<dyn KvStore>>,
    blobs: Option<Arc<dyn BlobStore>>,
    config: ResultCacheConfig,
    clock: Arc<dyn Clock>,
    /// Bumped by `invalidate`; a lookup that observes a change while
    /// reading a slower tier skips its write-back.
    generation: AtomicU64,
    counters: Counters,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("config", &self.config)
            .field("shared", &self.shared.is_some())
            .field("blobs", &self.blobs.is_some())
            .finish_non_exhaustive()
    }
}

impl ResultCache {
    /// Creates a memory-only cache.
    #[must_use]
    pub fn new(config: ResultCacheConfig) -> Self {
        let memory = Cache::builder()
            .max_capacity(config.memory_capacity())
            .expire_after(MemoryExpiry)
            .build();
        Self {
            memory,
            shared: None,
            blobs: None,
            config,
            clock: Arc::new(SystemClock),
            generation: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Adds the shared key-value tier.
    #[must_use]
    pub fn with_shared(mut self, store: Arc<dyn KvStore>) -> Self {
        self.shared = Some(store);
        self
    }

    /// Adds the durable blob tier.
    #[must_use]
    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Replaces the clock used for write timestamps and blob ages.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Looks `fingerprint` up in every tier, fastest first.
    #[instrument(skip(self), fields(fingerprint = %fingerprint.short()))]
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let key = fingerprint.as_str();

        if let Some(entry) = self.memory.get(key).await {
            debug!(cache = "memory", "cache hit");
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit(fingerprint, CacheTier::Memory, entry.payload, entry.written_at_ms));
        }
        debug!(cache = "memory", "cache miss");

        let generation = self.generation.load(Ordering::Acquire);

        if let Some(shared) = &self.shared {
            match shared_get(shared.as_ref(), key).await {
                Ok(Some((written_at_ms, payload))) => {
                    debug!(cache = "shared", "cache hit, populating memory");
                    self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
                    if self.generation.load(Ordering::Acquire) == generation {
                        self.fill_memory(key, &payload, written_at_ms, self.config.memory_ttl())
                            .await;
                    }
                    return Some(hit(fingerprint, CacheTier::Shared, payload, written_at_ms));
                },
                Ok(None) => debug!(cache = "shared", "cache miss"),
                Err(err) => self.tier_failed(CacheTier::Shared, &err),
            }
        }

        if let Some(blobs) = &self.blobs {
            match blobs.get(&keys::result_blob(key)).await {
                Ok(Some(raw)) => match decode_envelope(&raw) {
                    Some((written_at_ms, payload)) if self.is_fresh_blob(written_at_ms) => {
                        debug!(cache = "blob", "cache hit, populating shared and memory");
                        self.counters.blob_hits.fetch_add(1, Ordering::Relaxed);
                        if self.generation.load(Ordering::Acquire) == generation {
                            self.fill_shared(key, &payload, written_at_ms, self.config.shared_ttl())
                                .await;
                            self.fill_memory(
                                key,
                                &payload,
                                written_at_ms,
                                self.config.memory_ttl(),
                            )
                            .await;
                        }
                        return Some(hit(fingerprint, CacheTier::Blob, payload, written_at_ms));
                    },
                    Some(_) => debug!(cache = "blob", "entry past max age"),
                    None => warn!(cache = "blob", "discarding malformed entry"),
                },
                Ok(None) => debug!(cache = "blob", "cache miss"),
                Err(err) => self.tier_failed(CacheTier::Blob, &err),
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores `payload` under `fingerprint` in every applicable tier.
    ///
    /// `ttl` bounds the shared entry; the memory entry additionally never
    /// outlives `memory_ttl`.
    #[instrument(skip(self, payload), fields(fingerprint = %fingerprint.short(), bytes = payload.len()))]
    pub async fn store(&self, fingerprint: &Fingerprint, payload: Bytes, ttl: Duration) {
        let key = fingerprint.as_str();
        let written_at_ms = self.clock.now_ms();

        self.fill_memory(key, &payload, written_at_ms, ttl.min(self.config.memory_ttl())).await;
        self.fill_shared(key, &payload, written_at_ms, ttl).await;

        if payload.len() >= self.config.blob_threshold_bytes()
            && let Some(blobs) = &self.blobs
        {
            let envelope = Bytes::from(encode_envelope(written_at_ms, &payload));
            if let Err(err) = blobs.put(&keys::result_blob(key), envelope).await {
                self.tier_failed(CacheTier::Blob, &err);
            }
        }
    }

    /// Removes `fingerprint` from every tier.
    pub async fn invalidate(&self, fingerprint: &Fingerprint) {
        let key = fingerprint.as_str();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.memory.invalidate(key).await;

        if let Some(shared) = &self.shared
            && let Err(err) = shared.delete(&keys::result(key)).await
        {
            self.tier_failed(CacheTier::Shared, &err);
        }
        if let Some(blobs) = &self.blobs
            && let Err(err) = blobs.delete(&keys::result_blob(key)).await
        {
            self.tier_failed(CacheTier::Blob, &err);
        }

        info!(
            audit.action = "invalidate_result",
            audit.resource = %format_args!("result:{}", fingerprint.short()),
            audit.result = "success",
            "audit_event"
        );
    }

    /// Drops every in-memory entry. Shared and blob tiers are untouched.
    pub fn clear_memory(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.memory.invalidate_all();
    }

    /// Snapshot of cache counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            shared_hits: self.counters.shared_hits.load(Ordering::Relaxed),
            blob_hits: self.counters.blob_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            tier_errors: self.counters.tier_errors.load(Ordering::Relaxed),
        }
    }

    async fn fill_memory(&self, key: &str, payload: &Bytes, written_at_ms: i64, ttl: Duration) {
        let entry = MemoryEntry { payload: payload.clone(), written_at_ms, ttl };
        self.memory.insert(key.to_owned(), entry).await;
    }

    async fn fill_shared(&self, key: &str, payload: &[u8], written_at_ms: i64, ttl: Duration) {
        let Some(shared) = &self.shared else {
            return;
        };
        let envelope = encode_envelope(written_at_ms, payload);
        if let Err(err) = shared.set_with_ttl(&keys::result(key), envelope, ttl).await {
            self.tier_failed(CacheTier::Shared, &err);
        }
    }

    fn is_fresh_blob(&self, written_at_ms: i64) -> bool {
        let age_ms = self.clock.now_ms().saturating_sub(written_at_ms);
        u128::try_from(age_ms).map_or(true, |age| age < self.config.blob_max_age().as_millis())
    }

    fn tier_failed(&self, tier: CacheTier, err: &StorageError) {
        self.counters.tier_errors.fetch_add(1, Ordering::Relaxed);
        warn!(cache = tier.as_str(), error = %err, "cache tier unavailable, treating as miss");
    }
}

async fn shared_get(shared: &dyn KvStore, key: &str) -> StorageResult<Option<(i64, Bytes)>> {
    fail_point!("cache-before-shared-lookup", |_| {
        Err(StorageError::connection("injected shared cache failure"))
    });

    let Some(raw) = shared.get(&keys::result(key)).await? else {
        return Ok(None);
    };
    match decode_envelope(&raw) {
        Some(decoded) => Ok(Some(decoded)),
        None => {
            warn!(cache = "shared", "discarding malformed entry");
            Ok(None)
        },
    }
}

fn hit(fingerprint: &Fingerprint, tier: CacheTier, payload: Bytes, written_at_ms: i64) -> CacheEntry {
    CacheEntry {
        fingerprint: fingerprint.clone(),
        payload,
        tier,
        written_at: DateTime::from_timestamp_millis(written_at_ms).unwrap_or_default(),
    }
}

fn encode_envelope(written_at_ms: i64, payload: &[u8]) -> Vec<u8> {
    let mut envelope = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    envelope.extend_from_slice(&written_at_ms.to_be_bytes());
    envelope.extend_from_slice(payload);
    envelope
}

fn decode_envelope(raw: &Bytes) -> Option<(i64, Bytes)> {
    let header: [u8; ENVELOPE_HEADER_LEN] = raw.get(..ENVELOPE_HEADER_LEN)?.try_into().ok()?;
    Some((i64::from_be_bytes(header), raw.slice(ENVELOPE_HEADER_LEN..)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use calcplane_storage::{MemoryBlobStore, MemoryStore, testutil::FailingStore};
    use serde_json::json;

    use super::*;
    use crate::{clock::ManualClock, fingerprint::fingerprint};

    fn fp(n: i64) -> Fingerprint {
        let inputs = json!({ "n": n });
        fingerprint("svc", inputs.as_object().unwrap())
    }

    fn small_threshold() -> ResultCacheConfig {
        ResultCacheConfig::builder().blob_threshold_bytes(4).build().unwrap()
    }

    #[tokio::test]
    async fn test_store_then_memory_hit() {
        let cache = ResultCache::new(ResultCacheConfig::default());
        cache.store(&fp(1), Bytes::from_static(b"{\"y\":2}"), Duration::from_secs(60)).await;

        let entry = cache.lookup(&fp(1)).await.unwrap();
        assert_eq!(entry.tier, CacheTier::Memory);
        assert_eq!(entry.payload.as_ref(), b"{\"y\":2}");
        assert!(cache.lookup(&fp(2)).await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_shared_hit_populates_memory() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let writer = ResultCache::new(ResultCacheConfig::default()).with_shared(Arc::clone(&store));
        let reader = ResultCache::new(ResultCacheConfig::default()).with_shared(store);

        writer.store(&fp(1), Bytes::from_static(b"42"), Duration::from_secs(60)).await;

        let first = reader.lookup(&fp(1)).await.unwrap();
        assert_eq!(first.tier, CacheTier::Shared);
        assert_eq!(first.payload.as_ref(), b"42");

        let second = reader.lookup(&fp(1)).await.unwrap();
        assert_eq!(second.tier, CacheTier::Memory);
        assert_eq!(second.written_at, first.written_at);
    }

    #[tokio::test]
    async fn test_blob_hit_populates_faster_tiers() {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let writer = ResultCache::new(small_threshold()).with_blobs(blobs.clone());
        writer.store(&fp(1), Bytes::from_static(b"large payload"), Duration::from_secs(60)).await;
        assert_eq!(blobs.len(), 1);

        let reader = ResultCache::new(small_threshold())
            .with_shared(store.clone())
            .with_blobs(blobs);
        let entry = reader.lookup(&fp(1)).await.unwrap();
        assert_eq!(entry.tier, CacheTier::Blob);

        assert!(store.get(&keys::result(fp(1).as_str())).await.unwrap().is_some());
        assert_eq!(reader.lookup(&fp(1)).await.unwrap().tier, CacheTier::Memory);
    }

    #[tokio::test]
    async fn test_small_payloads_skip_blob_tier() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let cache = ResultCache::new(small_threshold()).with_blobs(blobs.clone());
        cache.store(&fp(1), Bytes::from_static(b"abc"), Duration::from_secs(60)).await;
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_stale_blob_entry_is_a_miss() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let blobs = Arc::new(MemoryBlobStore::new());
        let config = ResultCacheConfig::builder()
            .blob_threshold_bytes(0)
            .blob_max_age(Duration::from_secs(10))
            .build()
            .unwrap();
        let writer = ResultCache::new(config.clone()).with_blobs(blobs.clone()).with_clock(clock.clone());
        writer.store(&fp(1), Bytes::from_static(b"x"), Duration::from_secs(60)).await;

        clock.advance_ms(10_001);
        let reader = ResultCache::new(config).with_blobs(blobs).with_clock(clock);
        assert!(reader.lookup(&fp(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_failing_tiers_are_swallowed() {
        let failing = Arc::new(FailingStore::new());
        let cache = ResultCache::new(small_threshold())
            .with_shared(failing.clone())
            .with_blobs(failing.clone());

        cache.store(&fp(1), Bytes::from_static(b"payload"), Duration::from_secs(60)).await;
        assert_eq!(cache.lookup(&fp(1)).await.unwrap().tier, CacheTier::Memory);
        assert!(cache.lookup(&fp(2)).await.is_none());

        let stats = cache.stats();
        assert!(stats.tier_errors >= 4);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_invalidate_clears_all_tiers() {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let cache = ResultCache::new(small_threshold())
            .with_shared(store.clone())
            .with_blobs(blobs.clone());

        cache.store(&fp(1), Bytes::from_static(b"payload"), Duration::from_secs(60)).await;
        cache.invalidate(&fp(1)).await;

        assert!(cache.lookup(&fp(1)).await.is_none());
        assert!(store.is_empty());
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_memory_ttl_caps_entry_lifetime() {
        let config = ResultCacheConfig::builder().memory_ttl(Duration::from_millis(30)).build().unwrap();
        let cache = ResultCache::new(config);
        cache.store(&fp(1), Bytes::from_static(b"x"), Duration::from_secs(3600)).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.lookup(&fp(1)).await.is_none());
    }

    #[test]
    fn test_envelope_rejects_short_input() {
        assert!(decode_envelope(&Bytes::from_static(b"short")).is_none());
        let (ts, payload) = decode_envelope(&Bytes::from(encode_envelope(7, b"abc"))).unwrap();
        assert_eq!(ts, 7);
        assert_eq!(payload.as_ref(), b"abc");
    }
}
