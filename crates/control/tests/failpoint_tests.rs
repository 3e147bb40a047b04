#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection.
//!
//! These tests require both `failpoints` and `testutil` features:
//! ```bash
//! cargo test -p calcplane-control --features failpoints,testutil --test failpoint_tests
//! ```

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use calcplane_control::{
    CacheTier, ControlError, DistributedLock, LockConfig, ResultCache, ResultCacheConfig,
    fingerprint,
};
use calcplane_storage::{KvStore, MemoryBlobStore, MemoryStore};
use serde_json::json;

#[tokio::test]
async fn lock_acquire_failpoint_surfaces_storage_error() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("lock-before-acquire", "return").expect("failed to configure fail point");

    let lock = DistributedLock::new(Arc::new(MemoryStore::new()), LockConfig::default());
    let err = lock.acquire("sheet").await.unwrap_err();

    assert!(matches!(err, ControlError::Storage(_)), "got {err:?}");
    assert!(err.is_retryable());

    scenario.teardown();
}

#[tokio::test]
async fn lock_acquire_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();

    let lock = DistributedLock::new(Arc::new(MemoryStore::new()), LockConfig::default());
    let guard = lock.acquire("sheet").await.unwrap();
    assert!(guard.release().await.unwrap());

    scenario.teardown();
}

#[tokio::test]
async fn shared_tier_failure_falls_through_to_blob() {
    let scenario = fail::FailScenario::setup();

    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let config = ResultCacheConfig::builder().blob_threshold_bytes(0).build().unwrap();
    let fp = fingerprint("sheet", json!({ "a": 1 }).as_object().unwrap());

    let writer = ResultCache::new(config.clone())
        .with_shared(Arc::clone(&store))
        .with_blobs(blobs.clone());
    writer.store(&fp, Bytes::from_static(b"{\"sum\":1}"), Duration::from_secs(60)).await;

    fail::cfg("cache-before-shared-lookup", "return").expect("failed to configure fail point");
    let reader = ResultCache::new(config).with_shared(store).with_blobs(blobs);
    let entry = reader.lookup(&fp).await.expect("blob tier should serve the entry");

    assert_eq!(entry.tier, CacheTier::Blob);
    assert_eq!(reader.stats().tier_errors, 1);

    scenario.teardown();
}

#[tokio::test]
async fn shared_tier_failure_without_lower_tier_is_a_miss() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("cache-before-shared-lookup", "return").expect("failed to configure fail point");

    let cache = ResultCache::new(ResultCacheConfig::default())
        .with_shared(Arc::new(MemoryStore::new()));
    let fp = fingerprint("sheet", json!({}).as_object().unwrap());

    assert!(cache.lookup(&fp).await.is_none());
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.tier_errors, 1);

    scenario.teardown();
}
