#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end calculation flow through `CalculationService`.
//!
//! Requires the `testutil` feature:
//! ```bash
//! cargo test -p calcplane-control --features testutil --test calculation_flow
//! ```

use std::{sync::Arc, time::Duration};

use calcplane_control::{
    CacheTier, CalculationRequest, CalculationService, CellAddress, CellWrite, ControlError,
    ControlPlaneConfig, InstancePool, Mutation, PoolConfig, RateLimitConfig, ResultCache,
    ResultCacheConfig, StoreVersionMap, ValidationError, testutil::CountingProvider,
};
use calcplane_storage::{KvStore, MemoryBlobStore, MemoryStore, keys};
use serde_json::{Value, json};

struct Harness {
    store: Arc<dyn KvStore>,
    blobs: Arc<MemoryBlobStore>,
}

impl Harness {
    fn new() -> Self {
        Self { store: Arc::new(MemoryStore::new()), blobs: Arc::new(MemoryBlobStore::new()) }
    }

    /// A service as one process would build it; services built from the
    /// same harness share the store and blob tiers.
    fn service(&self, provider: Arc<CountingProvider>) -> CalculationService {
        let cache_config = ResultCacheConfig::builder().blob_threshold_bytes(16).build().unwrap();
        CalculationService::builder()
            .provider(provider)
            .pool(InstancePool::new(Arc::clone(&self.store), &PoolConfig::default()))
            .cache(
                ResultCache::new(cache_config)
                    .with_shared(Arc::clone(&self.store))
                    .with_blobs(self.blobs.clone()),
            )
            .versions(Arc::new(StoreVersionMap::new(Arc::clone(&self.store))))
            .build()
    }
}

fn request(inputs: Value) -> CalculationRequest {
    CalculationRequest {
        service_id: "mortgage".into(),
        inputs: inputs.as_object().cloned().unwrap(),
        mutation: None,
    }
}

fn mutation(cells: Vec<CellWrite>, expected_version: Option<u64>) -> Mutation {
    Mutation { area: "inputs".into(), allowed_area: "B2:D10".into(), cells, expected_version }
}

#[tokio::test]
async fn miss_computes_then_hits_memory() {
    let harness = Harness::new();
    let provider = Arc::new(CountingProvider::new());
    let service = harness.service(provider.clone());

    let first = service.calculate(&request(json!({ "a": 1, "b": 2 }))).await.unwrap();
    assert_eq!(first.cached, None);
    assert_eq!(first.outputs["sum"], json!(3.0));

    let second = service.calculate(&request(json!({ "b": "2.0", "a": 1 }))).await.unwrap();
    assert_eq!(second.cached, Some(CacheTier::Memory));
    assert_eq!(second.outputs, first.outputs);
    assert_eq!(second.fingerprint, first.fingerprint);

    assert_eq!(provider.creations(), 1);
    assert_eq!(provider.instance("mortgage").unwrap().applies(), 1);
}

#[tokio::test]
async fn second_process_hits_shared_tier_without_cold_start() {
    let harness = Harness::new();
    let provider_a = Arc::new(CountingProvider::new());
    let provider_b = Arc::new(CountingProvider::new());
    let process_a = harness.service(provider_a.clone());
    let process_b = harness.service(provider_b.clone());

    process_a.calculate(&request(json!({ "a": 1 }))).await.unwrap();
    let outcome = process_b.calculate(&request(json!({ "a": 1 }))).await.unwrap();

    assert_eq!(outcome.cached, Some(CacheTier::Shared));
    assert_eq!(provider_b.creations(), 0);
}

#[tokio::test]
async fn mutation_applies_bumps_version_and_retires_cached_results() {
    let harness = Harness::new();
    let provider = Arc::new(CountingProvider::new());
    let service = harness.service(provider.clone());

    let before = service.calculate(&request(json!({ "a": 1 }))).await.unwrap();
    assert_eq!(before.outputs["sum"], json!(1.0));

    let mut write = request(json!({ "a": 1 }));
    write.mutation = Some(mutation(vec![CellWrite::at("C3", 10).unwrap()], Some(0)));
    let written = service.calculate(&write).await.unwrap();
    assert_eq!(written.version, Some(1));
    assert_eq!(written.cached, None);
    assert_eq!(written.outputs["sum"], json!(11.0));
    assert_eq!(service.area_version("mortgage", "inputs").await.unwrap(), 1);

    let after = service.calculate(&request(json!({ "a": 1 }))).await.unwrap();
    assert_ne!(after.fingerprint, before.fingerprint);
    assert_eq!(after.outputs["sum"], json!(11.0));

    let instance = provider.instance("mortgage").unwrap();
    assert_eq!(instance.cell(CellAddress::new(2, 2)), Some(json!(10)));
}

#[tokio::test]
async fn stale_version_is_rejected_without_writing() {
    let harness = Harness::new();
    let provider = Arc::new(CountingProvider::new());
    let service = harness.service(provider.clone());

    let mut first = request(json!({}));
    first.mutation = Some(mutation(vec![CellWrite::new(1, 1, 1)], Some(0)));
    service.calculate(&first).await.unwrap();

    let mut stale = request(json!({}));
    stale.mutation = Some(mutation(vec![CellWrite::new(1, 1, 99)], Some(0)));
    let err = service.calculate(&stale).await.unwrap_err();
    assert!(matches!(err, ControlError::VersionConflict { expected: 0, actual: 1, .. }));

    let instance = provider.instance("mortgage").unwrap();
    assert_eq!(instance.cell(CellAddress::new(1, 1)), Some(json!(1)));

    // Refetching the version and retrying succeeds.
    let current = service.area_version("mortgage", "inputs").await.unwrap();
    let mut retry = request(json!({}));
    retry.mutation = Some(mutation(vec![CellWrite::new(1, 1, 99)], Some(current)));
    assert_eq!(service.calculate(&retry).await.unwrap().version, Some(2));
    assert_eq!(instance.cell(CellAddress::new(1, 1)), Some(json!(99)));
}

#[tokio::test]
async fn failed_write_leaves_versions_untouched() {
    let harness = Harness::new();
    let provider = Arc::new(CountingProvider::new());
    let service = harness.service(provider.clone());

    let before = service.calculate(&request(json!({ "a": 1 }))).await.unwrap();
    let instance = provider.instance("mortgage").unwrap();
    instance.fail_writes(true);

    let mut write = request(json!({ "a": 1 }));
    write.mutation = Some(mutation(vec![CellWrite::new(1, 1, 7)], Some(0)));
    let err = service.calculate(&write).await.unwrap_err();
    assert!(matches!(err, ControlError::ComputeFault(_)), "{err:?}");
    assert_eq!(service.area_version("mortgage", "inputs").await.unwrap(), 0);

    // The generation did not move either, so the earlier result still serves.
    let cached = service.calculate(&request(json!({ "a": 1 }))).await.unwrap();
    assert_eq!(cached.cached, Some(CacheTier::Memory));
    assert_eq!(cached.fingerprint, before.fingerprint);

    instance.fail_writes(false);
    let retried = service.calculate(&write).await.unwrap();
    assert_eq!(retried.version, Some(1));
    assert_eq!(instance.cell(CellAddress::new(1, 1)), Some(json!(7)));
}

#[tokio::test]
async fn compute_fault_after_accepted_mutation_keeps_the_write() {
    let harness = Harness::new();
    let provider = Arc::new(CountingProvider::new());
    let service = harness.service(provider.clone());

    let mut write = request(json!({ "fail": true }));
    write.mutation = Some(mutation(vec![CellWrite::new(1, 1, 3)], Some(0)));
    let err = service.calculate(&write).await.unwrap_err();
    assert!(matches!(err, ControlError::ComputeFault(_)), "{err:?}");

    assert_eq!(service.area_version("mortgage", "inputs").await.unwrap(), 1);
    let instance = provider.instance("mortgage").unwrap();
    assert_eq!(instance.cell(CellAddress::new(1, 1)), Some(json!(3)));

    let mut next = request(json!({}));
    next.mutation = Some(mutation(vec![CellWrite::new(1, 1, 4)], Some(1)));
    assert_eq!(service.calculate(&next).await.unwrap().version, Some(2));
}

#[tokio::test]
async fn area_versions_are_separate_from_a_colon_named_service() {
    let harness = Harness::new();
    let provider = Arc::new(CountingProvider::new());
    let service = harness.service(provider.clone());

    let mut write = request(json!({}));
    write.mutation = Some(mutation(vec![CellWrite::new(1, 1, 1)], Some(0)));
    service.calculate(&write).await.unwrap();

    // `mortgage:inputs` is a different service whose first write still
    // expects version 0.
    let mut other = request(json!({}));
    other.service_id = "mortgage:inputs".into();
    other.mutation = Some(mutation(vec![CellWrite::new(1, 1, 1)], Some(0)));
    assert_eq!(service.calculate(&other).await.unwrap().version, Some(1));
    assert_eq!(service.area_version("mortgage", "inputs").await.unwrap(), 1);
}

#[tokio::test]
async fn service_from_config_applies_rate_limit_and_result_ttl() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let config = ControlPlaneConfig::builder()
        .rate_limit(
            RateLimitConfig::builder()
                .window(Duration::from_secs(3600))
                .max_requests(2)
                .build()
                .unwrap(),
        )
        .result_ttl(Duration::from_secs(90))
        .build();
    let service = CalculationService::from_config(
        Arc::new(CountingProvider::new()),
        Arc::clone(&store),
        None,
        &config,
    )
    .unwrap();

    let outcome = service.calculate(&request(json!({ "a": 1 }))).await.unwrap();
    let ttl = store.ttl(&keys::result(outcome.fingerprint.as_str())).await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(90) && ttl > Duration::from_secs(60), "{ttl:?}");

    service.calculate(&request(json!({ "a": 1 }))).await.unwrap();
    let err = service.calculate(&request(json!({ "a": 1 }))).await.unwrap_err();
    assert!(matches!(err, ControlError::RateLimitExceeded { .. }), "{err:?}");

    let mut other = request(json!({ "a": 1 }));
    other.service_id = "tax".into();
    assert!(service.calculate(&other).await.is_ok());
}

#[tokio::test]
async fn rejected_mutation_never_reaches_the_engine() {
    let harness = Harness::new();
    let provider = Arc::new(CountingProvider::new());
    let service = harness.service(provider.clone());

    let mut outside = request(json!({}));
    outside.mutation = Some(mutation(
        vec![CellWrite::new(1, 1, 5), CellWrite::new(0, 0, 5)],
        None,
    ));
    let err = service.calculate(&outside).await.unwrap_err();
    assert!(matches!(err, ControlError::Validation(ValidationError::OutOfArea { .. })));
    assert_eq!(err.code(), "validation_error");

    let mut denied = request(json!({}));
    denied.mutation =
        Some(mutation(vec![CellWrite::new(1, 1, "=WEBSERVICE(\"http://x\")")], None));
    assert!(matches!(
        service.calculate(&denied).await.unwrap_err(),
        ControlError::Validation(ValidationError::DeniedFunction { .. })
    ));

    assert_eq!(provider.creations(), 0);
    assert_eq!(service.area_version("mortgage", "inputs").await.unwrap(), 0);
}

#[tokio::test]
async fn compute_fault_propagates_and_is_not_cached() {
    let harness = Harness::new();
    let provider = Arc::new(CountingProvider::new());
    let service = harness.service(provider.clone());

    let failing = request(json!({ "fail": true }));
    for _ in 0..2 {
        let err = service.calculate(&failing).await.unwrap_err();
        match err {
            ControlError::ComputeFault(fault) => assert_eq!(fault.code.as_deref(), Some("#VALUE!")),
            other => panic!("expected compute fault, got {other:?}"),
        }
    }
    assert_eq!(provider.instance("mortgage").unwrap().applies(), 2);
    assert_eq!(service.cache().stats().hits(), 0);
}

#[tokio::test]
async fn empty_outputs_are_a_result_not_a_fault() {
    let harness = Harness::new();
    let service = harness.service(Arc::new(CountingProvider::new()));
    let outcome = service.calculate(&request(json!({}))).await.unwrap();
    assert_eq!(outcome.outputs["sum"], json!(0.0));
}

#[tokio::test]
async fn evicted_instance_is_recreated_and_disposed() {
    let harness = Harness::new();
    let provider = Arc::new(CountingProvider::new());
    let service = harness.service(provider.clone());

    service.calculate(&request(json!({ "a": 1 }))).await.unwrap();
    let first = provider.instance("mortgage").unwrap();
    assert!(service.evict("mortgage"));
    assert!(first.is_disposed());

    service.calculate(&request(json!({ "a": 2 }))).await.unwrap();
    assert_eq!(provider.creations(), 2);
}
