//! Verifies the spans and audit events emitted along the calculation path.
//!
//! ```bash
//! cargo test -p calcplane-control --features testutil --test tracing_spans
//! ```
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{Arc, Mutex};

use calcplane_control::{
    CalculationRequest, CalculationService, CellWrite, InstancePool, Mutation, PoolConfig,
    ResultCache, ResultCacheConfig, StoreVersionMap, testutil::CountingProvider,
};
use calcplane_storage::{KvStore, MemoryStore};
use serde_json::json;
use tracing::{
    Event, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: span names and audit actions
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Collector {
    spans: Arc<Mutex<Vec<String>>>,
    audits: Arc<Mutex<Vec<String>>>,
}

#[derive(Default)]
struct AuditVisitor {
    action: Option<String>,
    is_audit: bool,
}

impl Visit for AuditVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "audit.action" {
            self.action = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" && format!("{value:?}") == "audit_event" {
            self.is_audit = true;
        }
    }
}

impl<S> tracing_subscriber::Layer<S> for Collector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().expect("lock poisoned").push(span.name().to_owned());
        }
    }

    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = AuditVisitor::default();
        event.record(&mut visitor);
        if visitor.is_audit
            && let Some(action) = visitor.action
        {
            self.audits.lock().expect("lock poisoned").push(action);
        }
    }
}

fn service() -> CalculationService {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    CalculationService::builder()
        .provider(Arc::new(CountingProvider::new()))
        .pool(InstancePool::new(Arc::clone(&store), &PoolConfig::default()))
        .cache(ResultCache::new(ResultCacheConfig::default()).with_shared(Arc::clone(&store)))
        .versions(Arc::new(StoreVersionMap::new(store)))
        .build()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn calculate_creates_spans() {
    let collector = Collector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let service = service();
    let request = CalculationRequest {
        service_id: "mortgage".into(),
        inputs: json!({ "a": 1 }).as_object().cloned().unwrap(),
        mutation: None,
    };
    service.calculate(&request).await.unwrap();

    let spans = collector.spans.lock().expect("lock poisoned").clone();
    assert!(spans.iter().any(|s| s == "calculate"), "expected a 'calculate' span, got: {spans:?}");
    assert!(spans.iter().any(|s| s == "get"), "expected a pool 'get' span, got: {spans:?}");
}

#[tokio::test]
async fn accepted_mutation_is_audited_once() {
    let collector = Collector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let service = service();
    let request = CalculationRequest {
        service_id: "mortgage".into(),
        inputs: Default::default(),
        mutation: Some(Mutation {
            area: "inputs".into(),
            allowed_area: "B2:D10".into(),
            cells: vec![CellWrite::at("C3", 10).unwrap()],
            expected_version: Some(0),
        }),
    };
    service.calculate(&request).await.unwrap();

    let audits = collector.audits.lock().expect("lock poisoned").clone();
    assert_eq!(audits, vec!["apply_mutation".to_owned()]);
}

#[tokio::test]
async fn rejected_mutation_is_not_audited() {
    let collector = Collector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let service = service();
    let request = CalculationRequest {
        service_id: "mortgage".into(),
        inputs: Default::default(),
        mutation: Some(Mutation {
            area: "inputs".into(),
            allowed_area: "B2:D10".into(),
            cells: vec![CellWrite::at("Z99", 1).unwrap()],
            expected_version: None,
        }),
    };
    assert!(service.calculate(&request).await.is_err());
    assert!(collector.audits.lock().expect("lock poisoned").is_empty());
}
