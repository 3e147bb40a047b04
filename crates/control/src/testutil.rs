//! Test doubles for the compute collaborator.
//!
//! Available with the `testutil` feature or in this crate's own tests.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::{
    compute::{ComputeFault, ComputeInstance, ComputeProvider, Values},
    error::{ControlError, Result},
    validator::{CellAddress, SanitizedUpdate},
};

/// Instance that sums numeric inputs and written cells.
///
/// Outputs `{"resource", "sum", "cells"}`. An input `"fail": true` makes
/// [`apply`](ComputeInstance::apply) return a [`ComputeFault`];
/// [`fail_writes`](Self::fail_writes) does the same for
/// [`write_cells`](ComputeInstance::write_cells).
#[derive(Debug)]
pub struct EchoInstance {
    resource_key: String,
    cells: Mutex<BTreeMap<CellAddress, Value>>,
    applies: AtomicU64,
    disposed: AtomicBool,
    failing_writes: AtomicBool,
    apply_delay: Duration,
}

impl EchoInstance {
    /// Creates an instance bound to `resource_key`.
    #[must_use]
    pub fn new(resource_key: &str) -> Self {
        Self {
            resource_key: resource_key.to_owned(),
            cells: Mutex::new(BTreeMap::new()),
            applies: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            failing_writes: AtomicBool::new(false),
            apply_delay: Duration::ZERO,
        }
    }

    /// Makes every `apply` sleep for `delay` first.
    #[must_use]
    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = delay;
        self
    }

    /// Makes subsequent `write_cells` calls fail (or succeed again).
    pub fn fail_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }

    /// Number of [`apply`](ComputeInstance::apply) calls.
    #[must_use]
    pub fn applies(&self) -> u64 {
        self.applies.load(Ordering::SeqCst)
    }

    /// Value last written to `address`.
    #[must_use]
    pub fn cell(&self, address: CellAddress) -> Option<Value> {
        self.cells.lock().get(&address).cloned()
    }

    /// Whether the pool disposed of this instance.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl ComputeInstance for EchoInstance {
    async fn apply(&self, inputs: &Values) -> std::result::Result<Values, ComputeFault> {
        if !self.apply_delay.is_zero() {
            tokio::time::sleep(self.apply_delay).await;
        }
        if self.is_disposed() {
            return Err(ComputeFault::new("instance already disposed"));
        }
        self.applies.fetch_add(1, Ordering::SeqCst);
        if inputs.get("fail") == Some(&Value::Bool(true)) {
            return Err(ComputeFault::new("forced fault").with_code("#VALUE!"));
        }

        let cells = self.cells.lock();
        let sum: f64 =
            inputs.values().chain(cells.values()).filter_map(as_number).sum();

        let mut outputs = Values::new();
        outputs.insert("resource".into(), json!(self.resource_key));
        outputs.insert("sum".into(), json!(sum));
        outputs.insert("cells".into(), json!(cells.len()));
        Ok(outputs)
    }

    async fn write_cells(&self, update: &SanitizedUpdate) -> std::result::Result<(), ComputeFault> {
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(ComputeFault::new("write rejected by engine"));
        }
        let mut cells = self.cells.lock();
        for cell in update.cells() {
            cells.insert(cell.address, cell.value.clone());
        }
        Ok(())
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// Provider that counts creations and keeps every instance it made.
#[derive(Debug, Default)]
pub struct CountingProvider {
    creations: AtomicU64,
    delay: Duration,
    apply_delay: Duration,
    instances: Mutex<HashMap<String, Arc<EchoInstance>>>,
}

impl CountingProvider {
    /// Creates a provider that builds instances immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider whose `create` sleeps for `delay` first.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay, ..Self::default() }
    }

    /// Creates a provider whose instances sleep for `delay` in every
    /// `apply`.
    #[must_use]
    pub fn with_apply_delay(delay: Duration) -> Self {
        Self { apply_delay: delay, ..Self::default() }
    }

    /// Number of `create` calls that completed.
    #[must_use]
    pub fn creations(&self) -> u64 {
        self.creations.load(Ordering::SeqCst)
    }

    /// Most recent instance created for `resource_key`.
    #[must_use]
    pub fn instance(&self, resource_key: &str) -> Option<Arc<EchoInstance>> {
        self.instances.lock().get(resource_key).cloned()
    }
}

#[async_trait]
impl ComputeProvider for CountingProvider {
    async fn create(
        &self,
        resource_key: &str,
    ) -> std::result::Result<Arc<dyn ComputeInstance>, ComputeFault> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let instance = Arc::new(EchoInstance::new(resource_key).with_apply_delay(self.apply_delay));
        self.instances.lock().insert(resource_key.to_owned(), Arc::clone(&instance));
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok(instance)
    }
}

/// Boxed future returned by [`create_with`].
pub type CreateFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Arc<dyn ComputeInstance>>> + Send + 'a>>;

/// Adapts `provider.create(key)` to the closure shape
/// [`InstancePool::get`](crate::InstancePool::get) expects.
pub fn create_with<'a>(
    provider: &'a dyn ComputeProvider,
    resource_key: &'a str,
) -> impl FnOnce() -> CreateFuture<'a> + 'a {
    move || Box::pin(async move { provider.create(resource_key).await.map_err(ControlError::from) })
}
