//! Compute provider collaborator.
//!
//! The calculation engine is external. The control plane only needs to
//! create an instance per resource, feed it inputs, apply validated writes,
//! and dispose of it when the pool evicts it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::validator::SanitizedUpdate;

/// Named input or output values of one calculation.
pub type Values = Map<String, Value>;

/// A failure reported by the compute engine.
///
/// Distinct from an empty result: an instance that computes nothing returns
/// `Ok` with an empty map.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ComputeFault {
    /// Human-readable description.
    pub message: String,
    /// Engine-specific code such as `#REF!`, if any.
    pub code: Option<String>,
}

impl ComputeFault {
    /// Creates a fault with a message only.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), code: None }
    }

    /// Attaches an engine-specific code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// A live calculation engine bound to one resource.
#[async_trait]
pub trait ComputeInstance: Send + Sync {
    /// Computes outputs for `inputs`.
    async fn apply(&self, inputs: &Values) -> Result<Values, ComputeFault>;

    /// Writes validated cells into the instance.
    async fn write_cells(&self, update: &SanitizedUpdate) -> Result<(), ComputeFault>;

    /// Releases engine resources. Called once, after the pool has evicted
    /// the instance and the last caller using it has finished.
    fn dispose(&self) {}
}

/// Factory for [`ComputeInstance`]s.
///
/// Creation may be retried after a failure, so it must not leave partial
/// state behind.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Creates and hydrates an instance for `resource_key`.
    async fn create(&self, resource_key: &str) -> Result<Arc<dyn ComputeInstance>, ComputeFault>;
}
