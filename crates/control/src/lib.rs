//! Execution control plane for hosted spreadsheet calculations.
//!
//! This crate coordinates expensive compute instances across concurrent
//! requests and across processes sharing one key-value store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── CalculationService ────────────────────────┐
//! │                                                                    │
//! │  fingerprint ─▶ ResultCache (memory → shared store → blob store)   │
//! │                    │ miss                                          │
//! │                    ▼                                               │
//! │  validate_mutation ─▶ VersionTracker ─▶ InstancePool ─▶ compute    │
//! │                                          │                         │
//! │                     ResourceMutexRegistry + DistributedLock        │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! | Component | Scope | Guarantee |
//! |-----------|-------|-----------|
//! | [`ResourceMutexRegistry`] | process | FIFO mutual exclusion per key |
//! | [`DistributedLock`] | all processes | mutual exclusion per key, self-expiring |
//! | [`VersionTracker`] | process or shared | optimistic check-and-bump |
//! | [`InstancePool`] | process | one cold start per key, LRU eviction |
//! | [`ResultCache`] | three tiers | write-back on slower-tier hits |
//! | [`RateLimiter`] | process or shared | fixed-window request budgets |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use calcplane_control::{CalculationRequest, CalculationService, ComputeProvider, ControlPlaneConfig};
//! use calcplane_storage::{KvStore, MemoryStore};
//!
//! # async fn example(provider: Arc<dyn ComputeProvider>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ControlPlaneConfig::default();
//! let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
//!
//! // Pool locks, shared results, versions and rate limits all live in `store`.
//! let service = CalculationService::from_config(provider, store, None, &config)?;
//!
//! let request: CalculationRequest = serde_json::from_str(
//!     r#"{ "service_id": "mortgage", "inputs": { "rate": 0.05, "years": 30 } }"#,
//! )?;
//! let outcome = service.calculate(&request).await?;
//! println!("{:?}", outcome.outputs);
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables [`testutil`] (counting compute provider).
//! - **`failpoints`**: Activates `fail` fail points for fault-injection tests.

#![deny(unsafe_code)]

pub mod cache;
pub mod clock;
pub mod compute;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod mutex;
pub mod pool;
pub mod rate_limit;
pub mod service;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
pub mod validator;
pub mod version;

pub use cache::{CacheEntry, CacheStats, CacheTier, ResultCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compute::{ComputeFault, ComputeInstance, ComputeProvider, Values};
pub use config::{ControlPlaneConfig, LockConfig, PoolConfig, RateLimitConfig, ResultCacheConfig};
pub use error::{ConfigError, ControlError, Result};
pub use fingerprint::{Fingerprint, canonical_json, fingerprint};
pub use lock::{DistributedLock, LockGuard, LockTicket};
pub use mutex::ResourceMutexRegistry;
pub use pool::{InstancePool, PoolStats};
pub use rate_limit::{
    FixedWindowLimiter, RateLimitDecision, RateLimiter, StoreRateLimiter,
};
pub use service::{CalculationOutcome, CalculationRequest, CalculationService, Mutation};
pub use validator::{
    Area, CellAddress, CellWrite, SanitizedCell, SanitizedUpdate, ValidationError,
    validate_mutation,
};
pub use version::{StoreVersionMap, VersionMap, VersionTracker};
