//! Shared store abstractions for the calcplane execution control plane.
//!
//! This crate provides the [`KvStore`] trait (the shared, multi-writer
//! key-value store every process instance talks to) and the [`BlobStore`]
//! trait (the durable cold tier), together with in-memory reference
//! implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   calcplane-oauth                           │
//! │        (authorization codes, bridge tokens, clients)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   calcplane-control                         │
//! │  locks │ version map │ result cache │ rate limiter │ pool   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   calcplane-storage                         │
//! │            KvStore trait    │    BlobStore trait            │
//! ├──────────────┬──────────────┴───────────────────────────────┤
//! │ MemoryStore  │  network-backed stores (out of tree)         │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//! use calcplane_storage::{KvStore, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryStore::new();
//!
//!     store.set_with_ttl("session:1", b"alice".to_vec(), Duration::from_secs(60)).await?;
//!     assert_eq!(store.increment("hits", 1, None).await?, 1);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (failing stores, assertion macros).
//! - **`failpoints`**: Activates `fail` fail points for fault-injection tests.

#![deny(unsafe_code)]

pub mod blob;
pub mod error;
pub mod keys;
pub mod memory;
pub mod store;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;

pub use blob::{BlobStore, MemoryBlobStore};
pub use error::{BoxError, StorageError, StorageResult};
pub use memory::MemoryStore;
pub use store::KvStore;
