//! Durable blob store abstraction.
//!
//! The blob store is the cold tier of the result cache: slow, durable, and
//! addressed by URL-like paths. [`MemoryBlobStore`] backs tests and
//! single-process deployments.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::StorageResult;

/// Byte-payload store addressed by URL.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetches the payload stored at `url`, or `None` if nothing is stored.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, url: &str) -> StorageResult<Option<Bytes>>;

    /// Stores `payload` at `url`, replacing any previous payload.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn put(&self, url: &str, payload: Bytes) -> StorageResult<()>;

    /// Removes the payload at `url`. Removing a missing payload is a no-op.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, url: &str) -> StorageResult<()>;
}

/// In-memory [`BlobStore`]. Clones share the same payloads.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    /// Creates an empty blob store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored payloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, url: &str) -> StorageResult<Option<Bytes>> {
        Ok(self.blobs.read().get(url).cloned())
    }

    async fn put(&self, url: &str, payload: Bytes) -> StorageResult<()> {
        self.blobs.write().insert(url.to_owned(), payload);
        Ok(())
    }

    async fn delete(&self, url: &str) -> StorageResult<()> {
        self.blobs.write().remove(url);
        Ok(())
    }
}
