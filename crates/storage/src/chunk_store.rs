//! Durable per-upload chunk blobs.

use crate::error::{StorageError, StorageResult};
use crate::traits::ObjectStore;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use quilt_core::{ChunkKey, UploadId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::instrument;

/// Concurrent deletes issued by `delete_all`.
const DELETE_CONCURRENCY: usize = 16;

/// Stores chunk payloads addressed by `(upload_id, index)`.
///
/// Keys are derived from the index and carry no ordering meaning. Callers
/// that need chunk order must iterate indices numerically.
#[derive(Clone)]
pub struct ChunkStore {
    storage: Arc<dyn ObjectStore>,
}

impl ChunkStore {
    pub fn new(storage: Arc<dyn ObjectStore>) -> Self {
        Self { storage }
    }

    /// Underlying object store.
    pub fn storage(&self) -> &Arc<dyn ObjectStore> {
        &self.storage
    }

    /// Write or overwrite one chunk. The replace is atomic.
    #[instrument(skip(self, payload), fields(upload_id = %upload_id, size = payload.len()))]
    pub async fn put(&self, upload_id: &UploadId, index: u32, payload: Bytes) -> StorageResult<()> {
        let key = ChunkKey::new(upload_id.clone(), index).to_object_key();
        self.storage.put(&key, payload).await
    }

    /// Read one chunk. Absent chunks yield `StorageError::NotFound`.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn get(&self, upload_id: &UploadId, index: u32) -> StorageResult<Bytes> {
        let key = ChunkKey::new(upload_id.clone(), index).to_object_key();
        self.storage.get(&key).await
    }

    /// Indices currently present in the store for an upload.
    ///
    /// Diagnostics and recovery only; completion is never decided from this.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn list_indices(&self, upload_id: &UploadId) -> StorageResult<BTreeSet<u32>> {
        let prefix = ChunkKey::prefix_for(upload_id);
        let keys = self.storage.list(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|key| ChunkKey::parse_index(upload_id, key))
            .collect())
    }

    /// Remove one chunk. Missing chunks are not an error.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn delete(&self, upload_id: &UploadId, index: u32) -> StorageResult<()> {
        let key = ChunkKey::new(upload_id.clone(), index).to_object_key();
        match self.storage.delete(&key).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove every chunk blob of an upload and return how many were deleted.
    ///
    /// All deletes are attempted even when some fail; the first failure is
    /// returned after the rest have run.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn delete_all(&self, upload_id: &UploadId) -> StorageResult<usize> {
        let prefix = ChunkKey::prefix_for(upload_id);
        let keys = self.storage.list(&prefix).await?;

        let results: Vec<StorageResult<bool>> = stream::iter(keys)
            .map(|key| {
                let storage = Arc::clone(&self.storage);
                async move {
                    match storage.delete(&key).await {
                        Ok(()) => Ok(true),
                        Err(StorageError::NotFound(_)) => Ok(false),
                        Err(e) => {
                            tracing::warn!(key = %key, error = %e, "Failed to delete chunk blob");
                            Err(e)
                        }
                    }
                }
            })
            .buffer_unordered(DELETE_CONCURRENCY)
            .collect()
            .await;

        let mut deleted = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::debug!(deleted, "Deleted chunk blobs");
                Ok(deleted)
            }
        }
    }
}
