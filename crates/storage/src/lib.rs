//! Chunk and artifact storage for quilt.
//!
//! This crate provides:
//! - The `ObjectStore` byte-store seam with atomic writes
//! - `ChunkStore` for per-upload chunk blobs
//! - `ArtifactStore` for streaming merged artifacts
//! - Backends: local filesystem and in-process memory

pub mod artifact_store;
pub mod backends;
pub mod chunk_store;
pub mod error;
pub mod traits;

pub use artifact_store::{ArtifactStore, ArtifactWriter};
pub use backends::{filesystem::FilesystemBackend, memory::MemoryBackend};
pub use chunk_store::ChunkStore;
pub use error::{StorageError, StorageResult};
pub use traits::{ObjectMeta, ObjectStore, StreamingUpload};

use quilt_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
    }
}
