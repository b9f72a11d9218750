//! Merged artifact output.

use crate::error::StorageResult;
use crate::traits::{ObjectStore, StreamingUpload};
use bytes::Bytes;
use quilt_core::chunk::{artifact_object_key, validate_file_name};
use quilt_core::{MergedArtifact, UploadId};
use std::sync::Arc;
use tracing::instrument;

/// Creates merged artifacts under `artifacts/<upload_id>/<file_name>`.
#[derive(Clone)]
pub struct ArtifactStore {
    storage: Arc<dyn ObjectStore>,
}

impl ArtifactStore {
    pub fn new(storage: Arc<dyn ObjectStore>) -> Self {
        Self { storage }
    }

    /// Start writing the artifact for an upload.
    ///
    /// Nothing is visible at the artifact key until `ArtifactWriter::finish`.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn create(
        &self,
        upload_id: &UploadId,
        file_name: &str,
    ) -> StorageResult<ArtifactWriter> {
        validate_file_name(file_name)?;
        let object_key = artifact_object_key(upload_id, file_name);
        let upload = self.storage.put_stream(&object_key).await?;
        Ok(ArtifactWriter {
            upload,
            upload_id: upload_id.clone(),
            locator: self.storage.locate(&object_key),
            object_key,
            bytes_written: 0,
        })
    }

    /// Remove a published artifact. A missing artifact is not an error.
    #[instrument(skip(self, artifact), fields(upload_id = %artifact.upload_id))]
    pub async fn delete(&self, artifact: &MergedArtifact) -> StorageResult<()> {
        match self.storage.delete(&artifact.object_key).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }
}

/// Streaming writer for one artifact.
pub struct ArtifactWriter {
    upload: Box<dyn StreamingUpload>,
    upload_id: UploadId,
    object_key: String,
    locator: String,
    bytes_written: u64,
}

impl ArtifactWriter {
    /// Append bytes to the artifact.
    pub async fn append(&mut self, data: Bytes) -> StorageResult<()> {
        let len = data.len() as u64;
        self.upload.write(data).await?;
        self.bytes_written += len;
        Ok(())
    }

    /// Bytes appended so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Publish the artifact.
    pub async fn finish(self) -> StorageResult<MergedArtifact> {
        let total_size_bytes = self.upload.finish().await?;
        Ok(MergedArtifact {
            upload_id: self.upload_id,
            object_key: self.object_key,
            locator: self.locator,
            total_size_bytes,
        })
    }

    /// Discard everything appended. No artifact is left behind.
    pub async fn abort(self) -> StorageResult<()> {
        self.upload.abort().await
    }
}
