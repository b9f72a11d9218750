//! Engine inputs, outcomes and boundary response bodies.

use bytes::Bytes;
use quilt_core::{MergedArtifact, UploadId, UploadSession};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One chunk submitted to the engine.
#[derive(Clone)]
pub struct ChunkUpload {
    pub upload_id: UploadId,
    /// Position of this chunk, `0..total_chunks`.
    pub index: u32,
    /// Number of chunks in the whole upload.
    pub total_chunks: u32,
    pub payload: Bytes,
    /// Artifact file name; only honoured by the call that creates the session.
    pub file_name: Option<String>,
}

impl ChunkUpload {
    pub fn new(upload_id: UploadId, index: u32, total_chunks: u32, payload: Bytes) -> Self {
        Self {
            upload_id,
            index,
            total_chunks,
            payload,
            file_name: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

impl fmt::Debug for ChunkUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkUpload")
            .field("upload_id", &self.upload_id)
            .field("index", &self.index)
            .field("total_chunks", &self.total_chunks)
            .field("size", &self.payload.len())
            .field("file_name", &self.file_name)
            .finish()
    }
}

/// Successful result of ingesting one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The chunk is stored and recorded; more chunks are expected.
    ChunkAccepted,
    /// This chunk completed the upload and the artifact was assembled.
    UploadComplete(MergedArtifact),
}

impl IngestOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::UploadComplete(_))
    }

    /// The merged artifact, when this outcome completed the upload.
    pub fn artifact(&self) -> Option<&MergedArtifact> {
        match self {
            Self::UploadComplete(artifact) => Some(artifact),
            Self::ChunkAccepted => None,
        }
    }

    /// Status code and body for a transport collaborator.
    pub fn response(&self) -> (u16, ResponseBody) {
        let body = match self {
            Self::ChunkAccepted => ResponseBody {
                message: "chunk uploaded".to_string(),
                locator: None,
                total_size_bytes: None,
            },
            Self::UploadComplete(artifact) => ResponseBody {
                message: "upload complete".to_string(),
                locator: Some(artifact.locator.clone()),
                total_size_bytes: Some(artifact.total_size_bytes),
            },
        };
        (200, body)
    }
}

/// Success body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size_bytes: Option<u64>,
}

/// Error body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// Session state compared with what the chunk store actually holds.
#[derive(Clone, Debug, Serialize)]
pub struct SessionReport {
    pub session: UploadSession,
    /// Indices with a blob in the chunk store.
    pub stored_indices: Vec<u32>,
    /// Recorded as received but absent from the store. Only computed while
    /// the session still owns its chunks (open or merging).
    pub missing_from_store: Vec<u32>,
    /// Present in the store but never recorded.
    pub orphaned_in_store: Vec<u32>,
}
