//! Chunk addressing and merged artifact types.

use crate::upload::UploadId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage key prefix for chunk blobs.
const UPLOADS_PREFIX: &str = "uploads";

/// Storage key prefix for merged artifacts.
const ARTIFACTS_PREFIX: &str = "artifacts";

/// Address of a single chunk blob: `(upload_id, index)`.
///
/// Object keys embed the index in decimal without padding. They are an
/// addressing scheme only and must never be sorted to recover chunk order.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub upload_id: UploadId,
    pub index: u32,
}

impl ChunkKey {
    /// Create a new chunk key.
    pub fn new(upload_id: UploadId, index: u32) -> Self {
        Self { upload_id, index }
    }

    /// Get the object store key for this chunk.
    pub fn to_object_key(&self) -> String {
        format!("{}{}", Self::prefix_for(&self.upload_id), self.index)
    }

    /// Key prefix shared by every chunk of an upload.
    pub fn prefix_for(upload_id: &UploadId) -> String {
        format!("{UPLOADS_PREFIX}/{upload_id}/chunks/")
    }

    /// Recover the chunk index from an object key under `prefix_for(upload_id)`.
    ///
    /// Returns `None` for keys that are not chunk blobs of this upload
    /// (temp files, foreign keys).
    pub fn parse_index(upload_id: &UploadId, key: &str) -> Option<u32> {
        let rest = key.strip_prefix(&Self::prefix_for(upload_id))?;
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // Reject "007"-style names so each index has exactly one key.
        if rest.len() > 1 && rest.starts_with('0') {
            return None;
        }
        rest.parse().ok()
    }
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkKey({}#{})", self.upload_id, self.index)
    }
}

/// The reassembled file produced by a completed upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedArtifact {
    /// Upload the artifact was assembled from.
    pub upload_id: UploadId,
    /// Object store key of the artifact.
    pub object_key: String,
    /// Backend-specific locator (a filesystem path for local storage).
    pub locator: String,
    /// Size of the artifact in bytes.
    pub total_size_bytes: u64,
}

/// Object store key for an upload's merged artifact.
pub fn artifact_object_key(upload_id: &UploadId, file_name: &str) -> String {
    format!("{ARTIFACTS_PREFIX}/{upload_id}/{file_name}")
}

/// Validate a caller-supplied artifact file name.
///
/// The name becomes the last segment of a storage key, so separators,
/// control characters and dot-only names are rejected.
pub fn validate_file_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::InvalidFileName(
            "file name must not be empty".to_string(),
        ));
    }
    if name.len() > crate::MAX_FILE_NAME_LEN {
        return Err(crate::Error::InvalidFileName(format!(
            "file name is {} bytes (max: {})",
            name.len(),
            crate::MAX_FILE_NAME_LEN
        )));
    }
    if name.chars().all(|c| c == '.') {
        return Err(crate::Error::InvalidFileName(format!(
            "reserved file name: {name}"
        )));
    }
    if name.starts_with(".tmp") {
        return Err(crate::Error::InvalidFileName(format!(
            "file name uses reserved prefix: {name}"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| matches!(c, '/' | '\\') || c.is_control())
    {
        return Err(crate::Error::InvalidFileName(format!(
            "file name contains invalid character {c:?}"
        )));
    }
    Ok(())
}

/// Number of chunks needed to carry `size` bytes in `chunk_size` pieces.
///
/// An empty input still travels as one (empty) chunk.
pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    size.div_ceil(chunk_size).max(1)
}
