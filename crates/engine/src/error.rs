//! Engine error taxonomy.

use crate::outcome::ErrorResponse;
use quilt_core::{SessionState, UploadId};
use quilt_metadata::TrackerError;
use quilt_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the assembly engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upload {upload_id} was created with {existing} chunks, got {requested}")]
    InconsistentTotal {
        upload_id: UploadId,
        existing: u32,
        requested: u32,
    },

    #[error("upload session {upload_id} is {state}")]
    SessionAlreadyMerging {
        upload_id: UploadId,
        state: SessionState,
    },

    #[error("upload session {upload_id} failed: {reason}")]
    SessionFailed { upload_id: UploadId, reason: String },

    #[error("upload session {0} expired")]
    UploadExpired(UploadId),

    #[error("upload session not found: {0}")]
    SessionNotFound(UploadId),

    #[error("failed to store chunk {index} of {upload_id}: {source}")]
    StorageFailure {
        upload_id: UploadId,
        index: u32,
        #[source]
        source: StorageError,
    },

    #[error("chunk {index} of {upload_id} missing at merge")]
    MissingChunk { upload_id: UploadId, index: u32 },

    #[error("merge of {upload_id} failed: {source}")]
    MergeFailure {
        upload_id: UploadId,
        #[source]
        source: StorageError,
    },

    #[error("failed to list stored chunks of {upload_id}: {source}")]
    InspectFailure {
        upload_id: UploadId,
        #[source]
        source: StorageError,
    },

    #[error("timed out after {waited:?} waiting for the lock on {upload_id}")]
    LockTimeout {
        upload_id: UploadId,
        waited: Duration,
    },

    #[error("session tracker error: {0}")]
    Tracker(#[source] TrackerError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TrackerError> for EngineError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::SessionNotFound(id) => Self::SessionNotFound(id),
            TrackerError::InconsistentTotal {
                upload_id,
                existing,
                requested,
            } => Self::InconsistentTotal {
                upload_id,
                existing,
                requested,
            },
            TrackerError::SessionAlreadyMerging { upload_id, state } => {
                Self::SessionAlreadyMerging { upload_id, state }
            }
            TrackerError::SessionFailed { upload_id, reason } => {
                Self::SessionFailed { upload_id, reason }
            }
            TrackerError::InvalidIndex { index, total } => Self::InvalidRequest(format!(
                "chunk index {index} out of range for {total} chunks"
            )),
            other => Self::Tracker(other),
        }
    }
}

impl EngineError {
    /// Stable error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InconsistentTotal { .. } => "inconsistent_total",
            Self::SessionAlreadyMerging { .. } => "session_already_merging",
            Self::SessionFailed { .. } => "session_failed",
            Self::UploadExpired(_) => "upload_expired",
            Self::SessionNotFound(_) => "session_not_found",
            Self::StorageFailure { .. } => "storage_failure",
            Self::MissingChunk { .. } => "missing_chunk",
            Self::MergeFailure { .. } => "merge_failure",
            Self::InspectFailure { .. } => "inspect_failure",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Tracker(_) => "tracker_error",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP-style status code for a transport collaborator.
    ///
    /// 4xx for errors the caller caused, 5xx for server-side failures.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::SessionNotFound(_) => 404,
            Self::InconsistentTotal { .. }
            | Self::SessionAlreadyMerging { .. }
            | Self::SessionFailed { .. } => 409,
            Self::UploadExpired(_) => 410,
            Self::StorageFailure { .. }
            | Self::InspectFailure { .. }
            | Self::LockTimeout { .. } => 503,
            Self::MissingChunk { .. }
            | Self::MergeFailure { .. }
            | Self::Tracker(_)
            | Self::Config(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Whether resending the same chunk may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageFailure { .. } | Self::LockTimeout { .. })
    }

    /// Error body for a transport collaborator.
    pub fn response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
