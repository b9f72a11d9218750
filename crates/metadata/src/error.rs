//! Session tracker error types.

use quilt_core::{SessionState, UploadId};
use thiserror::Error;

/// Session tracker operation errors.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("upload session not found: {0}")]
    SessionNotFound(UploadId),

    #[error("upload {upload_id} was created with {existing} chunks, got {requested}")]
    InconsistentTotal {
        upload_id: UploadId,
        existing: u32,
        requested: u32,
    },

    #[error("chunk index {index} out of range for {total} chunks")]
    InvalidIndex { index: u32, total: u32 },

    #[error("upload session {upload_id} is {state}")]
    SessionAlreadyMerging {
        upload_id: UploadId,
        state: SessionState,
    },

    #[error("upload session {upload_id} failed: {reason}")]
    SessionFailed { upload_id: UploadId, reason: String },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt session record: {0}")]
    Corrupt(String),
}

impl TrackerError {
    /// Rejection because the session is no longer open.
    pub fn is_session_closed(&self) -> bool {
        matches!(
            self,
            Self::SessionAlreadyMerging { .. } | Self::SessionFailed { .. }
        )
    }
}

/// Result type for session tracker operations.
pub type TrackerResult<T> = std::result::Result<T, TrackerError>;
