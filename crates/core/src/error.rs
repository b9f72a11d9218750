//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upload ID: {0}")]
    InvalidUploadId(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("invalid session state: {0}")]
    InvalidState(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
