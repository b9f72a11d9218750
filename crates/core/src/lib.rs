//! Core domain types for the quilt chunked upload engine.
//!
//! This crate defines the data model shared by every other crate:
//! - Upload identifiers and the session lifecycle
//! - Chunk addressing and the storage key layout
//! - Merged artifact descriptors
//! - Configuration types

pub mod chunk;
pub mod config;
pub mod error;
pub mod upload;

pub use chunk::{ChunkKey, MergedArtifact, chunk_count};
pub use error::{Error, Result};
pub use upload::{ChunkReadiness, SessionHeader, SessionState, UploadId, UploadSession};

/// Default maximum chunk payload size: 32 MiB
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Default chunk size used when splitting a local file: 8 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Default upper bound on chunks per upload.
pub const DEFAULT_MAX_TOTAL_CHUNKS: u32 = 100_000;

/// Maximum length of an upload ID in bytes.
pub const MAX_UPLOAD_ID_LEN: usize = 128;

/// Maximum length of an artifact file name in bytes.
pub const MAX_FILE_NAME_LEN: usize = 255;
