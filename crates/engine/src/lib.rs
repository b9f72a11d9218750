//! Chunk assembly engine for quilt.
//!
//! This crate ties the chunk store and the session tracker together:
//! - `AssemblyEngine::ingest_chunk`, the single entry point for chunks
//! - Merging in numeric index order, exactly once per upload
//! - Per-upload locking with a bounded wait
//! - Startup recovery and expired session sweeps
//! - Prometheus counters and boundary response mapping

pub mod assembly;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod outcome;
pub mod recovery;

pub use assembly::AssemblyEngine;
pub use error::{EngineError, EngineResult};
pub use guard::{SessionLockGuard, SessionLocks};
pub use outcome::{ChunkUpload, ErrorResponse, IngestOutcome, ResponseBody, SessionReport};
pub use recovery::{RecoveryReport, SweepReport};

use quilt_core::config::AppConfig;

/// Build an engine from application configuration.
pub async fn from_config(config: &AppConfig) -> EngineResult<AssemblyEngine> {
    config.validate().map_err(EngineError::Config)?;

    let storage = quilt_storage::from_config(&config.storage)
        .await
        .map_err(|e| EngineError::Config(format!("storage: {e}")))?;
    let sessions = quilt_metadata::from_config(&config.tracker)
        .await
        .map_err(|e| EngineError::Config(format!("tracker: {e}")))?;

    tracing::info!(
        storage_backend = storage.backend_name(),
        tracker_backend = sessions.backend_name(),
        "Assembly engine initialized"
    );
    Ok(AssemblyEngine::new(storage, sessions, config.engine.clone()))
}
