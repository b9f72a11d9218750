//! Upload session tracking for quilt.
//!
//! This crate owns the session state machine:
//! - Session creation with a fixed chunk total
//! - Idempotent chunk arrival recording with a single `ReadyToMerge`
//! - Terminal transitions and expiry queries
//! - Stores: in-process memory and SQLite

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod store;
pub mod tracker;

pub use error::{TrackerError, TrackerResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::SessionStore;
pub use tracker::SessionTracker;

use quilt_core::config::TrackerConfig;
use std::sync::Arc;

/// Create a session store from configuration.
pub async fn from_config(config: &TrackerConfig) -> TrackerResult<Arc<dyn SessionStore>> {
    match config {
        TrackerConfig::Memory => Ok(Arc::new(MemoryStore::new()) as Arc<dyn SessionStore>),
        TrackerConfig::Sqlite {
            path,
            busy_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *busy_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn SessionStore>)
        }
    }
}
