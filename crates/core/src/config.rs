//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Assembly engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum chunk payload size in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Maximum number of chunks a single upload may declare.
    #[serde(default = "default_max_total_chunks")]
    pub max_total_chunks: u32,
    /// How long to wait for a session lock before giving up, in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// How long an open session accepts chunks, in seconds.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Maximum number of sessions handled per recovery or sweep batch.
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: u32,
}

fn default_max_chunk_size() -> u64 {
    crate::DEFAULT_MAX_CHUNK_SIZE
}

fn default_max_total_chunks() -> u32 {
    crate::DEFAULT_MAX_TOTAL_CHUNKS
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_session_ttl_secs() -> u64 {
    86400 // 24 hours
}

fn default_sweep_batch_size() -> u32 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            max_total_chunks: default_max_total_chunks(),
            lock_timeout_ms: default_lock_timeout_ms(),
            session_ttl_secs: default_session_ttl_secs(),
            sweep_batch_size: default_sweep_batch_size(),
        }
    }
}

impl EngineConfig {
    /// Get the session lock timeout.
    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_timeout_ms)
    }

    /// Get the session TTL as a Duration.
    pub fn session_ttl(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.session_ttl_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    /// Validate engine configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_chunk_size == 0 {
            return Err("engine.max_chunk_size must be greater than 0".to_string());
        }
        if self.max_total_chunks == 0 {
            return Err("engine.max_total_chunks must be greater than 0".to_string());
        }
        if self.lock_timeout_ms == 0 {
            return Err("engine.lock_timeout_ms must be greater than 0".to_string());
        }
        if self.session_ttl_secs == 0 {
            return Err("engine.session_ttl_secs must be greater than 0".to_string());
        }
        if self.sweep_batch_size == 0 {
            return Err("engine.sweep_batch_size must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for chunk blobs and merged artifacts.
        path: PathBuf,
    },
    /// In-process memory storage (tests and throwaway runs).
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/uploads"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } if path.as_os_str().is_empty() => {
                Err("storage.path must not be empty".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Session tracker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TrackerConfig {
    /// Sessions live in process memory and are lost on restart.
    Memory,
    /// Sessions persist in a SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// How long a connection waits on a locked database, in seconds.
        #[serde(default = "default_busy_timeout_secs")]
        busy_timeout_secs: u64,
    },
}

fn default_busy_timeout_secs() -> u64 {
    5
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/sessions.db"),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Assembly engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Session tracker configuration.
    #[serde(default)]
    pub tracker: TrackerConfig,
}

impl AppConfig {
    /// Create a test configuration.
    ///
    /// **For testing only.** Uses memory storage and a memory tracker.
    pub fn for_testing() -> Self {
        Self {
            engine: EngineConfig::default(),
            storage: StorageConfig::Memory,
            tracker: TrackerConfig::Memory,
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.engine.validate()?;
        self.storage.validate()?;
        Ok(())
    }
}
