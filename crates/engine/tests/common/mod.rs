#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use quilt_core::config::EngineConfig;
use quilt_core::{ChunkReadiness, SessionHeader, SessionState, UploadId, UploadSession};
use quilt_engine::AssemblyEngine;
use quilt_metadata::{MemoryStore, SessionStore, TrackerError, TrackerResult};
use quilt_storage::error::{StorageError, StorageResult};
use quilt_storage::traits::{ObjectMeta, ObjectStore, StreamingUpload};
use quilt_storage::MemoryBackend;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;

pub fn id(s: &str) -> UploadId {
    UploadId::parse(s).unwrap()
}

/// Deterministic payload for chunk `index` of a test upload.
pub fn chunk_bytes(index: u32, len: usize) -> Bytes {
    let mut state = u64::from(index).wrapping_add(0x9e37_79b9_7f4a_7c15);
    let data: Vec<u8> = (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            (state >> 56) as u8
        })
        .collect();
    Bytes::from(data)
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        lock_timeout_ms: 5_000,
        ..EngineConfig::default()
    }
}

/// Engine over a fault-injecting memory backend and a memory tracker.
pub fn memory_engine(config: EngineConfig) -> (AssemblyEngine, Arc<FaultyBackend>) {
    engine_with_sessions(Arc::new(MemoryStore::new()), config)
}

/// Engine over a fault-injecting memory backend and the given session store.
pub fn engine_with_sessions(
    sessions: Arc<dyn SessionStore>,
    config: EngineConfig,
) -> (AssemblyEngine, Arc<FaultyBackend>) {
    let backend = Arc::new(FaultyBackend::new());
    let engine = AssemblyEngine::new(backend.clone(), sessions, config);
    (engine, backend)
}

/// Memory backend that can be told to fail or slow down.
#[derive(Default)]
pub struct FaultyBackend {
    inner: MemoryBackend,
    failing_puts: AtomicUsize,
    failing_gets: Mutex<HashSet<String>>,
    put_delay: Mutex<Option<Duration>>,
    get_delay: Mutex<Option<Duration>>,
    failing_lists: AtomicBool,
    puts: AtomicUsize,
}

impl FaultyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Fail the next `n` `put` calls.
    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Fail every `get` of `key` with an I/O error.
    pub fn fail_gets_of(&self, key: &str) {
        self.failing_gets.lock().unwrap().insert(key.to_string());
    }

    /// Sleep before every `put`.
    pub fn delay_puts(&self, delay: Duration) {
        *self.put_delay.lock().unwrap() = Some(delay);
    }

    /// Sleep before every `get`.
    pub fn delay_gets(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = Some(delay);
    }

    /// Fail every `list` with an I/O error.
    pub fn fail_lists(&self) {
        self.failing_lists.store(true, Ordering::SeqCst);
    }

    /// Number of `put` calls that reached the inner store.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Keys currently stored under `prefix`.
    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        let mut keys = self.inner.list(prefix).await.unwrap();
        keys.sort();
        keys
    }

    fn take_put_failure(&self) -> bool {
        self.failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for FaultyBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_gets.lock().unwrap().contains(key) {
            return Err(StorageError::Io(std::io::Error::other("injected read failure")));
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let delay = *self.put_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.take_put_failure() {
            return Err(StorageError::Io(std::io::Error::other("injected write failure")));
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, data).await
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.inner.put_stream(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        if self.failing_lists.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("injected list failure")));
        }
        self.inner.list(prefix).await
    }

    fn locate(&self, key: &str) -> String {
        self.inner.locate(key)
    }

    fn backend_name(&self) -> &'static str {
        "faulty-memory"
    }
}

/// Memory session store that cannot persist `Complete`.
#[derive(Default)]
pub struct UnsealableStore {
    inner: MemoryStore,
}

#[async_trait]
impl SessionStore for UnsealableStore {
    async fn migrate(&self) -> TrackerResult<()> {
        self.inner.migrate().await
    }

    async fn health_check(&self) -> TrackerResult<()> {
        self.inner.health_check().await
    }

    fn backend_name(&self) -> &'static str {
        "unsealable-memory"
    }

    async fn insert_if_absent(
        &self,
        session: UploadSession,
    ) -> TrackerResult<(SessionHeader, bool)> {
        self.inner.insert_if_absent(session).await
    }

    async fn get(&self, upload_id: &UploadId) -> TrackerResult<Option<UploadSession>> {
        self.inner.get(upload_id).await
    }

    async fn record_chunk(
        &self,
        upload_id: &UploadId,
        index: u32,
        now: OffsetDateTime,
    ) -> TrackerResult<ChunkReadiness> {
        self.inner.record_chunk(upload_id, index, now).await
    }

    async fn finish(
        &self,
        upload_id: &UploadId,
        to: SessionState,
        reason: Option<&str>,
        now: OffsetDateTime,
    ) -> TrackerResult<SessionHeader> {
        if to == SessionState::Complete {
            return Err(TrackerError::Io(std::io::Error::other("database is locked")));
        }
        self.inner.finish(upload_id, to, reason, now).await
    }

    async fn list_in_state(
        &self,
        state: SessionState,
        limit: u32,
    ) -> TrackerResult<Vec<UploadSession>> {
        self.inner.list_in_state(state, limit).await
    }

    async fn list_expired(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> TrackerResult<Vec<UploadSession>> {
        self.inner.list_expired(now, limit).await
    }
}
