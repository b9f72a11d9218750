//! Per-upload mutual exclusion.

use crate::error::{EngineError, EngineResult};
use dashmap::DashMap;
use quilt_core::UploadId;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = Arc<DashMap<UploadId, Arc<Mutex<()>>>>;

/// Async mutex per upload ID, acquired with a timeout.
///
/// Different uploads never contend. An entry exists only while someone holds
/// or waits for it; the last guard to drop removes it.
#[derive(Clone)]
pub struct SessionLocks {
    locks: LockMap,
    timeout: Duration,
}

/// Held session lock. Releases on drop.
pub struct SessionLockGuard {
    upload_id: UploadId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl SessionLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Lock `upload_id`, failing with `LockTimeout` after the configured wait.
    pub async fn acquire(&self, upload_id: &UploadId) -> EngineResult<SessionLockGuard> {
        // Cloned under the shard lock, so pruning cannot race this insert.
        let mutex = self
            .locks
            .entry(upload_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let mut held = SessionLockGuard {
            upload_id: upload_id.clone(),
            guard: None,
            locks: Arc::clone(&self.locks),
        };

        // `lock_owned` consumes the clone, so on timeout it is dropped with the
        // future, before `held` prunes the entry.
        let acquired = tokio::time::timeout(self.timeout, mutex.lock_owned()).await;
        match acquired {
            Ok(guard) => {
                held.guard = Some(guard);
                Ok(held)
            }
            Err(_) => {
                tracing::warn!(
                    upload_id = %upload_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Timed out waiting for session lock"
                );
                Err(EngineError::LockTimeout {
                    upload_id: upload_id.clone(),
                    waited: self.timeout,
                })
            }
        }
    }

    /// Run `f` while holding the lock for `upload_id`.
    pub async fn with_lock<F, Fut, T>(&self, upload_id: &UploadId, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let _guard = self.acquire(upload_id).await?;
        f().await
    }

    /// Number of uploads with a held or awaited lock.
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

impl SessionLockGuard {
    pub fn upload_id(&self) -> &UploadId {
        &self.upload_id
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        // Release first so the map holds the only reference when idle.
        drop(self.guard.take());
        self.locks
            .remove_if(&self.upload_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
