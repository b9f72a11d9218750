//! Session lifecycle operations on top of a `SessionStore`.

use crate::error::{TrackerError, TrackerResult};
use crate::store::SessionStore;
use quilt_core::{ChunkReadiness, SessionHeader, SessionState, UploadId, UploadSession};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::instrument;

/// Tracks which chunks of each upload have arrived and owns the session
/// state machine.
#[derive(Clone)]
pub struct SessionTracker {
    store: Arc<dyn SessionStore>,
    session_ttl: Duration,
}

impl SessionTracker {
    pub fn new(store: Arc<dyn SessionStore>, session_ttl: Duration) -> Self {
        Self { store, session_ttl }
    }

    /// Underlying session store.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Return the session for `upload_id`, creating an open one if absent.
    ///
    /// An existing session must have been declared with the same
    /// `total_chunks`; otherwise `InconsistentTotal` is returned and the
    /// session is left unchanged. Concurrent first calls resolve to a single
    /// session. Only the header is loaded, never the received set.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn get_or_create(
        &self,
        upload_id: &UploadId,
        total_chunks: u32,
        file_name: Option<&str>,
    ) -> TrackerResult<SessionHeader> {
        let candidate = UploadSession::new(
            upload_id.clone(),
            total_chunks,
            file_name.map(str::to_string),
            self.session_ttl,
        );
        let (session, created) = self.store.insert_if_absent(candidate).await?;

        if session.total_chunks != total_chunks {
            tracing::warn!(
                upload_id = %upload_id,
                existing = session.total_chunks,
                requested = total_chunks,
                "Rejected chunk with inconsistent total"
            );
            return Err(TrackerError::InconsistentTotal {
                upload_id: upload_id.clone(),
                existing: session.total_chunks,
                requested: total_chunks,
            });
        }

        if created {
            tracing::info!(
                upload_id = %upload_id,
                total_chunks,
                expires_at = %session.expires_at,
                "Created upload session"
            );
        }
        Ok(session)
    }

    /// Record that chunk `index` is durably stored.
    ///
    /// Idempotent per index. Returns `ReadyToMerge` exactly once per session,
    /// together with the `Open -> Merging` transition.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn record_chunk(
        &self,
        upload_id: &UploadId,
        index: u32,
    ) -> TrackerResult<ChunkReadiness> {
        let readiness = self
            .store
            .record_chunk(upload_id, index, OffsetDateTime::now_utc())
            .await?;
        if readiness == ChunkReadiness::ReadyToMerge {
            tracing::debug!("All chunks received");
        }
        Ok(readiness)
    }

    /// `Merging -> Complete`. A no-op on a session that is already complete.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn mark_complete(&self, upload_id: &UploadId) -> TrackerResult<SessionHeader> {
        self.store
            .finish(
                upload_id,
                SessionState::Complete,
                None,
                OffsetDateTime::now_utc(),
            )
            .await
    }

    /// `Open | Merging -> Failed`. A no-op on a session that already failed;
    /// the first reason is kept.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn mark_failed(
        &self,
        upload_id: &UploadId,
        reason: &str,
    ) -> TrackerResult<SessionHeader> {
        let session = self
            .store
            .finish(
                upload_id,
                SessionState::Failed,
                Some(reason),
                OffsetDateTime::now_utc(),
            )
            .await?;
        tracing::info!(
            upload_id = %upload_id,
            reason = session.failure_reason.as_deref().unwrap_or(reason),
            "Upload session failed"
        );
        Ok(session)
    }

    /// Get a session by ID.
    pub async fn get(&self, upload_id: &UploadId) -> TrackerResult<Option<UploadSession>> {
        self.store.get(upload_id).await
    }

    /// Sessions currently in `state`, oldest first.
    pub async fn list_in_state(
        &self,
        state: SessionState,
        limit: u32,
    ) -> TrackerResult<Vec<UploadSession>> {
        self.store.list_in_state(state, limit).await
    }

    /// Open sessions past their expiry as of `now`.
    pub async fn list_expired(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> TrackerResult<Vec<UploadSession>> {
        self.store.list_expired(now, limit).await
    }
}
