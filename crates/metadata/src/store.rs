//! Session store trait and the state rules every implementation applies.

use crate::error::{TrackerError, TrackerResult};
use async_trait::async_trait;
use quilt_core::{ChunkReadiness, SessionHeader, SessionState, UploadId, UploadSession};
use time::OffsetDateTime;

/// Persistence for upload sessions.
///
/// Every method is atomic with respect to other calls on the same session.
/// In particular `record_chunk` inserts the index, updates the count and
/// performs the `Open -> Merging` transition as one step, so exactly one
/// caller ever observes `ChunkReadiness::ReadyToMerge`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create or upgrade the backing schema.
    async fn migrate(&self) -> TrackerResult<()>;

    /// Check backend connectivity and health.
    async fn health_check(&self) -> TrackerResult<()>;

    /// Short backend identifier for logs.
    fn backend_name(&self) -> &'static str;

    /// Insert `session` unless one with the same ID exists.
    ///
    /// Returns the header of the stored session (the new one, or the
    /// existing one untouched) and whether this call created it. Runs on
    /// every chunk, so it must not read the received set.
    async fn insert_if_absent(
        &self,
        session: UploadSession,
    ) -> TrackerResult<(SessionHeader, bool)>;

    /// Get a session by ID.
    async fn get(&self, upload_id: &UploadId) -> TrackerResult<Option<UploadSession>>;

    /// Record arrival of one chunk index.
    async fn record_chunk(
        &self,
        upload_id: &UploadId,
        index: u32,
        now: OffsetDateTime,
    ) -> TrackerResult<ChunkReadiness>;

    /// Move a session to a terminal state.
    ///
    /// Repeating a transition into the state the session already holds is a
    /// no-op that keeps the stored record (including the first failure
    /// reason).
    async fn finish(
        &self,
        upload_id: &UploadId,
        to: SessionState,
        reason: Option<&str>,
        now: OffsetDateTime,
    ) -> TrackerResult<SessionHeader>;

    /// Sessions currently in `state`, oldest first.
    async fn list_in_state(&self, state: SessionState, limit: u32)
    -> TrackerResult<Vec<UploadSession>>;

    /// Open sessions whose `expires_at` lies before `now`.
    async fn list_expired(&self, now: OffsetDateTime, limit: u32)
    -> TrackerResult<Vec<UploadSession>>;
}

/// Reject recording on a session that is not open or an out-of-range index.
pub(crate) fn check_recordable(
    upload_id: &UploadId,
    state: SessionState,
    failure_reason: Option<&str>,
    index: u32,
    total_chunks: u32,
) -> TrackerResult<()> {
    match state {
        SessionState::Open => {}
        SessionState::Merging | SessionState::Complete => {
            return Err(TrackerError::SessionAlreadyMerging {
                upload_id: upload_id.clone(),
                state,
            });
        }
        SessionState::Failed => {
            return Err(TrackerError::SessionFailed {
                upload_id: upload_id.clone(),
                reason: failure_reason.unwrap_or("unknown").to_string(),
            });
        }
    }
    if index >= total_chunks {
        return Err(TrackerError::InvalidIndex {
            index,
            total: total_chunks,
        });
    }
    Ok(())
}

/// Decide a terminal transition. `Ok(false)` means the session already
/// holds `to` and nothing should change.
pub(crate) fn plan_finish(current: SessionState, to: SessionState) -> TrackerResult<bool> {
    if !to.is_terminal() {
        return Err(TrackerError::InvalidStateTransition { from: current, to });
    }
    if current == to {
        return Ok(false);
    }
    if current.can_transition_to(to) {
        Ok(true)
    } else {
        Err(TrackerError::InvalidStateTransition { from: current, to })
    }
}
