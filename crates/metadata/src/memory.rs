//! In-process session store.

use crate::error::{TrackerError, TrackerResult};
use crate::store::{SessionStore, check_recordable, plan_finish};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use quilt_core::{ChunkReadiness, SessionHeader, SessionState, UploadId, UploadSession};
use time::OffsetDateTime;

/// Session store backed by a sharded map.
///
/// Each update runs while holding the entry's shard lock, which makes every
/// operation atomic per session. Sessions are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<UploadId, UploadSession>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_sorted(
        &self,
        limit: u32,
        filter: impl Fn(&UploadSession) -> bool,
    ) -> Vec<UploadSession> {
        let mut sessions: Vec<UploadSession> = self
            .sessions
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions.truncate(limit as usize);
        sessions
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn migrate(&self) -> TrackerResult<()> {
        Ok(())
    }

    async fn health_check(&self) -> TrackerResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn insert_if_absent(
        &self,
        session: UploadSession,
    ) -> TrackerResult<(SessionHeader, bool)> {
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(existing) => Ok((existing.get().header(), false)),
            Entry::Vacant(slot) => Ok((slot.insert(session).value().header(), true)),
        }
    }

    async fn get(&self, upload_id: &UploadId) -> TrackerResult<Option<UploadSession>> {
        Ok(self.sessions.get(upload_id).map(|s| s.value().clone()))
    }

    async fn record_chunk(
        &self,
        upload_id: &UploadId,
        index: u32,
        now: OffsetDateTime,
    ) -> TrackerResult<ChunkReadiness> {
        let mut session = self
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| TrackerError::SessionNotFound(upload_id.clone()))?;

        check_recordable(
            upload_id,
            session.state,
            session.failure_reason.as_deref(),
            index,
            session.total_chunks,
        )?;

        if session.received.insert(index) {
            session.updated_at = now;
            if session.is_ready() {
                session.state = SessionState::Merging;
                return Ok(ChunkReadiness::ReadyToMerge);
            }
        }
        Ok(ChunkReadiness::StillOpen)
    }

    async fn finish(
        &self,
        upload_id: &UploadId,
        to: SessionState,
        reason: Option<&str>,
        now: OffsetDateTime,
    ) -> TrackerResult<SessionHeader> {
        let mut session = self
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| TrackerError::SessionNotFound(upload_id.clone()))?;

        if plan_finish(session.state, to)? {
            session.state = to;
            session.updated_at = now;
            if to == SessionState::Failed {
                session.failure_reason = reason.map(str::to_string);
            }
        }
        Ok(session.value().header())
    }

    async fn list_in_state(
        &self,
        state: SessionState,
        limit: u32,
    ) -> TrackerResult<Vec<UploadSession>> {
        Ok(self.collect_sorted(limit, |s| s.state == state))
    }

    async fn list_expired(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> TrackerResult<Vec<UploadSession>> {
        Ok(self.collect_sorted(limit, |s| {
            s.state == SessionState::Open && s.is_expired_at(now)
        }))
    }
}
