//! Chunk ingest and artifact assembly.

use crate::error::{EngineError, EngineResult};
use crate::guard::{SessionLockGuard, SessionLocks};
use crate::metrics::{self, record_upload_failed};
use crate::outcome::{ChunkUpload, IngestOutcome, SessionReport};
use quilt_core::chunk::validate_file_name;
use quilt_core::config::EngineConfig;
use quilt_core::{
    ChunkReadiness, MergedArtifact, SessionHeader, SessionState, UploadId, UploadSession,
};
use quilt_metadata::{SessionStore, SessionTracker};
use quilt_storage::{ArtifactStore, ChunkStore, ObjectStore};
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, instrument};

/// Failure reason recorded for sessions that outlived their TTL.
pub const EXPIRED_REASON: &str = "expired";

/// Assembles uploads delivered as independently submitted chunks.
///
/// Chunk writes for one upload run concurrently. Recording an arrival,
/// deciding readiness and merging are serialized per upload by
/// `SessionLocks`. The merge is started by the caller that completed the set
/// and runs in its own task holding the session lock, so it finishes even if
/// that caller is dropped.
#[derive(Clone)]
pub struct AssemblyEngine {
    pub(crate) chunks: ChunkStore,
    artifacts: ArtifactStore,
    pub(crate) tracker: SessionTracker,
    pub(crate) locks: SessionLocks,
    pub(crate) config: EngineConfig,
}

impl AssemblyEngine {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        sessions: Arc<dyn SessionStore>,
        config: EngineConfig,
    ) -> Self {
        metrics::register_metrics();
        Self {
            chunks: ChunkStore::new(Arc::clone(&storage)),
            artifacts: ArtifactStore::new(storage),
            tracker: SessionTracker::new(sessions, config.session_ttl()),
            locks: SessionLocks::new(config.lock_timeout()),
            config,
        }
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Accept one chunk of an upload.
    ///
    /// Returns `ChunkAccepted` while chunks are outstanding and
    /// `UploadComplete` to the single caller whose chunk completed the set.
    #[instrument(
        skip(self, upload),
        fields(
            upload_id = %upload.upload_id,
            index = upload.index,
            total_chunks = upload.total_chunks,
            size = upload.payload.len()
        )
    )]
    pub async fn ingest_chunk(&self, upload: ChunkUpload) -> EngineResult<IngestOutcome> {
        let start_time = Instant::now();
        let result = self.ingest(upload).await;
        match &result {
            Ok(_) => metrics::INGEST_DURATION.observe(start_time.elapsed().as_secs_f64()),
            Err(e) => {
                metrics::record_ingest_error(e.code());
                if e.is_retryable() {
                    tracing::warn!(error = %e, "Chunk ingest failed, retry is safe");
                } else {
                    tracing::debug!(error = %e, "Chunk rejected");
                }
            }
        }
        result
    }

    async fn ingest(&self, upload: ChunkUpload) -> EngineResult<IngestOutcome> {
        self.validate(&upload)?;
        let ChunkUpload {
            upload_id,
            index,
            total_chunks,
            payload,
            file_name,
        } = upload;

        let session = self
            .tracker
            .get_or_create(&upload_id, total_chunks, file_name.as_deref())
            .await?;
        match session.state {
            SessionState::Open if session.is_expired() => {
                self.expire_session(&upload_id).await?;
                return Err(EngineError::UploadExpired(upload_id));
            }
            SessionState::Open => {}
            SessionState::Merging | SessionState::Complete => {
                return Err(EngineError::SessionAlreadyMerging {
                    upload_id,
                    state: session.state,
                });
            }
            SessionState::Failed => {
                return Err(EngineError::SessionFailed {
                    upload_id,
                    reason: session
                        .failure_reason
                        .unwrap_or_else(|| "unknown".to_string()),
                });
            }
        }

        let size = payload.len() as u64;
        self.chunks
            .put(&upload_id, index, payload)
            .await
            .map_err(|source| EngineError::StorageFailure {
                upload_id: upload_id.clone(),
                index,
                source,
            })?;
        metrics::CHUNKS_STORED.inc();
        metrics::BYTES_STORED.inc_by(size);

        let guard = self.locks.acquire(&upload_id).await?;

        let readiness = match self.tracker.record_chunk(&upload_id, index).await {
            Ok(readiness) => readiness,
            Err(e) if e.is_session_closed() => {
                // Closed while this chunk was being written; the blob is ours to drop.
                self.discard_stray_chunk(&upload_id, index).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        match readiness {
            ChunkReadiness::StillOpen => Ok(IngestOutcome::ChunkAccepted),
            ChunkReadiness::ReadyToMerge => {
                let artifact = self.spawn_merge(session, guard).await?;
                Ok(IngestOutcome::UploadComplete(artifact))
            }
        }
    }

    fn validate(&self, upload: &ChunkUpload) -> EngineResult<()> {
        if upload.total_chunks == 0 {
            return Err(EngineError::InvalidRequest(
                "total_chunks must be at least 1".to_string(),
            ));
        }
        if upload.total_chunks > self.config.max_total_chunks {
            return Err(EngineError::InvalidRequest(format!(
                "total_chunks {} exceeds maximum {}",
                upload.total_chunks, self.config.max_total_chunks
            )));
        }
        if upload.index >= upload.total_chunks {
            return Err(EngineError::InvalidRequest(format!(
                "chunk index {} out of range for {} chunks",
                upload.index, upload.total_chunks
            )));
        }
        let size = upload.payload.len() as u64;
        if size > self.config.max_chunk_size {
            return Err(EngineError::InvalidRequest(format!(
                "chunk size {size} exceeds maximum {}",
                self.config.max_chunk_size
            )));
        }
        if size == 0 && upload.total_chunks > 1 {
            return Err(EngineError::InvalidRequest(
                "empty chunk in a multi-chunk upload".to_string(),
            ));
        }
        if let Some(name) = &upload.file_name {
            validate_file_name(name).map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        }
        Ok(())
    }

    /// Run `merge_and_finalize` in a task that owns `guard`.
    ///
    /// Dropping the returned future does not stop the merge: the session
    /// still reaches `Complete` or `Failed`, and the lock is held until it
    /// does.
    async fn spawn_merge(
        &self,
        session: SessionHeader,
        guard: SessionLockGuard,
    ) -> EngineResult<MergedArtifact> {
        let engine = self.clone();
        let upload_id = session.id.clone();
        let task = tokio::spawn(
            async move {
                let _guard = guard;
                engine.merge_and_finalize(&session).await
            }
            .in_current_span(),
        );

        task.await.map_err(|e| {
            tracing::error!(upload_id = %upload_id, error = %e, "Merge task did not finish");
            EngineError::Internal(format!("merge task for {upload_id} failed: {e}"))
        })?
    }

    /// Merge a session that just moved to `Merging`, then finalize it.
    ///
    /// Callers must hold the session lock.
    async fn merge_and_finalize(&self, session: &SessionHeader) -> EngineResult<MergedArtifact> {
        let upload_id = &session.id;
        let start_time = Instant::now();

        match self.merge(session).await {
            Ok(artifact) => {
                if let Err(e) = self.tracker.mark_complete(upload_id).await {
                    // An artifact must never outlive a session that is not complete.
                    self.discard_artifact(&artifact).await;
                    return Err(self.fail_merge(upload_id, e.into()).await);
                }
                metrics::MERGE_DURATION.observe(start_time.elapsed().as_secs_f64());
                metrics::UPLOADS_COMPLETED.inc();
                metrics::ARTIFACT_BYTES.inc_by(artifact.total_size_bytes);
                tracing::info!(
                    upload_id = %upload_id,
                    total_chunks = session.total_chunks,
                    total_size_bytes = artifact.total_size_bytes,
                    locator = %artifact.locator,
                    "Upload complete"
                );
                self.cleanup_chunks(upload_id).await;
                Ok(artifact)
            }
            Err(err) => Err(self.fail_merge(upload_id, err).await),
        }
    }

    /// Fail a session whose merge did not complete and drop its chunks.
    ///
    /// If the session cannot be marked failed it stays `Merging` for
    /// `recover_interrupted_merges`.
    async fn fail_merge(&self, upload_id: &UploadId, err: EngineError) -> EngineError {
        tracing::warn!(
            upload_id = %upload_id,
            error = %err,
            "Merge failed, failing session"
        );
        if let Err(mark_err) = self.tracker.mark_failed(upload_id, &err.to_string()).await {
            tracing::warn!(
                upload_id = %upload_id,
                error = %mark_err,
                "Failed to mark session as failed after merge error"
            );
        }
        record_upload_failed(err.code());
        self.cleanup_chunks(upload_id).await;
        err
    }

    /// Concatenate chunks `0..total_chunks` in numeric order into the artifact.
    ///
    /// One chunk is held in memory at a time. Nothing is published unless
    /// every chunk was appended.
    async fn merge(&self, session: &SessionHeader) -> EngineResult<MergedArtifact> {
        let upload_id = &session.id;
        let merge_failure = |source| EngineError::MergeFailure {
            upload_id: upload_id.clone(),
            source,
        };

        let mut writer = self
            .artifacts
            .create(upload_id, &session.artifact_file_name())
            .await
            .map_err(merge_failure)?;

        for index in 0..session.total_chunks {
            let appended = match self.chunks.get(upload_id, index).await {
                Ok(data) => writer.append(data).await.map_err(merge_failure),
                Err(e) if e.is_not_found() => Err(EngineError::MissingChunk {
                    upload_id: upload_id.clone(),
                    index,
                }),
                Err(e) => Err(merge_failure(e)),
            };
            if let Err(err) = appended {
                if let Err(abort_err) = writer.abort().await {
                    tracing::warn!(
                        upload_id = %upload_id,
                        error = %abort_err,
                        "Failed to abort artifact write"
                    );
                }
                return Err(err);
            }
        }

        writer.finish().await.map_err(merge_failure)
    }

    /// Best-effort deletion of every chunk of a terminal session.
    pub(crate) async fn cleanup_chunks(&self, upload_id: &UploadId) -> usize {
        match self.chunks.delete_all(upload_id).await {
            Ok(deleted) => deleted,
            Err(e) => {
                metrics::CLEANUP_FAILURES.inc();
                tracing::warn!(
                    upload_id = %upload_id,
                    error = %e,
                    "Failed to delete chunk blobs, leaving them for a later sweep"
                );
                0
            }
        }
    }

    async fn discard_artifact(&self, artifact: &MergedArtifact) {
        if let Err(e) = self.artifacts.delete(artifact).await {
            metrics::CLEANUP_FAILURES.inc();
            tracing::warn!(
                upload_id = %artifact.upload_id,
                object_key = %artifact.object_key,
                error = %e,
                "Failed to delete artifact of an unfinished session"
            );
        }
    }

    async fn discard_stray_chunk(&self, upload_id: &UploadId, index: u32) {
        match self.chunks.delete(upload_id, index).await {
            Ok(()) => metrics::STRAY_CHUNKS_DISCARDED.inc(),
            Err(e) => {
                metrics::CLEANUP_FAILURES.inc();
                tracing::warn!(
                    upload_id = %upload_id,
                    index,
                    error = %e,
                    "Failed to discard chunk written after session closed"
                );
            }
        }
    }

    /// Fail an open session that is past its expiry and drop its chunks.
    ///
    /// The state is re-read under the session lock. Returns whether this call
    /// performed the transition.
    pub(crate) async fn expire_session(&self, upload_id: &UploadId) -> EngineResult<bool> {
        let _guard = self.locks.acquire(upload_id).await?;

        let Some(session) = self.tracker.get(upload_id).await? else {
            return Ok(false);
        };
        if session.state != SessionState::Open || !session.is_expired() {
            return Ok(false);
        }

        self.tracker.mark_failed(upload_id, EXPIRED_REASON).await?;
        record_upload_failed("upload_expired");
        self.cleanup_chunks(upload_id).await;
        Ok(true)
    }

    /// Current session state. The way a late caller observes completion.
    pub async fn status(&self, upload_id: &UploadId) -> EngineResult<UploadSession> {
        self.tracker
            .get(upload_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(upload_id.clone()))
    }

    /// Compare the recorded session with the blobs actually stored.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn inspect(&self, upload_id: &UploadId) -> EngineResult<SessionReport> {
        let session = self.status(upload_id).await?;
        let stored = self
            .chunks
            .list_indices(upload_id)
            .await
            .map_err(|source| EngineError::InspectFailure {
                upload_id: upload_id.clone(),
                source,
            })?;

        let missing_from_store = if session.state.is_terminal() {
            Vec::new()
        } else {
            session
                .received
                .iter()
                .filter(|i| !stored.contains(i))
                .copied()
                .collect()
        };
        let orphaned_in_store = stored
            .iter()
            .filter(|i| !session.received.contains(i))
            .copied()
            .collect();

        Ok(SessionReport {
            stored_indices: stored.into_iter().collect(),
            missing_from_store,
            orphaned_in_store,
            session,
        })
    }
}
