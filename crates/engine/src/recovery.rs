//! Startup recovery and expiry sweeps.
//!
//! Both passes take the session lock before touching a session and re-read
//! its state under the lock, so a session that a live caller is merging is
//! never failed out from under it.

use crate::assembly::{AssemblyEngine, EXPIRED_REASON};
use crate::error::{EngineError, EngineResult};
use crate::metrics::record_upload_failed;
use quilt_core::{SessionState, UploadSession};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::instrument;

/// Failure reason recorded for sessions found mid-merge at startup.
pub const MERGE_INTERRUPTED_REASON: &str = "merge interrupted";

/// Counts from `recover_interrupted_merges`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub examined: u64,
    pub failed: u64,
    pub chunks_deleted: u64,
    /// Sessions whose lock could not be taken; retried on the next run.
    pub skipped: u64,
}

/// Counts from `sweep_expired`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: u64,
    pub failed: u64,
    pub chunks_deleted: u64,
    pub skipped: u64,
}

/// What happened to one session in a pass.
enum Visit {
    Failed { chunks_deleted: usize },
    Unchanged,
    Skipped,
}

impl AssemblyEngine {
    /// Fail every session left in `Merging` and delete its chunks.
    ///
    /// Run at startup, before accepting traffic. Interrupted merges are not
    /// resumed; the client re-uploads under a new ID.
    #[instrument(skip(self))]
    pub async fn recover_interrupted_merges(&self) -> EngineResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let limit = self.config.sweep_batch_size;

        loop {
            let batch = self
                .tracker
                .list_in_state(SessionState::Merging, limit)
                .await?;
            let mut progressed = 0;
            for session in &batch {
                report.examined += 1;
                let visit = self
                    .fail_under_lock(
                        session,
                        MERGE_INTERRUPTED_REASON,
                        "merge_interrupted",
                        |s| s.state == SessionState::Merging,
                    )
                    .await?;
                match visit {
                    Visit::Failed { chunks_deleted } => {
                        progressed += 1;
                        report.failed += 1;
                        report.chunks_deleted += chunks_deleted as u64;
                    }
                    Visit::Unchanged => progressed += 1,
                    Visit::Skipped => report.skipped += 1,
                }
            }
            if batch.len() < limit as usize || progressed == 0 {
                break;
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                failed = report.failed,
                chunks_deleted = report.chunks_deleted,
                skipped = report.skipped,
                "Recovered interrupted merges"
            );
        }
        Ok(report)
    }

    /// Fail open sessions whose expiry is before `now` and delete their chunks.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self, now: OffsetDateTime) -> EngineResult<SweepReport> {
        let mut report = SweepReport::default();
        let limit = self.config.sweep_batch_size;

        loop {
            let batch = self.tracker.list_expired(now, limit).await?;
            let mut progressed = 0;
            for session in &batch {
                report.examined += 1;
                match self
                    .fail_under_lock(session, EXPIRED_REASON, "upload_expired", |s| {
                        s.state == SessionState::Open && s.is_expired_at(now)
                    })
                    .await?
                {
                    Visit::Failed { chunks_deleted } => {
                        progressed += 1;
                        report.failed += 1;
                        report.chunks_deleted += chunks_deleted as u64;
                    }
                    Visit::Unchanged => progressed += 1,
                    Visit::Skipped => report.skipped += 1,
                }
            }
            if batch.len() < limit as usize || progressed == 0 {
                break;
            }
        }

        tracing::info!(
            examined = report.examined,
            failed = report.failed,
            chunks_deleted = report.chunks_deleted,
            skipped = report.skipped,
            "Expired session sweep finished"
        );
        Ok(report)
    }

    /// Take the session lock, re-check `still_eligible`, then fail the
    /// session and delete its chunks.
    async fn fail_under_lock<F>(
        &self,
        listed: &UploadSession,
        reason: &str,
        cause: &str,
        still_eligible: F,
    ) -> EngineResult<Visit>
    where
        F: Fn(&UploadSession) -> bool,
    {
        let upload_id = &listed.id;
        let _guard = match self.locks.acquire(upload_id).await {
            Ok(guard) => guard,
            Err(EngineError::LockTimeout { .. }) => return Ok(Visit::Skipped),
            Err(e) => return Err(e),
        };

        let Some(current) = self.tracker.get(upload_id).await? else {
            return Ok(Visit::Unchanged);
        };
        if !still_eligible(&current) {
            return Ok(Visit::Unchanged);
        }

        self.tracker.mark_failed(upload_id, reason).await?;
        record_upload_failed(cause);
        let chunks_deleted = self.cleanup_chunks(upload_id).await;
        Ok(Visit::Failed { chunks_deleted })
    }
}
