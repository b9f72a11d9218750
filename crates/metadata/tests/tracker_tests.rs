//! Session tracker behaviour, run against every store implementation.

use quilt_core::{ChunkReadiness, SessionState, UploadId};
use quilt_metadata::{MemoryStore, SessionStore, SessionTracker, SqliteStore, TrackerError};
use std::sync::Arc;
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

fn id(s: &str) -> UploadId {
    UploadId::parse(s).unwrap()
}

/// Keeps the temp dir alive for SQLite-backed trackers.
struct Harness {
    tracker: SessionTracker,
    _dir: Option<TempDir>,
}

async fn memory_tracker(ttl: Duration) -> Harness {
    Harness {
        tracker: SessionTracker::new(Arc::new(MemoryStore::new()), ttl),
        _dir: None,
    }
}

async fn sqlite_tracker(ttl: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("sessions.db"), 5)
        .await
        .unwrap();
    Harness {
        tracker: SessionTracker::new(Arc::new(store), ttl),
        _dir: Some(dir),
    }
}

macro_rules! tracker_suite {
    ($($name:ident),* $(,)?) => {
        mod memory {
            $(
                #[tokio::test]
                async fn $name() {
                    let h = super::memory_tracker(time::Duration::hours(1)).await;
                    super::$name(&h.tracker).await;
                }
            )*
        }

        mod sqlite {
            $(
                #[tokio::test]
                async fn $name() {
                    let h = super::sqlite_tracker(time::Duration::hours(1)).await;
                    super::$name(&h.tracker).await;
                }
            )*
        }
    };
}

tracker_suite!(
    test_creates_then_returns_existing_session,
    test_rejects_inconsistent_total,
    test_ready_to_merge_once_in_any_order,
    test_record_is_idempotent,
    test_record_rejects_out_of_range_index,
    test_record_after_merge_or_failure_is_rejected,
    test_terminal_transitions_follow_rules,
    test_mark_failed_keeps_first_reason,
    test_lists_sessions_by_state,
    test_concurrent_records_yield_single_ready,
);

async fn test_creates_then_returns_existing_session(tracker: &SessionTracker) {
    let upload = id("u1");
    let created = tracker
        .get_or_create(&upload, 3, Some("merged.bin"))
        .await
        .unwrap();
    assert_eq!(created.state, SessionState::Open);
    assert_eq!(created.total_chunks, 3);
    assert_eq!(created.artifact_file_name(), "merged.bin");

    tracker.record_chunk(&upload, 1).await.unwrap();

    // A later caller with a different file name sees the original session.
    let again = tracker.get_or_create(&upload, 3, None).await.unwrap();
    assert_eq!(again.file_name.as_deref(), Some("merged.bin"));
    assert_eq!(again.received_count, 1);
    assert_eq!(again.state, SessionState::Open);

    let full = tracker.get(&upload).await.unwrap().unwrap();
    assert_eq!(full.header(), again);
}

async fn test_rejects_inconsistent_total(tracker: &SessionTracker) {
    let upload = id("u1");
    tracker.get_or_create(&upload, 3, None).await.unwrap();

    let err = tracker.get_or_create(&upload, 4, None).await.unwrap_err();
    assert!(
        matches!(
            err,
            TrackerError::InconsistentTotal {
                existing: 3,
                requested: 4,
                ..
            }
        ),
        "{err:?}"
    );

    let session = tracker.get(&upload).await.unwrap().unwrap();
    assert_eq!(session.total_chunks, 3);
    assert_eq!(session.state, SessionState::Open);
}

async fn test_ready_to_merge_once_in_any_order(tracker: &SessionTracker) {
    let upload = id("u1");
    tracker.get_or_create(&upload, 12, None).await.unwrap();

    let order = [11, 3, 0, 10, 1, 7, 2, 9, 4, 8, 6];
    for index in order {
        assert_eq!(
            tracker.record_chunk(&upload, index).await.unwrap(),
            ChunkReadiness::StillOpen
        );
    }
    let session = tracker.get(&upload).await.unwrap().unwrap();
    assert_eq!(session.missing_indices(), vec![5]);

    assert_eq!(
        tracker.record_chunk(&upload, 5).await.unwrap(),
        ChunkReadiness::ReadyToMerge
    );
    let session = tracker.get(&upload).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Merging);
    assert!(session.is_ready());
}

async fn test_record_is_idempotent(tracker: &SessionTracker) {
    let upload = id("u1");
    tracker.get_or_create(&upload, 2, None).await.unwrap();

    for _ in 0..3 {
        assert_eq!(
            tracker.record_chunk(&upload, 0).await.unwrap(),
            ChunkReadiness::StillOpen
        );
    }
    let session = tracker.get(&upload).await.unwrap().unwrap();
    assert_eq!(session.received_count(), 1);
}

async fn test_record_rejects_out_of_range_index(tracker: &SessionTracker) {
    let upload = id("u1");
    tracker.get_or_create(&upload, 2, None).await.unwrap();

    let err = tracker.record_chunk(&upload, 2).await.unwrap_err();
    assert!(matches!(err, TrackerError::InvalidIndex { index: 2, total: 2 }));

    let err = tracker.record_chunk(&id("nope"), 0).await.unwrap_err();
    assert!(matches!(err, TrackerError::SessionNotFound(_)));
}

async fn test_record_after_merge_or_failure_is_rejected(tracker: &SessionTracker) {
    let merged = id("merged");
    tracker.get_or_create(&merged, 1, None).await.unwrap();
    assert_eq!(
        tracker.record_chunk(&merged, 0).await.unwrap(),
        ChunkReadiness::ReadyToMerge
    );
    let err = tracker.record_chunk(&merged, 0).await.unwrap_err();
    assert!(matches!(
        err,
        TrackerError::SessionAlreadyMerging {
            state: SessionState::Merging,
            ..
        }
    ));

    tracker.mark_complete(&merged).await.unwrap();
    let err = tracker.record_chunk(&merged, 0).await.unwrap_err();
    assert!(matches!(
        err,
        TrackerError::SessionAlreadyMerging {
            state: SessionState::Complete,
            ..
        }
    ));

    let failed = id("failed");
    tracker.get_or_create(&failed, 2, None).await.unwrap();
    tracker.mark_failed(&failed, "disk full").await.unwrap();
    match tracker.record_chunk(&failed, 0).await {
        Err(TrackerError::SessionFailed { reason, .. }) => assert_eq!(reason, "disk full"),
        other => panic!("expected SessionFailed, got {other:?}"),
    }
}

async fn test_terminal_transitions_follow_rules(tracker: &SessionTracker) {
    let open = id("open");
    tracker.get_or_create(&open, 2, None).await.unwrap();
    let err = tracker.mark_complete(&open).await.unwrap_err();
    assert!(matches!(
        err,
        TrackerError::InvalidStateTransition {
            from: SessionState::Open,
            to: SessionState::Complete
        }
    ));

    let done = id("done");
    tracker.get_or_create(&done, 1, None).await.unwrap();
    tracker.record_chunk(&done, 0).await.unwrap();
    assert_eq!(
        tracker.mark_complete(&done).await.unwrap().state,
        SessionState::Complete
    );
    // Repeating is a no-op.
    assert_eq!(
        tracker.mark_complete(&done).await.unwrap().state,
        SessionState::Complete
    );
    let err = tracker.mark_failed(&done, "late").await.unwrap_err();
    assert!(matches!(err, TrackerError::InvalidStateTransition { .. }));

    let err = tracker.mark_complete(&id("ghost")).await.unwrap_err();
    assert!(matches!(err, TrackerError::SessionNotFound(_)));
}

async fn test_mark_failed_keeps_first_reason(tracker: &SessionTracker) {
    let upload = id("u1");
    tracker.get_or_create(&upload, 2, None).await.unwrap();

    tracker.mark_failed(&upload, "missing chunk 1").await.unwrap();
    let session = tracker.mark_failed(&upload, "expired").await.unwrap();
    assert_eq!(session.state, SessionState::Failed);
    assert_eq!(session.failure_reason.as_deref(), Some("missing chunk 1"));

    let err = tracker.mark_complete(&upload).await.unwrap_err();
    assert!(matches!(err, TrackerError::InvalidStateTransition { .. }));
}

async fn test_lists_sessions_by_state(tracker: &SessionTracker) {
    for name in ["a", "b", "c"] {
        let upload = id(name);
        tracker.get_or_create(&upload, 1, None).await.unwrap();
    }
    tracker.record_chunk(&id("b"), 0).await.unwrap();

    let merging = tracker
        .list_in_state(SessionState::Merging, 10)
        .await
        .unwrap();
    assert_eq!(merging.len(), 1);
    assert_eq!(merging[0].id, id("b"));

    let open = tracker.list_in_state(SessionState::Open, 10).await.unwrap();
    assert_eq!(open.len(), 2);
    let open = tracker.list_in_state(SessionState::Open, 1).await.unwrap();
    assert_eq!(open.len(), 1);

    // Nothing has expired within the hour.
    let expired = tracker
        .list_expired(OffsetDateTime::now_utc(), 10)
        .await
        .unwrap();
    assert!(expired.is_empty());

    let later = OffsetDateTime::now_utc() + Duration::hours(2);
    let expired = tracker.list_expired(later, 10).await.unwrap();
    let mut names: Vec<String> = expired.iter().map(|s| s.id.to_string()).collect();
    names.sort();
    assert_eq!(names, vec!["a", "c"]);
}

async fn test_concurrent_records_yield_single_ready(tracker: &SessionTracker) {
    let upload = id("race");
    let total = 32u32;
    tracker.get_or_create(&upload, total, None).await.unwrap();

    let mut handles = Vec::new();
    // Every index twice, to mix re-sends into the race.
    for index in (0..total).chain(0..total) {
        let tracker = tracker.clone();
        let upload = upload.clone();
        handles.push(tokio::spawn(async move {
            tracker.record_chunk(&upload, index).await
        }));
    }

    let mut ready = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(ChunkReadiness::ReadyToMerge) => ready += 1,
            Ok(ChunkReadiness::StillOpen) => {}
            // Re-sends that lose the race to the final record.
            Err(TrackerError::SessionAlreadyMerging { .. }) => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }
    assert_eq!(ready, 1);
    let session = tracker.get(&upload).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Merging);
    assert_eq!(session.received_count(), total);
}

#[tokio::test]
async fn test_expired_session_is_listed_only_while_open() {
    let h = memory_tracker(Duration::seconds(-1)).await;
    let upload = id("stale");
    h.tracker.get_or_create(&upload, 2, None).await.unwrap();

    let now = OffsetDateTime::now_utc();
    assert_eq!(h.tracker.list_expired(now, 10).await.unwrap().len(), 1);

    h.tracker.mark_failed(&upload, "expired").await.unwrap();
    assert!(h.tracker.list_expired(now, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sqlite_sessions_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.db");
    let upload = id("durable");

    {
        let store = SqliteStore::new(&path, 5).await.unwrap();
        let tracker = SessionTracker::new(Arc::new(store), Duration::hours(1));
        tracker
            .get_or_create(&upload, 3, Some("out.tar"))
            .await
            .unwrap();
        tracker.record_chunk(&upload, 2).await.unwrap();
        tracker.record_chunk(&upload, 0).await.unwrap();
        tracker.store().health_check().await.unwrap();
        let store: &dyn SessionStore = tracker.store().as_ref();
        assert_eq!(store.backend_name(), "sqlite");
    }

    let store = SqliteStore::new(&path, 5).await.unwrap();
    let tracker = SessionTracker::new(Arc::new(store), Duration::hours(1));
    let session = tracker.get(&upload).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Open);
    assert_eq!(session.file_name.as_deref(), Some("out.tar"));
    assert_eq!(session.missing_indices(), vec![1]);

    assert_eq!(
        tracker.record_chunk(&upload, 1).await.unwrap(),
        ChunkReadiness::ReadyToMerge
    );
}
