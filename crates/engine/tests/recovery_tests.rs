mod common;

use bytes::Bytes;
use common::{id, memory_engine, test_config};
use quilt_core::config::EngineConfig;
use quilt_core::{ChunkReadiness, SessionState, UploadSession};
use quilt_engine::{ChunkUpload, EngineError, RecoveryReport};
use quilt_metadata::SessionStore;
use std::time::Duration;
use time::OffsetDateTime;

#[tokio::test]
async fn test_interrupted_merge_is_failed_and_cleaned_up() {
    let (engine, backend) = memory_engine(test_config());
    let upload_id = id("crashed");

    // Simulate a crash between `ReadyToMerge` and the end of the merge.
    engine
        .tracker()
        .get_or_create(&upload_id, 2, None)
        .await
        .unwrap();
    for index in 0..2 {
        engine
            .chunk_store()
            .put(&upload_id, index, Bytes::from_static(b"x"))
            .await
            .unwrap();
    }
    engine.tracker().record_chunk(&upload_id, 0).await.unwrap();
    let readiness = engine.tracker().record_chunk(&upload_id, 1).await.unwrap();
    assert_eq!(readiness, ChunkReadiness::ReadyToMerge);

    // An open session is left alone.
    engine
        .ingest_chunk(ChunkUpload::new(id("healthy"), 0, 2, Bytes::from_static(b"y")))
        .await
        .unwrap();

    let report = engine.recover_interrupted_merges().await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            examined: 1,
            failed: 1,
            chunks_deleted: 2,
            skipped: 0,
        }
    );

    let session = engine.status(&upload_id).await.unwrap();
    assert_eq!(session.state, SessionState::Failed);
    assert_eq!(session.failure_reason.as_deref(), Some("merge interrupted"));
    assert!(backend.keys("uploads/crashed/").await.is_empty());
    assert_eq!(
        engine.status(&id("healthy")).await.unwrap().state,
        SessionState::Open
    );

    // Nothing left to do on a second run.
    let again = engine.recover_interrupted_merges().await.unwrap();
    assert_eq!(again, RecoveryReport::default());

    let err = engine
        .ingest_chunk(ChunkUpload::new(upload_id, 0, 2, Bytes::from_static(b"x")))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::SessionFailed { .. }), "{err:?}");
}

#[tokio::test]
async fn test_recovery_processes_more_than_one_batch() {
    let config = EngineConfig {
        sweep_batch_size: 2,
        ..test_config()
    };
    let (engine, _backend) = memory_engine(config);

    for n in 0..5 {
        let upload_id = id(&format!("m{n}"));
        engine
            .tracker()
            .get_or_create(&upload_id, 1, None)
            .await
            .unwrap();
        engine.tracker().record_chunk(&upload_id, 0).await.unwrap();
    }

    let report = engine.recover_interrupted_merges().await.unwrap();
    assert_eq!(report.examined, 5);
    assert_eq!(report.failed, 5);
    assert!(
        engine
            .tracker()
            .list_in_state(SessionState::Merging, 10)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_recovery_skips_session_whose_lock_is_held() {
    let config = EngineConfig {
        lock_timeout_ms: 20,
        ..test_config()
    };
    let (engine, _backend) = memory_engine(config);
    let upload_id = id("held");

    engine
        .tracker()
        .get_or_create(&upload_id, 1, None)
        .await
        .unwrap();
    engine.tracker().record_chunk(&upload_id, 0).await.unwrap();

    let guard = engine.locks().acquire(&upload_id).await.unwrap();
    let report = engine.recover_interrupted_merges().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(
        engine.status(&upload_id).await.unwrap().state,
        SessionState::Merging
    );

    drop(guard);
    let report = engine.recover_interrupted_merges().await.unwrap();
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn test_sweep_fails_expired_sessions_only() {
    let config = EngineConfig {
        session_ttl_secs: 60,
        ..test_config()
    };
    let (engine, backend) = memory_engine(config);

    let stale = UploadSession::new(id("stale"), 3, None, time::Duration::seconds(-1));
    engine.tracker().store().insert_if_absent(stale).await.unwrap();
    engine
        .chunk_store()
        .put(&id("stale"), 1, Bytes::from_static(b"b"))
        .await
        .unwrap();
    engine
        .ingest_chunk(ChunkUpload::new(id("fresh"), 0, 2, Bytes::from_static(b"a")))
        .await
        .unwrap();

    let report = engine.sweep_expired(OffsetDateTime::now_utc()).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.chunks_deleted, 1);

    let stale = engine.status(&id("stale")).await.unwrap();
    assert_eq!(stale.state, SessionState::Failed);
    assert_eq!(stale.failure_reason.as_deref(), Some("expired"));
    assert!(backend.keys("uploads/stale/").await.is_empty());
    assert_eq!(
        engine.status(&id("fresh")).await.unwrap().state,
        SessionState::Open
    );

    // Sweeping with a later clock catches the fresh session too.
    let later = OffsetDateTime::now_utc() + time::Duration::minutes(5);
    let report = engine.sweep_expired(later).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(
        engine.status(&id("fresh")).await.unwrap().state,
        SessionState::Failed
    );
    assert!(backend.keys("uploads/fresh/").await.is_empty());
}

#[tokio::test]
async fn test_sweep_racing_in_flight_chunk_leaves_no_blobs() {
    let (engine, backend) = memory_engine(test_config());
    let upload_id = id("racing");

    engine
        .ingest_chunk(ChunkUpload::new(upload_id.clone(), 0, 2, Bytes::from_static(b"a")))
        .await
        .unwrap();

    // Slow final put; whichever way the two interleave, no blob survives.
    backend.delay_puts(Duration::from_millis(50));
    let pending = {
        let engine = engine.clone();
        let upload_id = upload_id.clone();
        tokio::spawn(async move {
            engine
                .ingest_chunk(ChunkUpload::new(upload_id, 1, 2, Bytes::from_static(b"b")))
                .await
        })
    };

    let later = OffsetDateTime::now_utc() + time::Duration::days(2);
    let report = engine.sweep_expired(later).await.unwrap();
    assert_eq!(report.failed, 1);

    let err = pending.await.unwrap().err().unwrap();
    assert!(matches!(err, EngineError::SessionFailed { .. }), "{err:?}");
    assert!(backend.keys("uploads/racing/").await.is_empty());
    assert!(backend.keys("artifacts/racing/").await.is_empty());
}
