//! Prometheus metrics for the assembly engine.
//!
//! Labels never carry upload IDs or file names.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Registry holding every engine metric.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static UPLOADS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quilt_uploads_completed_total",
        "Total number of uploads merged into an artifact",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "quilt_uploads_failed_total",
            "Total number of upload sessions marked failed, by cause",
        ),
        &["cause"],
    )
    .expect("metric creation failed")
});

pub static CHUNKS_STORED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quilt_chunks_stored_total",
        "Total number of chunk writes, including re-sends",
    )
    .expect("metric creation failed")
});

pub static BYTES_STORED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("quilt_bytes_stored_total", "Total chunk bytes written")
        .expect("metric creation failed")
});

pub static ARTIFACT_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quilt_artifact_bytes_total",
        "Total bytes written to merged artifacts",
    )
    .expect("metric creation failed")
});

pub static STRAY_CHUNKS_DISCARDED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quilt_stray_chunks_discarded_total",
        "Chunks deleted because their session closed before they were recorded",
    )
    .expect("metric creation failed")
});

pub static CLEANUP_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quilt_chunk_cleanup_failures_total",
        "Chunk deletions that failed after a session became terminal",
    )
    .expect("metric creation failed")
});

pub static INGEST_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "quilt_ingest_errors_total",
            "Total chunk ingest errors by error code",
        ),
        &["code"],
    )
    .expect("metric creation failed")
});

pub static INGEST_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "quilt_ingest_duration_seconds",
            "Time taken to ingest a single chunk, merge included",
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    )
    .expect("metric creation failed")
});

pub static MERGE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "quilt_merge_duration_seconds",
            "Time taken to assemble an artifact from its chunks",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the engine registry. Idempotent.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(UPLOADS_COMPLETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_STORED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_STORED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ARTIFACT_BYTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(STRAY_CHUNKS_DISCARDED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CLEANUP_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(INGEST_ERRORS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(INGEST_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(MERGE_DURATION.clone()))
            .expect("metric registration failed");
    });
}

/// Prometheus text exposition of the engine registry.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Count an ingest error by code.
pub fn record_ingest_error(code: &str) {
    INGEST_ERRORS.with_label_values(&[code]).inc();
}

/// Count a session that became failed.
pub fn record_upload_failed(cause: &str) {
    UPLOADS_FAILED.with_label_values(&[cause]).inc();
}
