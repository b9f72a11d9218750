//! `quilt ingest`: split a local file and feed it to the engine chunk by chunk.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Args;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use quilt_core::{DEFAULT_CHUNK_SIZE, UploadId, chunk_count};
use quilt_engine::{AssemblyEngine, ChunkUpload, EngineError, IngestOutcome, ResponseBody};
use rand::seq::SliceRandom;
use std::path::PathBuf;
use std::time::Duration;

const MAX_RETRIES: u32 = 3;

#[derive(Args)]
pub struct IngestArgs {
    /// File to upload
    file: PathBuf,

    /// Upload ID (default: a fresh UUID)
    #[arg(long)]
    upload_id: Option<String>,

    /// Chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,

    /// File name of the merged artifact (default: <upload-id>.bin)
    #[arg(long)]
    file_name: Option<String>,

    /// Submit chunks in random order
    #[arg(long, default_value_t = false)]
    shuffle: bool,

    /// Maximum chunks in flight
    #[arg(long, default_value_t = 4)]
    parallel: usize,
}

/// Submit every chunk of `args.file` and return the final response body.
pub async fn run(engine: &AssemblyEngine, args: IngestArgs) -> Result<ResponseBody> {
    let IngestArgs {
        file,
        upload_id,
        chunk_size,
        file_name,
        shuffle,
        parallel,
    } = args;

    if chunk_size == 0 {
        anyhow::bail!("--chunk-size must be greater than 0");
    }
    let max_chunk_size = engine.config().max_chunk_size;
    if chunk_size > max_chunk_size {
        anyhow::bail!("--chunk-size {chunk_size} exceeds engine.max_chunk_size {max_chunk_size}");
    }
    let upload_id = match upload_id {
        Some(id) => UploadId::parse(&id).context("invalid upload ID")?,
        None => UploadId::new(),
    };

    let data = tokio::fs::read(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let data = Bytes::from(data);
    let total_chunks = u32::try_from(chunk_count(data.len() as u64, chunk_size))
        .map_err(|_| anyhow::anyhow!("file needs more chunks than fit in a u32"))?;

    let mut indices: Vec<u32> = (0..total_chunks).collect();
    if shuffle {
        indices.shuffle(&mut rand::rng());
    }

    tracing::info!(
        upload_id = %upload_id,
        file = %file.display(),
        size = data.len(),
        total_chunks,
        "Starting ingest"
    );

    let parallel = std::cmp::max(1, parallel);
    let mut in_flight = FuturesUnordered::new();
    let mut completed = None;

    for index in indices {
        let upload = ChunkUpload {
            upload_id: upload_id.clone(),
            index,
            total_chunks,
            payload: chunk_slice(&data, index, chunk_size),
            file_name: file_name.clone(),
        };
        in_flight.push(submit_with_retry(engine, upload));

        if in_flight.len() >= parallel
            && let Some(result) = in_flight.next().await
        {
            record(&mut completed, result?);
        }
    }

    while let Some(result) = in_flight.next().await {
        record(&mut completed, result?);
    }

    let outcome = completed
        .with_context(|| format!("upload {upload_id} did not complete after all chunks"))?;
    let (_, body) = outcome.response();
    Ok(body)
}

fn record(completed: &mut Option<IngestOutcome>, outcome: IngestOutcome) {
    if outcome.is_complete() {
        *completed = Some(outcome);
    }
}

/// Bytes `[index * chunk_size, (index + 1) * chunk_size)` of `data`, clamped.
fn chunk_slice(data: &Bytes, index: u32, chunk_size: u64) -> Bytes {
    let len = data.len() as u64;
    let start = (u64::from(index) * chunk_size).min(len) as usize;
    let end = start.saturating_add(chunk_size as usize).min(data.len());
    data.slice(start..end)
}

/// Ingest one chunk, retrying errors the engine marks as retryable.
async fn submit_with_retry(engine: &AssemblyEngine, upload: ChunkUpload) -> Result<IngestOutcome> {
    let mut attempt = 0;

    loop {
        match engine.ingest_chunk(upload.clone()).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                attempt += 1;
                let delay = Duration::from_millis(100 << (attempt - 1)); // 100ms, 200ms, 400ms
                tracing::warn!(
                    index = upload.index,
                    attempt,
                    error = %e,
                    "Retrying chunk in {}ms",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(describe(e, upload.index)),
        }
    }
}

fn describe(err: EngineError, index: u32) -> anyhow::Error {
    let code = err.code();
    anyhow::Error::new(err).context(format!("chunk {index} rejected ({code})"))
}
