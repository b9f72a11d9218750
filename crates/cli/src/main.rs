//! Command-line driver for quilt.

mod ingest;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use quilt_core::UploadId;
use quilt_core::config::AppConfig;
use quilt_engine::{AssemblyEngine, metrics};
use serde::Serialize;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "quilt.toml";

#[derive(Parser)]
#[command(name = "quilt")]
#[command(about = "Assemble files from independently uploaded chunks")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, env = "QUILT_CONFIG")]
    config: Option<PathBuf>,

    /// Print Prometheus metrics to stderr after the command finishes
    #[arg(long, global = true, default_value_t = false)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a file into chunks and submit them to the engine
    Ingest(ingest::IngestArgs),
    /// Show an upload session and the chunks actually stored for it
    Status {
        /// Upload ID to inspect
        upload_id: String,
    },
    /// Fail sessions left mid-merge by a crash and delete their chunks
    Recover,
    /// Fail expired open sessions and delete their chunks
    Sweep,
    /// Print the Prometheus text exposition of engine metrics
    Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        print_metrics,
        command,
    } = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(config.as_deref())?;

    match command {
        Commands::Ingest(args) => {
            let engine = build_engine(&config).await?;
            let body = ingest::run(&engine, args).await?;
            print_json(&body)?;
        }
        Commands::Status { upload_id } => {
            let upload_id = UploadId::parse(&upload_id).context("invalid upload ID")?;
            let engine = build_engine(&config).await?;
            let report = engine
                .inspect(&upload_id)
                .await
                .with_context(|| format!("failed to inspect upload {upload_id}"))?;
            print_json(&report)?;
        }
        Commands::Recover => {
            let engine = build_engine(&config).await?;
            let report = engine
                .recover_interrupted_merges()
                .await
                .context("recovery failed")?;
            print_json(&report)?;
        }
        Commands::Sweep => {
            let engine = build_engine(&config).await?;
            let report = engine
                .sweep_expired(OffsetDateTime::now_utc())
                .await
                .context("sweep failed")?;
            print_json(&report)?;
        }
        Commands::Metrics => {
            metrics::register_metrics();
            print!("{}", gather_metrics()?);
        }
    }

    if print_metrics {
        eprint!("{}", gather_metrics()?);
    }
    Ok(())
}

/// Defaults, then the TOML file (when present), then `QUILT_` env vars.
fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let mut figment = Figment::new();

    match explicit {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("config file not found: {}", path.display());
            }
            tracing::debug!(config_path = %path.display(), "Loading configuration from file");
            figment = figment.merge(Toml::file(path));
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            tracing::debug!(config_path = DEFAULT_CONFIG_PATH, "Loading configuration from file");
            figment = figment.merge(Toml::file(DEFAULT_CONFIG_PATH));
        }
        None => tracing::debug!("No config file, using defaults and environment"),
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("QUILT_").ignore(&["CONFIG"]).split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid configuration")?;
    Ok(config)
}

async fn build_engine(config: &AppConfig) -> Result<AssemblyEngine> {
    quilt_engine::from_config(config)
        .await
        .context("failed to initialize assembly engine")
}

fn gather_metrics() -> Result<String> {
    metrics::gather_text().context("failed to encode metrics")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{json}");
    Ok(())
}
