/*!
thawd - daemon and maintenance commands for the Thaw write-back cache.

Every option falls back to an environment variable so the daemon can be started
with no arguments inside a function runtime.
*/

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tabled::{Table, Tabled};
use thaw_core::storage::{create_store, ObjectStore};
use thaw_core::{
    init_observability, ArchiveEntry, CompressionAlgorithm, EntryKind, FlushFailurePolicy,
    LogFormat, StorageBackend, ThawConfig, ThawDaemon, ThawMetrics,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "thawd")]
#[command(about = "Keeps a scratch directory warm across cold starts")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value = "json")]
    log_format: LogFormatArg,

    /// Object store backend (s3, local or memory)
    #[arg(long, global = true, env = "THAW_BACKEND", default_value = "s3")]
    backend: StorageBackend,

    /// Bucket holding the snapshot
    #[arg(long, global = true, env = "S3_BUCKET")]
    bucket: Option<String>,

    /// Key prefix inside the bucket
    #[arg(long, global = true, env = "S3_PREFIX", default_value = "")]
    prefix: String,

    /// Execution identity; names the snapshot object
    #[arg(long, global = true, env = "AWS_LAMBDA_FUNCTION_NAME")]
    identity: Option<String>,

    /// Region override for the S3 client
    #[arg(long, global = true, env = "AWS_REGION")]
    region: Option<String>,

    /// Custom endpoint for S3-compatible services
    #[arg(long, global = true, env = "THAW_S3_ENDPOINT")]
    endpoint: Option<String>,

    /// Directory used as the object store by the local backend
    #[arg(long, global = true, env = "THAW_LOCAL_STORE")]
    local_store: Option<PathBuf>,

    /// Directory mirrored to the snapshot
    #[arg(long, global = true, env = "THAW_BASE_PATH", default_value = thaw_core::config::DEFAULT_BASE_PATH)]
    base_path: PathBuf,

    /// Quiet period before staged changes are flushed, in milliseconds
    #[arg(long, global = true, env = "THAW_FLUSH_INTERVAL_MS", default_value_t = 1000)]
    flush_interval_ms: u64,

    /// Snapshot compression (zstd or gzip)
    #[arg(long, global = true, env = "THAW_COMPRESSION", default_value = "zstd")]
    compression: CompressionAlgorithm,

    /// What to do with staged changes when an upload fails (discard or requeue)
    #[arg(long, global = true, env = "THAW_ON_FLUSH_FAILURE", default_value = "discard")]
    on_flush_failure: FlushFailurePolicy,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogFormatArg {
    Json,
    Pretty,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Subcommand, Clone, Debug)]
enum Commands {
    /// Restore, then watch and flush until SIGINT/SIGTERM (default)
    Run,
    /// Restore the snapshot into the base path and exit
    Restore,
    /// Print the entries of the remote snapshot without writing anything
    Inspect {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Tabled, Serialize)]
struct EntryRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Kind")]
    kind: &'static str,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Size", display_with = "format_size")]
    size: u64,
}

impl From<&ArchiveEntry> for EntryRow {
    fn from(entry: &ArchiveEntry) -> Self {
        Self {
            path: entry.path.to_string_lossy().to_string(),
            kind: match entry.kind {
                EntryKind::Directory => "dir",
                EntryKind::File => "file",
            },
            mode: format!("{:o}", entry.mode),
            size: entry.size(),
        }
    }
}

impl Cli {
    fn thaw_config(&self) -> ThawConfig {
        let mut config = ThawConfig::new(self.identity.clone().unwrap_or_default())
            .with_base_path(self.base_path.clone())
            .with_key_prefix(self.prefix.clone())
            .with_flush_interval(Duration::from_millis(self.flush_interval_ms))
            .with_compression(self.compression)
            .with_failure_policy(self.on_flush_failure);
        config.backend = self.backend;
        config.s3_bucket = self.bucket.clone();
        config.s3_region = self.region.clone();
        config.s3_endpoint = self.endpoint.clone();
        config.local_store_dir = self.local_store.clone();
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_observability(cli.log_format.into(), cli.verbose)
        .context("Failed to initialize logging")?;

    let config = cli.thaw_config();
    let store = create_store(&config)
        .await
        .context("Failed to initialize object store")?;
    info!(store = %store.describe(), key = %config.remote_key(), "Object store ready");

    match cli.command.clone().unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, store).await?,
        Commands::Restore => restore_once(config, store).await?,
        Commands::Inspect { json } => inspect_snapshot(config, store, json).await?,
    }

    Ok(())
}

async fn run_daemon(config: ThawConfig, store: Arc<dyn ObjectStore>) -> Result<(), anyhow::Error> {
    let daemon = ThawDaemon::new(config, store).context("Invalid configuration")?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        trigger.cancel();
    });

    daemon
        .run(shutdown)
        .await
        .context("Failed to start change watcher")?;

    dump_metrics();
    Ok(())
}

async fn restore_once(config: ThawConfig, store: Arc<dyn ObjectStore>) -> Result<(), anyhow::Error> {
    let daemon = ThawDaemon::new(config, store).context("Invalid configuration")?;
    tokio::fs::create_dir_all(daemon.base_path()).await?;

    let report = daemon
        .snapshots()
        .restore()
        .await
        .with_context(|| format!("Failed to restore {}", daemon.snapshots().key()))?;

    println!(
        "Restored {} files ({}) and {} directories into {}",
        report.files,
        format_size(&report.bytes),
        report.directories,
        daemon.base_path().display()
    );
    Ok(())
}

async fn inspect_snapshot(
    config: ThawConfig,
    store: Arc<dyn ObjectStore>,
    json: bool,
) -> Result<(), anyhow::Error> {
    let daemon = ThawDaemon::new(config, store).context("Invalid configuration")?;
    let key = daemon.snapshots().key().to_string();

    let entries = daemon
        .snapshots()
        .fetch()
        .await
        .with_context(|| format!("Failed to fetch {key}"))?;
    let rows: Vec<EntryRow> = entries.iter().map(EntryRow::from).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("Snapshot {key} is empty");
    } else {
        println!("{}", Table::new(rows));
    }
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn dump_metrics() {
    let Some(metrics) = ThawMetrics::global() else {
        return;
    };
    match metrics.gather_metrics() {
        Ok(text) => debug!(metrics = %text, "Final metrics"),
        Err(e) => warn!(error = %e, "Failed to gather metrics"),
    }
}

fn format_size(bytes: &u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = *bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
