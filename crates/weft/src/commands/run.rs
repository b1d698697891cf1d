//! Run command - drives the file processor until shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_config::{SortMode, StoreBackend};
use weft_processor::{ProcessorConfig, ProcessorManager, TracingMetrics, open_store};

use super::{Context, apply_source_overrides};

/// Arguments for the run command.
///
/// CLI arguments override config file values.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Directory or file to scan (can be specified multiple times)
    #[arg(short, long = "source")]
    pub sources: Vec<PathBuf>,

    /// Maximum number of concurrent parse workers
    #[arg(short = 'j', long)]
    pub parsing_processes: Option<usize>,

    /// Seconds before an unchanged file is processed again
    #[arg(long)]
    pub min_file_process_interval: Option<f64>,

    /// Seconds between rescans of the source locations
    #[arg(long)]
    pub refresh_interval: Option<f64>,

    /// Queue ordering: modified_time, alphabetical or random_seeded
    #[arg(long)]
    pub file_parsing_sort_mode: Option<SortMode>,

    /// Seconds a worker may spend loading a file
    #[arg(long)]
    pub dagbag_import_timeout: Option<f64>,

    /// Seconds a worker may spend on a file in total
    #[arg(long)]
    pub dag_file_processor_timeout: Option<f64>,

    /// Stop after every file was processed this many times
    #[arg(short, long)]
    pub num_runs: Option<u32>,

    /// Persistence backend: memory or sqlite
    #[arg(long)]
    pub store: Option<StoreBackend>,

    /// SQLite database path
    #[arg(long, env = "WEFT_DATABASE")]
    pub database: Option<PathBuf>,
}

/// Run the processor.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let mut processor = ctx.config.processor();
    apply_source_overrides(&mut processor, &args.sources, args.file_parsing_sort_mode);
    if let Some(n) = args.parsing_processes {
        processor.parsing_processes = n;
    }
    if let Some(secs) = args.min_file_process_interval {
        processor.min_file_process_interval = secs;
    }
    if let Some(secs) = args.refresh_interval {
        processor.refresh_interval = secs;
    }
    if let Some(secs) = args.dagbag_import_timeout {
        processor.dagbag_import_timeout = secs;
    }
    if let Some(secs) = args.dag_file_processor_timeout {
        processor.dag_file_processor_timeout = secs;
    }
    if let Some(n) = args.num_runs {
        processor.max_runs = n;
    }

    let mut store_section = ctx.config.store();
    if let Some(backend) = args.store {
        store_section.backend = backend;
    }
    if let Some(path) = args.database {
        store_section.database = path;
    }

    let config = ProcessorConfig::from_sections(&processor, &ctx.config.discovery())
        .context("Invalid processor configuration")?;
    let store = open_store(&store_section).context("Failed to open definition store")?;

    let mut manager = ProcessorManager::new(config, store, Arc::new(TracingMetrics))?;
    tokio::spawn(forward_shutdown_signals(manager.shutdown_token()));

    let summary = manager.run().await?;

    if ctx.json_output {
        println!(
            "{}",
            serde_json::json!({
                "cycles": summary.cycles,
                "files_processed": summary.files_processed,
                "import_errors": summary.import_errors,
            })
        );
    } else {
        println!(
            "Processed {} file(s) in {} cycle(s), {} import error(s)",
            summary.files_processed, summary.cycles, summary.import_errors
        );
    }
    Ok(())
}

/// Cancel `token` on Ctrl-C or SIGTERM.
async fn forward_shutdown_signals(token: CancellationToken) {
    let ctrl_c = signal_or_pending("Ctrl-C", tokio::signal::ctrl_c());

    #[cfg(unix)]
    let terminate = signal_or_pending("SIGTERM", async {
        use tokio::signal::unix::{SignalKind, signal};
        signal(SignalKind::terminate())?.recv().await;
        Ok::<(), std::io::Error>(())
    });

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = token.cancelled() => return,
    }
    token.cancel();
}

/// Resolve once `listener` reports its signal. A listener that could not be
/// installed never resolves, so it cannot be mistaken for a shutdown request.
async fn signal_or_pending<F>(name: &str, listener: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = listener.await {
        warn!(signal = name, error = %e, "Cannot listen for signal");
        std::future::pending::<()>().await;
    }
}
