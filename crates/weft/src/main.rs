//! weft - workflow definition file processor
//!
//! Main entry point for the weft CLI.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{errors, list, parse, run};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// weft - discovers workflow definition files and parses them in isolated workers
#[derive(Parser)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Path to config file (overrides default discovery)
    #[arg(long, global = true, env = "WEFT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the file processor loop
    Run(run::RunArgs),

    /// List discovered definition files in scheduling order
    List(list::ListArgs),

    /// Show import errors recorded in the definition store
    Errors(errors::ErrorsArgs),

    /// Parse a single definition file (worker entrypoint)
    #[command(hide = true)]
    ParseFile(parse::ParseFileArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Workers talk the protocol on stdout, so they log to stderr only
    if let Commands::ParseFile(args) = cli.command {
        init_worker_logging(cli.verbose);
        return parse::run(args).await;
    }

    let loaded = match cli.config.as_deref() {
        Some(path) => weft_config::LoadedConfig::from_file(path)?,
        None => weft_config::load_config(None)?,
    };

    let log_dir = loaded
        .config
        .logging()
        .dir
        .or_else(|| weft_config::xdg_config_dir().map(|d| d.join("logs")))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let _guard = init_logging(cli.verbose, &log_dir);

    for warning in &loaded.warnings {
        tracing::warn!("{}", warning);
    }
    for path in loaded.loaded_from() {
        tracing::debug!(path = %path.display(), "Loaded config");
    }

    let ctx = commands::Context {
        config: loaded.config,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::List(args) => list::run(args, &ctx).await,
        Commands::Errors(args) => errors::run(args, &ctx).await,
        Commands::ParseFile(args) => parse::run(args).await,
    }
}

/// Console (human-readable, stderr) + rotating JSON file.
fn init_logging(verbose: bool, log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::prelude::*;

    let filter = if verbose {
        "weft=debug,weft_processor=debug,weft_config=debug,info"
    } else {
        "weft=info,weft_processor=info,weft_config=info,warn"
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "weft.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "weft=trace,weft_processor=trace,weft_config=trace,info",
                )),
        )
        .init();

    guard
}

fn init_worker_logging(verbose: bool) {
    let filter = if verbose {
        "weft=debug,weft_processor=debug,info"
    } else {
        "weft_processor=warn,warn"
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}
