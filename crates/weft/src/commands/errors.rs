//! Errors command - prints import errors recorded in the SQLite store.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;

use weft_processor::{DefinitionStore, SqliteStore};

use super::Context;

/// Arguments for the errors command.
#[derive(Args, Debug)]
pub struct ErrorsArgs {
    /// SQLite database path (overrides config)
    #[arg(long, env = "WEFT_DATABASE")]
    pub database: Option<PathBuf>,
}

/// Run the errors command.
pub async fn run(args: ErrorsArgs, ctx: &Context) -> Result<()> {
    let database = args.database.unwrap_or_else(|| ctx.config.store().database);
    if !database.is_file() {
        bail!("No definition store at {}", database.display());
    }

    let store = SqliteStore::open(&database)?;
    let errors = store.import_errors()?;

    if ctx.json_output {
        let items: Vec<_> = errors
            .iter()
            .map(|e| {
                serde_json::json!({
                    "file": e.file,
                    "kind": e.kind.as_str(),
                    "message": e.message,
                    "traceback": e.traceback,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if errors.is_empty() {
        println!("No import errors.");
        return Ok(());
    }
    for error in &errors {
        println!("{} [{}] {}", error.file.display(), error.kind.as_str(), error.message);
        if ctx.verbose {
            if let Some(traceback) = &error.traceback {
                for line in traceback.lines() {
                    println!("    {line}");
                }
            }
        }
    }
    Ok(())
}
