//! Parse-file command - the worker entrypoint.
//!
//! Spawned by the processor with a JSON request on stdin. Can also be run by
//! hand on a single file to see what a worker would report.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use weft_processor::worker;
use weft_processor::WorkerMessage;

/// Arguments for the parse-file command.
#[derive(Args, Debug)]
pub struct ParseFileArgs {
    /// Parse this file directly instead of reading a request from stdin
    pub file: Option<PathBuf>,
}

/// Run the parse-file command.
pub async fn run(args: ParseFileArgs) -> Result<()> {
    match args.file {
        Some(path) => {
            let result = worker::process_file(&path);
            println!("{}", WorkerMessage::Result(result).to_line()?);
        }
        None => worker::run_worker(tokio::io::stdin(), tokio::io::stdout()).await?,
    }
    Ok(())
}
