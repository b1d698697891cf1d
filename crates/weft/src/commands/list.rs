//! List command - shows what the processor would pick up, in queue order.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::Args;

use weft_config::SortMode;
use weft_processor::{FileDiscovery, FileScheduler, ProcessingStatsStore, host_seed};

use super::{Context, apply_source_overrides};

/// Arguments for the list command.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Directory or file to scan (can be specified multiple times)
    #[arg(short, long = "source")]
    pub sources: Vec<PathBuf>,

    /// Queue ordering: modified_time, alphabetical or random_seeded
    #[arg(long)]
    pub file_parsing_sort_mode: Option<SortMode>,
}

/// Run the list command.
pub async fn run(args: ListArgs, ctx: &Context) -> Result<()> {
    let mut processor = ctx.config.processor();
    apply_source_overrides(&mut processor, &args.sources, args.file_parsing_sort_mode);
    let discovery_section = ctx.config.discovery();
    discovery_section.validate()?;

    let mut discovery = FileDiscovery::new(
        processor.source_dirs.clone(),
        &discovery_section,
        std::time::Duration::ZERO,
    )
    .context("Invalid discovery patterns")?;
    let snapshot = discovery.force_refresh();

    let scheduler = FileScheduler::new(
        processor.file_parsing_sort_mode,
        std::time::Duration::ZERO,
        processor.sort_seed.unwrap_or_else(host_seed),
    );
    let queue = scheduler.select(&snapshot.entries, &ProcessingStatsStore::new(), Utc::now(), 0);

    if ctx.json_output {
        let items: Vec<_> = queue
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "path": entry.path,
                    "mtime": entry.mtime.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if queue.is_empty() {
        println!("No definition files found.");
        return Ok(());
    }
    for entry in &queue {
        if ctx.verbose {
            println!("{}  {}", entry.mtime.format("%Y-%m-%d %H:%M:%S"), entry.path.display());
        } else {
            println!("{}", entry.path.display());
        }
    }
    Ok(())
}
