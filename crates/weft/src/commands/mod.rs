//! CLI command handlers.

pub mod errors;
pub mod list;
pub mod parse;
pub mod run;

use std::path::PathBuf;

use weft_config::{ProcessorSection, SortMode, WeftConfig};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged file configuration (CLI flags are applied per command).
    pub config: WeftConfig,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

/// Apply the source and sort flags shared by `run` and `list`.
pub(crate) fn apply_source_overrides(
    processor: &mut ProcessorSection,
    sources: &[PathBuf],
    sort_mode: Option<SortMode>,
) {
    if !sources.is_empty() {
        processor.source_dirs = sources.to_vec();
    }
    if let Some(mode) = sort_mode {
        processor.file_parsing_sort_mode = mode;
    }
}
