//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [processor]              # parsing loop: pool size, intervals, timeouts
//! [discovery]              # which files are candidates
//! [store]                  # where parse results are persisted
//! [logging]                # log file location
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    /// Parsing loop configuration.
    pub processor: Option<ProcessorSection>,

    /// File discovery configuration.
    pub discovery: Option<DiscoverySection>,

    /// Persistence backend configuration.
    pub store: Option<StoreSection>,

    /// Logging configuration.
    pub logging: Option<LoggingSection>,
}

impl WeftConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced wholesale, matching how a project-local file is
    /// expected to override the user config.
    pub fn merge(&mut self, other: WeftConfig) {
        if other.processor.is_some() {
            self.processor = other.processor;
        }

        if other.discovery.is_some() {
            self.discovery = other.discovery;
        }

        if other.store.is_some() {
            self.store = other.store;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// The processor section, or defaults when absent.
    pub fn processor(&self) -> ProcessorSection {
        self.processor.clone().unwrap_or_default()
    }

    /// The discovery section, or defaults when absent.
    pub fn discovery(&self) -> DiscoverySection {
        self.discovery.clone().unwrap_or_default()
    }

    /// The store section, or defaults when absent.
    pub fn store(&self) -> StoreSection {
        self.store.clone().unwrap_or_default()
    }

    /// The logging section, or defaults when absent.
    pub fn logging(&self) -> LoggingSection {
        self.logging.clone().unwrap_or_default()
    }

    /// Validate every section that is present.
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(ref processor) = self.processor {
            processor.validate()?;
        }
        if let Some(ref discovery) = self.discovery {
            discovery.validate()?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Processor
// ─────────────────────────────────────────────────────────────────────────────

/// Parsing loop configuration.
///
/// Durations are expressed in seconds (fractions allowed) so they read the
/// same way in TOML and on the command line.
///
/// ```toml
/// [processor]
/// source_dirs = ["workflows"]
/// parsing_processes = 2
/// min_file_process_interval = 30
/// refresh_interval = 300
/// file_parsing_sort_mode = "modified_time"
/// dagbag_import_timeout = 30
/// dag_file_processor_timeout = 50
/// print_stats_interval = 30
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSection {
    /// Directories (or single files) scanned for definition files.
    pub source_dirs: Vec<PathBuf>,
    /// Maximum number of concurrently running parse workers.
    pub parsing_processes: usize,
    /// Minimum seconds between two parses of an unchanged file.
    pub min_file_process_interval: f64,
    /// Minimum seconds between two directory scans.
    pub refresh_interval: f64,
    /// Order in which eligible files are queued.
    pub file_parsing_sort_mode: SortMode,
    /// Seed for `random_seeded` ordering. Derived from the host name when unset.
    pub sort_seed: Option<u64>,
    /// Seconds a worker may spend loading a file before it is killed.
    pub dagbag_import_timeout: f64,
    /// Seconds a worker may spend on a file in total before it is killed.
    pub dag_file_processor_timeout: f64,
    /// Seconds between statistics reports.
    pub print_stats_interval: f64,
    /// Milliseconds the manager sleeps between loop iterations.
    pub poll_interval_ms: u64,
    /// Seconds to wait for in-flight workers on shutdown.
    pub shutdown_grace_period: f64,
    /// Stop after every file has been parsed this many times (0 = run forever).
    pub max_runs: u32,
    /// Command used to launch a worker (program followed by its arguments).
    /// Defaults to the running binary with the `parse-file` subcommand.
    pub worker_command: Option<Vec<String>>,
    /// Address-space limit applied to each worker, in MiB (unix only).
    pub worker_memory_limit_mb: Option<u64>,
}

impl Default for ProcessorSection {
    fn default() -> Self {
        Self {
            source_dirs: vec![PathBuf::from("workflows")],
            parsing_processes: 2,
            min_file_process_interval: 30.0,
            refresh_interval: 300.0,
            file_parsing_sort_mode: SortMode::ModifiedTime,
            sort_seed: None,
            dagbag_import_timeout: 30.0,
            dag_file_processor_timeout: 50.0,
            print_stats_interval: 30.0,
            poll_interval_ms: 250,
            shutdown_grace_period: 10.0,
            max_runs: 0,
            worker_command: None,
            worker_memory_limit_mb: None,
        }
    }
}

impl ProcessorSection {
    /// Check ranges and cross-field constraints.
    pub fn validate(&self) -> crate::Result<()> {
        if self.source_dirs.is_empty() {
            return Err(ConfigError::invalid(
                "source_dirs",
                "at least one source location is required",
            ));
        }
        if self.parsing_processes == 0 {
            return Err(ConfigError::invalid(
                "parsing_processes",
                "must be a positive integer",
            ));
        }

        non_negative_secs("min_file_process_interval", self.min_file_process_interval)?;
        non_negative_secs("refresh_interval", self.refresh_interval)?;
        non_negative_secs("print_stats_interval", self.print_stats_interval)?;
        non_negative_secs("shutdown_grace_period", self.shutdown_grace_period)?;
        positive_secs("dagbag_import_timeout", self.dagbag_import_timeout)?;
        positive_secs("dag_file_processor_timeout", self.dag_file_processor_timeout)?;

        if self.dag_file_processor_timeout < self.dagbag_import_timeout {
            return Err(ConfigError::invalid(
                "dag_file_processor_timeout",
                format!(
                    "must be >= dagbag_import_timeout ({} < {})",
                    self.dag_file_processor_timeout, self.dagbag_import_timeout
                ),
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be positive"));
        }

        if let Some(ref command) = self.worker_command {
            if command.is_empty() || command[0].is_empty() {
                return Err(ConfigError::invalid(
                    "worker_command",
                    "must name a program to run",
                ));
            }
        }

        if self.worker_memory_limit_mb == Some(0) {
            return Err(ConfigError::invalid(
                "worker_memory_limit_mb",
                "must be positive when set",
            ));
        }

        Ok(())
    }
}

fn non_negative_secs(field: &str, value: f64) -> crate::Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(
            field,
            format!("must be a finite number of seconds >= 0, got {value}"),
        ));
    }
    Ok(())
}

fn positive_secs(field: &str, value: f64) -> crate::Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::invalid(
            field,
            format!("must be a finite number of seconds > 0, got {value}"),
        ));
    }
    Ok(())
}

/// Ordering applied to the eligible files of a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    /// Most recently modified first.
    #[default]
    ModifiedTime,
    /// Ascending by path.
    Alphabetical,
    /// Reproducible shuffle, re-rolled every cycle.
    RandomSeeded,
}

impl SortMode {
    const EXPECTED: &'static str = "modified_time, alphabetical, random_seeded";

    /// The config/CLI spelling of this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModifiedTime => "modified_time",
            Self::Alphabetical => "alphabetical",
            Self::RandomSeeded => "random_seeded",
        }
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "modified_time" => Ok(Self::ModifiedTime),
            "alphabetical" => Ok(Self::Alphabetical),
            "random_seeded" | "random_seeded_by_host" => Ok(Self::RandomSeeded),
            _ => Err(ConfigError::UnknownVariant {
                kind: "sort mode",
                value: s.to_string(),
                expected: Self::EXPECTED,
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────────────

/// File discovery configuration.
///
/// ```toml
/// [discovery]
/// include = ["*.toml"]
/// exclude = ["drafts/**"]
/// ignore_file_name = ".weftignore"
/// ignore_file_syntax = "glob"
/// safe_mode = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// Glob patterns a file name must match to be a candidate.
    pub include: Vec<String>,
    /// Glob patterns (relative to the source root) that exclude a path.
    pub exclude: Vec<String>,
    /// Name of the per-directory ignore file.
    pub ignore_file_name: String,
    /// Pattern syntax used inside ignore files.
    pub ignore_file_syntax: IgnoreSyntax,
    /// Only consider files whose content mentions `workflow`.
    pub safe_mode: bool,
    /// Follow symbolic links while walking source directories.
    pub follow_symlinks: bool,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            include: vec!["*.toml".to_string()],
            exclude: Vec::new(),
            ignore_file_name: ".weftignore".to_string(),
            ignore_file_syntax: IgnoreSyntax::Glob,
            safe_mode: true,
            follow_symlinks: true,
        }
    }
}

impl DiscoverySection {
    /// Check that the section can drive a scan.
    pub fn validate(&self) -> crate::Result<()> {
        if self.include.is_empty() {
            return Err(ConfigError::invalid(
                "include",
                "at least one include pattern is required",
            ));
        }
        if self.ignore_file_name.is_empty() || self.ignore_file_name.contains('/') {
            return Err(ConfigError::invalid(
                "ignore_file_name",
                "must be a plain file name",
            ));
        }
        Ok(())
    }
}

/// Syntax of patterns inside ignore files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreSyntax {
    /// Shell-style globs.
    #[default]
    Glob,
    /// Regular expressions searched against the relative path.
    Regexp,
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Persistence backend configuration.
///
/// ```toml
/// [store]
/// backend = "sqlite"
/// database = "weft.db"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Which backend receives parse results.
    pub backend: StoreBackend,
    /// SQLite database path.
    pub database: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            database: PathBuf::from("weft.db"),
        }
    }
}

/// Persistence backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Results kept in process memory only.
    Memory,
    /// Results written to a SQLite database.
    #[default]
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(ConfigError::UnknownVariant {
                kind: "store backend",
                value: s.to_string(),
                expected: "memory, sqlite",
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Directory for the rolling JSON log. Defaults to `<config dir>/logs`.
    pub dir: Option<PathBuf>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
