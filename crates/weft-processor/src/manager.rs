//! The top-level processing loop.
//!
//! [`ProcessorManager`] owns every piece of processing state and drives one
//! non-blocking iteration per poll interval:
//!
//! 1. refresh discovery (rate limited) and forget removed files, cancelling
//!    their workers
//! 2. when the queue has drained, close the pass and schedule the next one,
//!    leaving out files that still have a worker
//! 3. launch workers into free slots
//! 4. poll workers and drain finished ones into stats and the store
//! 5. periodically log a per-file stats table and queue gauges
//!
//! Shutdown is requested through the [`CancellationToken`] returned by
//! [`ProcessorManager::shutdown_token`].

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use weft_config::{DiscoverySection, ProcessorSection, SortMode};

use crate::collector::ResultCollector;
use crate::discovery::{DiscoverySnapshot, FileDiscovery};
use crate::error::{ProcessorError, Result};
use crate::metrics::MetricsSink;
use crate::scheduler::{FileScheduler, QueueEntry, host_seed};
use crate::stats::ProcessingStatsStore;
use crate::store::DefinitionStore;
use crate::supervisor::{SupervisorConfig, WorkerCommand, WorkerSupervisor};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Resolved runtime settings for the manager.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Source directories or files to scan.
    pub sources: Vec<PathBuf>,
    /// Maximum concurrent workers.
    pub parsing_processes: usize,
    pub min_file_process_interval: Duration,
    pub refresh_interval: Duration,
    pub sort_mode: SortMode,
    /// Fixed shuffle seed; derived from the host name when absent.
    pub sort_seed: Option<u64>,
    /// Module-load deadline per worker.
    pub import_timeout: Duration,
    /// Overall deadline per worker.
    pub file_timeout: Duration,
    pub print_stats_interval: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    /// Stop after every file was processed this many times (0 = never).
    pub max_runs: u32,
    pub worker: WorkerCommand,
    pub discovery: DiscoverySection,
}

impl ProcessorConfig {
    /// Resolve config sections into runtime settings.
    ///
    /// Without an explicit `worker_command`, workers run the current
    /// executable's `parse-file` subcommand.
    pub fn from_sections(processor: &ProcessorSection, discovery: &DiscoverySection) -> Result<Self> {
        processor.validate()?;
        discovery.validate()?;

        let worker = match &processor.worker_command {
            Some(argv) => WorkerCommand::from_argv(argv).ok_or_else(|| {
                ProcessorError::InvalidConfig("worker_command cannot be empty".to_string())
            })?,
            None => WorkerCommand::current_exe().map_err(|e| {
                ProcessorError::Startup(format!("cannot locate the current executable: {e}"))
            })?,
        }
        .with_memory_limit(processor.worker_memory_limit_mb);

        let config = Self {
            sources: processor.source_dirs.clone(),
            parsing_processes: processor.parsing_processes,
            min_file_process_interval: seconds(
                "min_file_process_interval",
                processor.min_file_process_interval,
            )?,
            refresh_interval: seconds("refresh_interval", processor.refresh_interval)?,
            sort_mode: processor.file_parsing_sort_mode,
            sort_seed: processor.sort_seed,
            import_timeout: seconds("dagbag_import_timeout", processor.dagbag_import_timeout)?,
            file_timeout: seconds(
                "dag_file_processor_timeout",
                processor.dag_file_processor_timeout,
            )?,
            print_stats_interval: seconds("print_stats_interval", processor.print_stats_interval)?,
            poll_interval: Duration::from_millis(processor.poll_interval_ms),
            shutdown_grace: seconds("shutdown_grace_period", processor.shutdown_grace_period)?,
            max_runs: processor.max_runs,
            worker,
            discovery: discovery.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(ProcessorError::InvalidConfig(
                "at least one source location is required".to_string(),
            ));
        }
        if self.parsing_processes == 0 {
            return Err(ProcessorError::InvalidConfig(
                "parsing_processes must be at least 1".to_string(),
            ));
        }
        if self.import_timeout.is_zero() || self.file_timeout.is_zero() {
            return Err(ProcessorError::InvalidConfig(
                "timeouts must be positive".to_string(),
            ));
        }
        if self.file_timeout < self.import_timeout {
            return Err(ProcessorError::InvalidConfig(format!(
                "dag_file_processor_timeout ({:.1}s) must be at least dagbag_import_timeout ({:.1}s)",
                self.file_timeout.as_secs_f64(),
                self.import_timeout.as_secs_f64()
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(ProcessorError::InvalidConfig(
                "poll interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_workers: self.parsing_processes,
            load_timeout: self.import_timeout,
            file_timeout: self.file_timeout,
        }
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| ProcessorError::InvalidConfig(format!("{field}: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a [`ProcessorManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Totals reported when the manager stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Completed passes over the queue.
    pub cycles: u64,
    /// Results collected.
    pub files_processed: u64,
    /// Import errors across the latest run of every known file.
    pub import_errors: usize,
}

/// Drives discovery, scheduling, workers and collection.
pub struct ProcessorManager {
    config: ProcessorConfig,
    state: ManagerState,
    discovery: FileDiscovery,
    scheduler: FileScheduler,
    supervisor: WorkerSupervisor,
    collector: ResultCollector,
    stats: ProcessingStatsStore,
    metrics: Arc<dyn MetricsSink>,
    queue: VecDeque<QueueEntry>,
    cycle: u64,
    batch_started: Option<Instant>,
    last_stats_log: Instant,
    files_processed: u64,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ProcessorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorManager")
            .field("state", &self.state)
            .field("cycle", &self.cycle)
            .field("queue", &self.queue.len())
            .field("running", &self.supervisor.running())
            .finish_non_exhaustive()
    }
}

impl ProcessorManager {
    /// Build a manager. Fails on configuration problems, which are fatal.
    pub fn new(
        config: ProcessorConfig,
        store: Arc<dyn DefinitionStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let discovery = FileDiscovery::new(
            config.sources.clone(),
            &config.discovery,
            config.refresh_interval,
        )?;
        let seed = config.sort_seed.unwrap_or_else(host_seed);
        let scheduler = FileScheduler::new(config.sort_mode, config.min_file_process_interval, seed);
        let supervisor = WorkerSupervisor::new(config.worker.clone(), config.supervisor_config());
        let collector = ResultCollector::new(store.clone(), metrics.clone());

        Ok(Self {
            config,
            state: ManagerState::Starting,
            discovery,
            scheduler,
            supervisor,
            collector,
            stats: ProcessingStatsStore::new(),
            metrics,
            queue: VecDeque::new(),
            cycle: 0,
            batch_started: None,
            last_stats_log: Instant::now(),
            files_processed: 0,
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops the loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn stats(&self) -> &ProcessingStatsStore {
        &self.stats
    }

    /// Completed passes over the queue so far.
    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    /// Run until shutdown is requested or `max_runs` is reached.
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.start()?;
        let token = self.shutdown.clone();

        loop {
            if token.is_cancelled() {
                break;
            }
            if self.iterate() {
                info!(max_runs = self.config.max_runs, "Every file reached the run limit");
                break;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.stop().await;
        Ok(self.summary())
    }

    fn start(&mut self) -> Result<()> {
        if self.state != ManagerState::Starting {
            return Err(ProcessorError::Startup(format!(
                "manager cannot start from state {:?}",
                self.state
            )));
        }

        let program = self.config.worker.program();
        if program.is_absolute() && !program.exists() {
            return Err(ProcessorError::Startup(format!(
                "worker program '{}' does not exist",
                program.display()
            )));
        }

        let snapshot = self.discovery.force_refresh();
        info!(
            files = snapshot.entries.len(),
            sources = ?self.config.sources,
            processes = self.config.parsing_processes,
            sort_mode = %self.config.sort_mode,
            "File processor started"
        );
        self.state = ManagerState::Running;
        Ok(())
    }

    /// One non-blocking pass. Returns true once the run limit is reached.
    fn iterate(&mut self) -> bool {
        let snapshot = self.discovery.refresh();
        self.forget_removed(&snapshot);

        if self.queue.is_empty() {
            self.finish_batch();
            if self.max_runs_reached() {
                return true;
            }
            self.schedule_batch(&snapshot);
        }

        for launched in self.supervisor.tick(&mut self.queue) {
            self.collector.record_launch(&launched, &mut self.stats);
        }

        let completed = self.supervisor.poll();
        if !completed.is_empty() {
            let summary = self.collector.drain(completed, &mut self.stats);
            self.files_processed += summary.collected as u64;
        }

        if self.last_stats_log.elapsed() >= self.config.print_stats_interval {
            self.log_stats();
        }

        false
    }

    fn forget_removed(&mut self, snapshot: &DiscoverySnapshot) {
        if snapshot.removed.is_empty() {
            return;
        }
        self.queue.retain(|entry| !snapshot.removed.contains(&entry.path));
        for path in &snapshot.removed {
            self.supervisor.cancel(path);
        }
        self.collector.forget(&snapshot.removed, &mut self.stats);
    }

    fn finish_batch(&mut self) {
        let Some(started) = self.batch_started.take() else {
            return;
        };
        let elapsed = started.elapsed();
        self.cycle += 1;
        self.metrics
            .timing("dag_processing.total_parse_time", elapsed, &[]);
        debug!(cycle = self.cycle, elapsed_ms = elapsed.as_millis() as u64, "Queue pass complete");
    }

    fn schedule_batch(&mut self, snapshot: &DiscoverySnapshot) {
        let limit = u64::from(self.config.max_runs);
        let candidates: Vec<_> = snapshot
            .entries
            .iter()
            .filter(|e| !self.supervisor.is_processing(&e.path))
            .filter(|e| {
                limit == 0
                    || self
                        .stats
                        .get(&e.path)
                        .is_none_or(|r| r.run_count < limit)
            })
            .cloned()
            .collect();

        let now = Utc::now();
        let batch = self.scheduler.select(&candidates, &self.stats, now, self.cycle);
        if batch.is_empty() {
            return;
        }

        debug!(cycle = self.cycle, files = batch.len(), "Scheduling batch");
        for entry in &batch {
            self.discovery.mark_enqueued(&entry.path, now);
        }
        self.queue.extend(batch);
        self.batch_started = Some(Instant::now());
    }

    fn max_runs_reached(&self) -> bool {
        if self.config.max_runs == 0 {
            return false;
        }
        let limit = u64::from(self.config.max_runs);
        self.discovery.entries().all(|entry| {
            self.stats
                .get(&entry.path)
                .is_some_and(|r| r.run_count >= limit)
        })
    }

    async fn stop(&mut self) {
        self.state = ManagerState::ShuttingDown;
        info!(
            queued = self.queue.len(),
            running = self.supervisor.running(),
            "File processor shutting down"
        );
        self.queue.clear();

        let remaining = self.supervisor.shutdown(self.config.shutdown_grace).await;
        if !remaining.is_empty() {
            let summary = self.collector.drain(remaining, &mut self.stats);
            self.files_processed += summary.collected as u64;
        }

        self.log_stats();
        self.state = ManagerState::Stopped;
        info!(
            cycles = self.cycle,
            files_processed = self.files_processed,
            "File processor stopped"
        );
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            cycles: self.cycle,
            files_processed: self.files_processed,
            import_errors: self.stats.total_import_errors(),
        }
    }

    fn log_stats(&mut self) {
        self.last_stats_log = Instant::now();

        self.metrics.gauge(
            "dag_processing.file_path_queue_size",
            self.queue.len() as f64,
            &[],
        );
        self.metrics.gauge(
            "dag_processing.running_workers",
            self.supervisor.running() as f64,
            &[],
        );
        self.metrics.gauge(
            "dag_processing.import_errors_total",
            self.stats.total_import_errors() as f64,
            &[],
        );

        if self.stats.is_empty() {
            return;
        }
        info!("File processing stats:\n{}", self.render_stats_table());
    }

    fn render_stats_table(&self) -> String {
        let now = Utc::now();
        let mut rows = vec![[
            "File Path".to_string(),
            "PID".to_string(),
            "Current Runtime".to_string(),
            "# Workflows".to_string(),
            "# Errors".to_string(),
            "Last Runtime".to_string(),
            "Last Run".to_string(),
            "Runs".to_string(),
            "Failures".to_string(),
        ]];

        for (path, record) in self.stats.iter_sorted() {
            let running = self.supervisor.handles().find(|h| h.file() == path);
            rows.push([
                path.display().to_string(),
                running
                    .and_then(|h| h.pid())
                    .map(|pid| pid.to_string())
                    .unwrap_or_default(),
                running
                    .and_then(|h| (now - h.started_at()).to_std().ok())
                    .map(|d| format!("{:.2}s", d.as_secs_f64()))
                    .unwrap_or_default(),
                record.definition_count.to_string(),
                record.import_error_count.to_string(),
                record
                    .last_duration
                    .map(|d| format!("{:.2}s", d.as_secs_f64()))
                    .unwrap_or_default(),
                record
                    .last_run_end
                    .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
                    .unwrap_or_default(),
                record.run_count.to_string(),
                record.consecutive_failures.to_string(),
            ]);
        }

        let mut widths = [0usize; 9];
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let mut out = String::new();
        for (index, row) in rows.iter().enumerate() {
            for (cell, width) in row.iter().zip(widths) {
                let _ = write!(out, "{cell:<width$}  ");
            }
            out.truncate(out.trim_end().len());
            out.push('\n');
            if index == 0 {
                let total: usize = widths.iter().sum::<usize>() + 2 * (widths.len() - 1);
                out.push_str(&"=".repeat(total));
                out.push('\n');
            }
        }
        out
    }
}
