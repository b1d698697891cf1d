//! Merges finished workers into stats, persistence and metrics.
//!
//! The collector is the only writer of [`ProcessingStatsStore`] and of the
//! [`DefinitionStore`]; the manager hands it launches, completions and
//! removed files.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::metrics::MetricsSink;
use crate::stats::{Outcome, ProcessingStatsStore};
use crate::store::DefinitionStore;
use crate::supervisor::{CompletedWorker, LaunchedWorker, WorkerOutcome};

/// Summary of one [`ResultCollector::drain`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    /// Results recorded.
    pub collected: usize,
    /// Workers cancelled by shutdown, not recorded.
    pub cancelled: usize,
    /// Results whose persistence failed.
    pub store_failures: usize,
}

/// Records worker launches, results and file removals.
pub struct ResultCollector {
    store: Arc<dyn DefinitionStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for ResultCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCollector").finish_non_exhaustive()
    }
}

impl ResultCollector {
    pub fn new(store: Arc<dyn DefinitionStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { store, metrics }
    }

    /// Note that a worker started on `launched.path`.
    pub fn record_launch(&self, launched: &LaunchedWorker, stats: &mut ProcessingStatsStore) {
        stats.record_start(&launched.path, launched.started_at, Some(launched.mtime));
    }

    /// Forget files that left the discovered set, in stats and in the store.
    pub fn forget(&self, removed: &[PathBuf], stats: &mut ProcessingStatsStore) {
        if removed.is_empty() {
            return;
        }
        stats.remove(removed);
        if let Err(e) = self.store.remove_files(removed) {
            warn!(error = %e, files = removed.len(), "Failed to remove deleted files from the store");
        }
    }

    /// Record every completed worker. Never blocks on a worker and never
    /// fails: a store error only affects the file it belongs to.
    pub fn drain(
        &self,
        completed: Vec<CompletedWorker>,
        stats: &mut ProcessingStatsStore,
    ) -> DrainSummary {
        let mut summary = DrainSummary::default();

        for worker in completed {
            if worker.outcome == WorkerOutcome::Cancelled {
                debug!(file = %worker.file.display(), "Worker cancelled by shutdown");
                summary.cancelled += 1;
                continue;
            }

            let outcome = stats.apply(&worker.file, &worker.result, worker.duration, Utc::now());
            summary.collected += 1;

            let file = worker.file.display().to_string();
            let tags = [("file", file.as_str())];
            self.metrics
                .timing("dag_processing.last_duration", worker.duration, &tags);
            self.metrics.gauge(
                "dag_processing.import_errors",
                worker.result.import_errors.len() as f64,
                &tags,
            );
            if outcome == Outcome::TimedOut {
                self.metrics.incr("dag_processing.processor_timeouts", 1, &tags);
            }

            match outcome {
                Outcome::Success => debug!(
                    file = %worker.file.display(),
                    definitions = worker.result.definitions.len(),
                    duration_ms = worker.duration.as_millis() as u64,
                    "Processed definition file"
                ),
                _ => info!(
                    file = %worker.file.display(),
                    outcome = outcome.as_str(),
                    definitions = worker.result.definitions.len(),
                    errors = worker.result.import_errors.len(),
                    "Processed definition file with errors"
                ),
            }

            if let Err(e) = self.store.upsert(&worker.file, &worker.result) {
                warn!(file = %worker.file.display(), error = %e, "Failed to persist parse result");
                summary.store_failures += 1;
            }
        }

        summary
    }
}
