//! Per-file processing bookkeeping.
//!
//! The manager owns one [`ProcessingStatsStore`] and reads it; every write goes
//! through the [`ResultCollector`](crate::collector::ResultCollector). Records
//! are created when a file's first worker starts, updated when its result is
//! collected, and dropped when the file leaves the discovered set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::protocol::{ImportErrorKind, ParseResult};

/// How the latest run of a file ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// All definitions extracted without errors.
    Success,
    /// The worker reported at least one import error.
    ImportErrors,
    /// A deadline expired and the worker was killed.
    TimedOut,
    /// The worker exited without reporting.
    Crashed,
}

impl Outcome {
    /// Classify a collected result.
    pub fn of(result: &ParseResult) -> Self {
        if result.import_errors.is_empty() {
            return Self::Success;
        }
        if result
            .import_errors
            .iter()
            .any(|e| e.kind == ImportErrorKind::Timeout)
        {
            Self::TimedOut
        } else if result
            .import_errors
            .iter()
            .any(|e| e.kind == ImportErrorKind::Crash)
        {
            Self::Crashed
        } else {
            Self::ImportErrors
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ImportErrors => "import_errors",
            Self::TimedOut => "timed_out",
            Self::Crashed => "crashed",
        }
    }

    /// Whether the run counts as a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Success)
    }
}

/// Bookkeeping for one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingRecord {
    /// When the latest worker for the file started.
    pub last_run_start: Option<DateTime<Utc>>,
    /// When the latest result was collected.
    pub last_run_end: Option<DateTime<Utc>>,
    /// Duration of the latest completed run.
    pub last_duration: Option<Duration>,
    /// File mtime observed when the latest run was started.
    pub last_mtime: Option<DateTime<Utc>>,
    /// Definitions produced by the latest completed run.
    pub definition_count: usize,
    /// Import errors produced by the latest completed run.
    pub import_error_count: usize,
    /// Failed runs in a row; reset by a successful run.
    pub consecutive_failures: u32,
    /// Completed runs since the file was first seen.
    pub run_count: u64,
    /// Outcome of the latest completed run.
    pub last_outcome: Option<Outcome>,
}

impl ProcessingRecord {
    /// Whether a worker was started after the latest collected result.
    pub fn is_running(&self) -> bool {
        match (self.last_run_start, self.last_run_end) {
            (Some(start), Some(end)) => start > end,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Map from file path to [`ProcessingRecord`].
#[derive(Debug, Default)]
pub struct ProcessingStatsStore {
    records: HashMap<PathBuf, ProcessingRecord>,
}

impl ProcessingStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The record for `path`, if the file has ever been enqueued.
    pub fn get(&self, path: &Path) -> Option<&ProcessingRecord> {
        self.records.get(path)
    }

    fn ensure(&mut self, path: &Path) -> &mut ProcessingRecord {
        self.records.entry(path.to_path_buf()).or_default()
    }

    /// Record a worker start. Start times never move backwards.
    pub(crate) fn record_start(&mut self, path: &Path, at: DateTime<Utc>, mtime: Option<DateTime<Utc>>) {
        let record = self.ensure(path);
        record.last_run_start = Some(match record.last_run_start {
            Some(previous) if previous > at => previous,
            _ => at,
        });
        if mtime.is_some() {
            record.last_mtime = mtime;
        }
    }

    /// Apply a collected result.
    pub(crate) fn apply(
        &mut self,
        path: &Path,
        result: &ParseResult,
        duration: Duration,
        at: DateTime<Utc>,
    ) -> Outcome {
        let outcome = Outcome::of(result);
        let record = self.ensure(path);

        record.last_run_end = Some(at);
        record.last_duration = Some(duration);
        record.definition_count = result.definitions.len();
        record.import_error_count = result.import_errors.len();
        record.run_count += 1;
        record.last_outcome = Some(outcome);
        if outcome.is_failure() {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        } else {
            record.consecutive_failures = 0;
        }

        outcome
    }

    /// Drop records for files that no longer exist.
    pub(crate) fn remove(&mut self, paths: &[PathBuf]) {
        for path in paths {
            self.records.remove(path);
        }
    }

    /// Iterate over all records, sorted by path.
    pub fn iter_sorted(&self) -> Vec<(&Path, &ProcessingRecord)> {
        let mut all: Vec<_> = self
            .records
            .iter()
            .map(|(p, r)| (p.as_path(), r))
            .collect();
        all.sort_by(|a, b| a.0.cmp(b.0));
        all
    }

    /// Total import errors across the latest run of every file.
    pub fn total_import_errors(&self) -> usize {
        self.records.values().map(|r| r.import_error_count).sum()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ImportError;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_start_time_is_monotonic() {
        let mut stats = ProcessingStatsStore::new();
        let path = Path::new("a.toml");

        stats.record_start(path, ts(100), Some(ts(5)));
        stats.record_start(path, ts(50), None);

        let record = stats.get(path).unwrap();
        assert_eq!(record.last_run_start, Some(ts(100)));
        assert_eq!(record.last_mtime, Some(ts(5)));
        assert!(record.is_running());
    }

    #[test]
    fn test_apply_success_resets_failures() {
        let mut stats = ProcessingStatsStore::new();
        let path = Path::new("a.toml");
        let failed = ParseResult::failed(
            ImportError::crash(path, "died", None),
            Duration::from_millis(10),
        );

        stats.record_start(path, ts(1), None);
        assert_eq!(stats.apply(path, &failed, Duration::from_millis(10), ts(2)), Outcome::Crashed);
        stats.record_start(path, ts(3), None);
        stats.apply(path, &failed, Duration::from_millis(10), ts(4));
        assert_eq!(stats.get(path).unwrap().consecutive_failures, 2);

        let ok = ParseResult::new(path);
        assert_eq!(stats.apply(path, &ok, Duration::from_millis(5), ts(5)), Outcome::Success);

        let record = stats.get(path).unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.run_count, 3);
        assert_eq!(record.last_duration, Some(Duration::from_millis(5)));
        assert!(!record.is_running());
    }

    #[test]
    fn test_outcome_classification() {
        let path = Path::new("a.toml");
        let mut result = ParseResult::new(path);
        result
            .import_errors
            .push(ImportError::exception(path, "bad", None));
        assert_eq!(Outcome::of(&result), Outcome::ImportErrors);

        let timed_out = ParseResult::failed(ImportError::timeout(path, "slow"), Duration::ZERO);
        assert_eq!(Outcome::of(&timed_out), Outcome::TimedOut);
    }

    #[test]
    fn test_remove_and_totals() {
        let mut stats = ProcessingStatsStore::new();
        let a = PathBuf::from("a.toml");
        let b = PathBuf::from("b.toml");
        let mut result = ParseResult::new(&a);
        result.import_errors.push(ImportError::exception(&a, "x", None));
        result.import_errors.push(ImportError::exception(&a, "y", None));

        stats.apply(&a, &result, Duration::ZERO, ts(1));
        stats.apply(&b, &ParseResult::new(&b), Duration::ZERO, ts(1));
        assert_eq!(stats.total_import_errors(), 2);

        stats.remove(std::slice::from_ref(&a));
        assert_eq!(stats.len(), 1);
        assert_eq!(stats.total_import_errors(), 0);
        assert_eq!(stats.iter_sorted()[0].0, b.as_path());
    }
}
