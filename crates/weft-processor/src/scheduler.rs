//! Eligibility filtering and queue ordering.

use std::cmp::Reverse;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use weft_config::SortMode;

use crate::discovery::FileEntry;
use crate::stats::ProcessingStatsStore;

/// A file waiting for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub path: PathBuf,
    /// mtime at the moment the file was enqueued.
    pub mtime: DateTime<Utc>,
}

/// Decides which discovered files are processed next, and in what order.
#[derive(Debug, Clone)]
pub struct FileScheduler {
    mode: SortMode,
    min_interval: Duration,
    seed: u64,
}

impl FileScheduler {
    pub fn new(mode: SortMode, min_interval: Duration, seed: u64) -> Self {
        Self {
            mode,
            min_interval,
            seed,
        }
    }

    pub fn mode(&self) -> SortMode {
        self.mode
    }

    /// Build the next batch from `entries`.
    ///
    /// A file is skipped only while it is inside its minimum interval *and*
    /// unchanged since its last run; a modified file is always eligible.
    /// `cycle` varies the seeded shuffle from one batch to the next.
    pub fn select(
        &self,
        entries: &[FileEntry],
        stats: &ProcessingStatsStore,
        now: DateTime<Utc>,
        cycle: u64,
    ) -> Vec<QueueEntry> {
        let mut batch: Vec<QueueEntry> = entries
            .iter()
            .filter(|entry| self.is_eligible(entry, stats, now))
            .map(|entry| QueueEntry {
                path: entry.path.clone(),
                mtime: entry.mtime,
            })
            .collect();

        match self.mode {
            SortMode::ModifiedTime => {
                batch.sort_by(|a, b| (Reverse(a.mtime), &a.path).cmp(&(Reverse(b.mtime), &b.path)));
            }
            SortMode::Alphabetical => batch.sort_by(|a, b| a.path.cmp(&b.path)),
            SortMode::RandomSeeded => {
                batch.sort_by_cached_key(|e| (shuffle_key(self.seed, cycle, &e.path), e.path.clone()));
            }
        }

        batch
    }

    fn is_eligible(&self, entry: &FileEntry, stats: &ProcessingStatsStore, now: DateTime<Utc>) -> bool {
        let Some(record) = stats.get(&entry.path) else {
            return true;
        };
        let Some(started) = record.last_run_start else {
            return true;
        };
        if record.last_mtime != Some(entry.mtime) {
            return true;
        }
        // A negative age (clock moved backwards) counts as still recent
        let age = (now - started).to_std().unwrap_or(Duration::ZERO);
        age >= self.min_interval
    }
}

/// Derive a shuffle seed from the host name so that different hosts sharing
/// the same sources process files in different orders.
pub fn host_seed() -> u64 {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_default();
    let digest = Sha256::digest(host.as_bytes());
    u64::from_be_bytes(first_eight(&digest))
}

fn shuffle_key(seed: u64, cycle: u64, path: &std::path::Path) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_be_bytes());
    hasher.update(cycle.to_be_bytes());
    hasher.update(path.to_string_lossy().as_bytes());
    u64::from_be_bytes(first_eight(&hasher.finalize()))
}

fn first_eight(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}
