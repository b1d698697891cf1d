//! Source scanning for candidate definition files.
//!
//! [`FileDiscovery`] walks every configured source location, applies the
//! include/exclude patterns and per-directory ignore files, and keeps the
//! authoritative set of [`FileEntry`] values. Scans are rate limited by the
//! refresh interval; a failed scan keeps the previously known set.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use weft_config::{DiscoverySection, IgnoreSyntax};

use crate::error::DiscoveryError;

/// Marker a file must contain to be considered in safe mode.
const SAFE_MODE_MARKER: &str = "workflow";

/// A discovered definition file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path of the file (unique key).
    pub path: PathBuf,
    /// Modification timestamp seen by the latest scan.
    pub mtime: DateTime<Utc>,
    /// When the file was last put on the processing queue.
    pub last_enqueued: Option<DateTime<Utc>>,
}

impl FileEntry {
    /// Create an entry that has never been enqueued.
    pub fn new(path: impl Into<PathBuf>, mtime: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            mtime,
            last_enqueued: None,
        }
    }
}

/// Outcome of a [`FileDiscovery::refresh`] call.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySnapshot {
    /// Every currently known file, sorted by path.
    pub entries: Vec<FileEntry>,
    /// Files that disappeared since the previous scan.
    pub removed: Vec<PathBuf>,
    /// Whether a scan actually ran (false when rate limited or failed).
    pub rescanned: bool,
}

/// A compiled ignore-file pattern, scoped to the directory that declared it.
#[derive(Debug, Clone)]
enum IgnoreRule {
    Glob(glob::Pattern),
    Regex(regex::Regex),
}

impl IgnoreRule {
    fn matches(&self, relative: &Path) -> bool {
        match self {
            IgnoreRule::Glob(pattern) => {
                let options = glob::MatchOptions {
                    require_literal_separator: true,
                    ..Default::default()
                };
                if pattern.matches_path_with(relative, options) {
                    return true;
                }
                // Patterns without a separator also match any single component
                !pattern.as_str().contains('/')
                    && relative
                        .components()
                        .any(|c| pattern.matches_with(&c.as_os_str().to_string_lossy(), options))
            }
            IgnoreRule::Regex(regex) => regex.is_match(&relative.to_string_lossy()),
        }
    }
}

/// Scans source locations and owns the discovered file set.
#[derive(Debug)]
pub struct FileDiscovery {
    roots: Vec<PathBuf>,
    include: Vec<glob::Pattern>,
    exclude: Vec<glob::Pattern>,
    ignore_file_name: String,
    ignore_syntax: IgnoreSyntax,
    safe_mode: bool,
    follow_symlinks: bool,
    refresh_interval: Duration,
    last_scan: Option<Instant>,
    known: BTreeMap<PathBuf, FileEntry>,
}

impl FileDiscovery {
    /// Create a discovery for `roots` using the patterns of `section`.
    ///
    /// Fails only when a configured pattern does not compile.
    pub fn new(
        roots: Vec<PathBuf>,
        section: &DiscoverySection,
        refresh_interval: Duration,
    ) -> Result<Self, DiscoveryError> {
        Ok(Self {
            roots,
            include: compile_globs(&section.include)?,
            exclude: compile_globs(&section.exclude)?,
            ignore_file_name: section.ignore_file_name.clone(),
            ignore_syntax: section.ignore_file_syntax,
            safe_mode: section.safe_mode,
            follow_symlinks: section.follow_symlinks,
            refresh_interval,
            last_scan: None,
            known: BTreeMap::new(),
        })
    }

    /// Return the current file set, rescanning if the refresh interval elapsed.
    pub fn refresh(&mut self) -> DiscoverySnapshot {
        let due = self
            .last_scan
            .is_none_or(|at| at.elapsed() >= self.refresh_interval);
        if due {
            self.force_refresh()
        } else {
            self.snapshot(Vec::new(), false)
        }
    }

    /// Rescan now, regardless of the refresh interval.
    pub fn force_refresh(&mut self) -> DiscoverySnapshot {
        self.last_scan = Some(Instant::now());

        match self.scan() {
            Ok(found) => {
                let removed: Vec<PathBuf> = self
                    .known
                    .keys()
                    .filter(|path| !found.contains_key(*path))
                    .cloned()
                    .collect();

                let added = found
                    .keys()
                    .filter(|path| !self.known.contains_key(*path))
                    .count();

                let mut next = BTreeMap::new();
                for (path, mtime) in found {
                    let last_enqueued = self.known.get(&path).and_then(|e| e.last_enqueued);
                    next.insert(
                        path.clone(),
                        FileEntry {
                            path,
                            mtime,
                            last_enqueued,
                        },
                    );
                }
                self.known = next;

                if added > 0 || !removed.is_empty() {
                    info!(
                        files = self.known.len(),
                        added,
                        removed = removed.len(),
                        "Definition file set changed"
                    );
                } else {
                    debug!(files = self.known.len(), "Rescanned source locations");
                }

                self.snapshot(removed, true)
            }
            Err(e) => {
                warn!(error = %e, "Discovery scan failed, keeping previous file set");
                self.snapshot(Vec::new(), false)
            }
        }
    }

    /// Record that `path` was put on the processing queue at `at`.
    pub fn mark_enqueued(&mut self, path: &Path, at: DateTime<Utc>) {
        if let Some(entry) = self.known.get_mut(path) {
            entry.last_enqueued = Some(at);
        }
    }

    /// Currently known files, sorted by path.
    pub fn entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.known.values()
    }

    /// Number of known files.
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Whether no files are known.
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    fn snapshot(&self, removed: Vec<PathBuf>, rescanned: bool) -> DiscoverySnapshot {
        DiscoverySnapshot {
            entries: self.known.values().cloned().collect(),
            removed,
            rescanned,
        }
    }

    /// Walk every root. Any root failing makes the whole scan fail so that a
    /// temporarily unreachable directory does not look like mass deletion.
    fn scan(&self) -> Result<BTreeMap<PathBuf, DateTime<Utc>>, DiscoveryError> {
        let mut found = BTreeMap::new();
        for root in &self.roots {
            self.scan_root(root, &mut found)?;
        }
        Ok(found)
    }

    fn scan_root(
        &self,
        root: &Path,
        found: &mut BTreeMap<PathBuf, DateTime<Utc>>,
    ) -> Result<(), DiscoveryError> {
        let metadata = std::fs::metadata(root).map_err(|e| DiscoveryError::ScanFailed {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;

        if metadata.is_file() {
            if let Some(mtime) = self.candidate_mtime(root, root) {
                found.insert(root.to_path_buf(), mtime);
            }
            return Ok(());
        }

        let mut rules: HashMap<PathBuf, Vec<(PathBuf, IgnoreRule)>> = HashMap::new();
        let walker = WalkDir::new(root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let parent = entry.path().parent().unwrap_or(root);
                let inherited = self.rules_for(parent, root, &mut rules);
                !inherited
                    .iter()
                    .any(|(base, rule)| match entry.path().strip_prefix(base) {
                        Ok(relative) => rule.matches(relative),
                        Err(_) => false,
                    })
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // Unreadable subtrees are skipped; only the root itself is fatal
                    if e.depth() == 0 {
                        return Err(DiscoveryError::ScanFailed {
                            path: root.to_path_buf(),
                            reason: e.to_string(),
                        });
                    }
                    debug!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(mtime) = self.candidate_mtime(entry.path(), root) {
                found.insert(entry.path().to_path_buf(), mtime);
            }
        }

        Ok(())
    }

    /// Ignore rules in force inside `dir`: its own ignore file plus every
    /// ancestor's up to `root`. Cached per directory for the duration of a scan.
    fn rules_for(
        &self,
        dir: &Path,
        root: &Path,
        cache: &mut HashMap<PathBuf, Vec<(PathBuf, IgnoreRule)>>,
    ) -> Vec<(PathBuf, IgnoreRule)> {
        if let Some(rules) = cache.get(dir) {
            return rules.clone();
        }

        let mut rules = match dir.parent() {
            Some(parent) if dir != root && parent.starts_with(root) => {
                self.rules_for(parent, root, cache)
            }
            _ => Vec::new(),
        };
        rules.extend(
            self.load_ignore_file(dir)
                .into_iter()
                .map(|rule| (dir.to_path_buf(), rule)),
        );

        cache.insert(dir.to_path_buf(), rules.clone());
        rules
    }

    fn load_ignore_file(&self, dir: &Path) -> Vec<IgnoreRule> {
        let path = dir.join(&self.ignore_file_name);
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };

        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let compiled = match self.ignore_syntax {
                    IgnoreSyntax::Glob => glob::Pattern::new(line.trim_end_matches('/'))
                        .map(IgnoreRule::Glob)
                        .map_err(|e| e.to_string()),
                    IgnoreSyntax::Regexp => regex::Regex::new(line)
                        .map(IgnoreRule::Regex)
                        .map_err(|e| e.to_string()),
                };
                compiled
                    .map_err(|reason| {
                        warn!(
                            file = %path.display(),
                            pattern = %line,
                            error = %reason,
                            "Invalid ignore pattern, skipping"
                        );
                    })
                    .ok()
            })
            .collect()
    }

    /// The file's mtime if it passes include/exclude/safe-mode filtering.
    fn candidate_mtime(&self, path: &Path, root: &Path) -> Option<DateTime<Utc>> {
        let name = path.file_name()?.to_string_lossy();
        if name == self.ignore_file_name.as_str() {
            return None;
        }
        if !self.include.iter().any(|p| p.matches(&name)) {
            return None;
        }

        let relative = path.strip_prefix(root).unwrap_or(path);
        if self.exclude.iter().any(|p| p.matches_path(relative)) {
            return None;
        }

        if self.safe_mode && !might_contain_workflow(path) {
            debug!(path = %path.display(), "Safe mode: no workflow marker, skipping");
            return None;
        }

        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
        Some(DateTime::<Utc>::from(modified))
    }
}

fn compile_globs(patterns: &[String]) -> Result<Vec<glob::Pattern>, DiscoveryError> {
    patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p).map_err(|e| DiscoveryError::InvalidPattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Cheap content heuristic used by safe mode.
fn might_contain_workflow(path: &Path) -> bool {
    std::fs::read(path)
        .map(|bytes| {
            String::from_utf8_lossy(&bytes)
                .to_lowercase()
                .contains(SAFE_MODE_MARKER)
        })
        .unwrap_or(false)
}
