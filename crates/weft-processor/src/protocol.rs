//! Wire protocol between the manager and its parse workers.
//!
//! The manager writes one [`WorkerRequest`] as JSON to the worker's stdin and
//! closes it. The worker answers on stdout with newline-delimited JSON
//! [`WorkerMessage`]s: an optional `loaded` marker once the file's top-level
//! content has been loaded, then exactly one `result`. A worker killed by a
//! deadline sends nothing more; the manager synthesizes its result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::definition::WorkflowDefinition;

/// Request envelope sent to a worker on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Definition file to load.
    pub file: PathBuf,
}

/// One line of worker output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The module-load phase finished; the load deadline no longer applies.
    Loaded,
    /// Final outcome for the file.
    Result(ParseResult),
}

impl WorkerMessage {
    /// Encode as a single protocol line (without the trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode one protocol line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

/// Everything extracted from one file in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    /// The file this result belongs to.
    pub file: PathBuf,
    /// Registered workflows, in the order they were encountered.
    #[serde(default)]
    pub definitions: Vec<WorkflowDefinition>,
    /// Failures, one per distinct problem, in the order they occurred.
    #[serde(default)]
    pub import_errors: Vec<ImportError>,
    /// Wall-clock time the worker spent on the file, in milliseconds.
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl ParseResult {
    /// An empty result for `file`.
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            definitions: Vec::new(),
            import_errors: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// A result holding a single error and no definitions.
    ///
    /// Used for timeouts and crashes so a killed worker never contributes a
    /// partial set of definitions.
    pub fn failed(error: ImportError, elapsed: Duration) -> Self {
        let mut result = Self::new(error.file.clone());
        result.import_errors.push(error);
        result.set_elapsed(elapsed);
        result
    }

    /// Worker-reported elapsed time.
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    /// Record elapsed time, saturating at `u64::MAX` milliseconds.
    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    }

    /// Whether any import error was recorded.
    pub fn has_errors(&self) -> bool {
        !self.import_errors.is_empty()
    }

    /// Whether the result is a synthesized timeout.
    pub fn timed_out(&self) -> bool {
        self.import_errors
            .iter()
            .any(|e| e.kind == ImportErrorKind::Timeout)
    }
}

/// Classification of an import error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportErrorKind {
    /// The file's content raised an error while loading or extracting.
    Exception,
    /// The worker exceeded a deadline and was killed.
    Timeout,
    /// The worker exited without reporting.
    Crash,
}

impl ImportErrorKind {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exception => "exception",
            Self::Timeout => "timeout",
            Self::Crash => "crash",
        }
    }
}

/// A failure attributed to one definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportError {
    /// File that failed.
    pub file: PathBuf,
    /// Classification.
    pub kind: ImportErrorKind,
    /// One-line summary.
    pub message: String,
    /// Detailed context: source excerpt, error chain, or captured stderr.
    #[serde(default)]
    pub traceback: Option<String>,
}

impl ImportError {
    /// An error raised by the file's own content.
    pub fn exception(file: &Path, message: impl Into<String>, traceback: Option<String>) -> Self {
        Self {
            file: file.to_path_buf(),
            kind: ImportErrorKind::Exception,
            message: message.into(),
            traceback,
        }
    }

    /// A deadline expiry.
    pub fn timeout(file: &Path, message: impl Into<String>) -> Self {
        Self {
            file: file.to_path_buf(),
            kind: ImportErrorKind::Timeout,
            message: message.into(),
            traceback: None,
        }
    }

    /// A worker that died without reporting.
    pub fn crash(file: &Path, message: impl Into<String>, traceback: Option<String>) -> Self {
        Self {
            file: file.to_path_buf(),
            kind: ImportErrorKind::Crash,
            message: message.into(),
            traceback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_loaded_marker_wire_format() {
        let line = WorkerMessage::Loaded.to_line().unwrap();
        assert_eq!(line, r#"{"type":"loaded"}"#);
        assert_eq!(WorkerMessage::from_line(&line).unwrap(), WorkerMessage::Loaded);
    }

    #[test]
    fn test_result_wire_format() {
        let value = json!({
            "type": "result",
            "file": "/defs/a.toml",
            "definitions": [{"id": "wf", "tasks": [{"id": "t"}]}],
            "import_errors": [{
                "file": "/defs/a.toml",
                "kind": "exception",
                "message": "boom"
            }],
            "elapsed_ms": 12
        });

        let msg = WorkerMessage::from_line(&value.to_string()).unwrap();
        let WorkerMessage::Result(result) = msg else {
            panic!("expected result message");
        };
        assert_eq!(result.file, PathBuf::from("/defs/a.toml"));
        assert_eq!(result.definitions[0].id, "wf");
        assert_eq!(result.import_errors[0].kind, ImportErrorKind::Exception);
        assert!(result.import_errors[0].traceback.is_none());
        assert_eq!(result.elapsed(), Duration::from_millis(12));
    }

    #[test]
    fn test_minimal_result_defaults() {
        let msg = WorkerMessage::from_line(r#"{"type":"result","file":"x.toml"}"#).unwrap();
        let WorkerMessage::Result(result) = msg else {
            panic!("expected result message");
        };
        assert!(result.definitions.is_empty());
        assert!(!result.has_errors());
        assert_eq!(result.elapsed_ms, 0);
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        assert!(WorkerMessage::from_line(r#"{"type":"progress"}"#).is_err());
        assert!(WorkerMessage::from_line("plain text from the guest").is_err());
    }

    #[test]
    fn test_failed_result_has_single_error() {
        let error = ImportError::timeout(Path::new("slow.toml"), "took too long");
        let result = ParseResult::failed(error, Duration::from_secs(3));
        assert!(result.definitions.is_empty());
        assert_eq!(result.import_errors.len(), 1);
        assert!(result.timed_out());
        assert_eq!(result.elapsed_ms, 3000);
        assert_eq!(result.file, PathBuf::from("slow.toml"));
    }
}
