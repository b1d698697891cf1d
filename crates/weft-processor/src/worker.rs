//! The parse worker: loads one definition file and reports what it found.
//!
//! Runs inside an isolated child process. [`run_worker`] reads a
//! [`WorkerRequest`] from stdin, loads the file, prints a `loaded` marker,
//! extracts the workflows and prints one `result` line. Failures of the file's
//! own content become import errors; the worker process itself only fails
//! when its stdio is unusable.

use std::path::Path;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::definition::{DefinitionDocument, DefinitionError};
use crate::error::{ProcessorError, Result};
use crate::protocol::{ImportError, ParseResult, WorkerMessage, WorkerRequest};

/// Load phase: read and parse the file's top-level content.
pub fn load(path: &Path) -> std::result::Result<DefinitionDocument, ImportError> {
    let source = std::fs::read_to_string(path).map_err(|e| {
        ImportError::exception(path, format!("Cannot read definition file: {e}"), None)
    })?;
    DefinitionDocument::parse(&source).map_err(|e| to_import_error(path, e))
}

/// Extract phase: decode every workflow, collecting one error per failure.
pub fn extract(path: &Path, document: DefinitionDocument) -> ParseResult {
    let mut result = ParseResult::new(path);
    for outcome in document.into_workflows() {
        match outcome {
            Ok(workflow) => result.definitions.push(workflow),
            Err(e) => result.import_errors.push(to_import_error(path, e)),
        }
    }
    result
}

/// Load and extract in one step, timing the whole run.
pub fn process_file(path: &Path) -> ParseResult {
    let started = Instant::now();
    let mut result = match load(path) {
        Ok(document) => extract(path, document),
        Err(error) => ParseResult::failed(error, started.elapsed()),
    };
    result.set_elapsed(started.elapsed());
    result
}

/// Serve one request over the given stdio pair.
pub async fn run_worker<R, W>(mut input: R, mut output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut raw = String::new();
    input.read_to_string(&mut raw).await?;
    let request: WorkerRequest = serde_json::from_str(raw.trim())
        .map_err(|e| ProcessorError::Protocol(format!("invalid request: {e}")))?;

    let started = Instant::now();
    let path = request.file.as_path();
    debug!(file = %path.display(), "Loading definition file");

    let mut result = match load(path) {
        Ok(document) => {
            send(&mut output, &WorkerMessage::Loaded).await?;
            extract(path, document)
        }
        Err(error) => ParseResult::failed(error, started.elapsed()),
    };
    result.set_elapsed(started.elapsed());

    debug!(
        file = %path.display(),
        definitions = result.definitions.len(),
        errors = result.import_errors.len(),
        "Definition file processed"
    );
    send(&mut output, &WorkerMessage::Result(result)).await
}

async fn send<W: AsyncWrite + Unpin>(output: &mut W, message: &WorkerMessage) -> Result<()> {
    let mut line = message
        .to_line()
        .map_err(|e| ProcessorError::Protocol(e.to_string()))?;
    line.push('\n');
    output.write_all(line.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

fn to_import_error(path: &Path, error: DefinitionError) -> ImportError {
    match error {
        // TOML errors render a source excerpt; keep it as the traceback
        DefinitionError::Syntax(e) => ImportError::exception(
            path,
            format!("TOML parse error: {}", e.message()),
            Some(e.to_string()),
        ),
        other => ImportError::exception(path, other.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ImportErrorKind;
    use std::fs;
    use std::path::PathBuf;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_process_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "etl.toml",
            r#"
[[workflow]]
id = "extract_load"

[[workflow.tasks]]
id = "extract"

[[workflow.tasks]]
id = "load"
dependencies = ["extract"]

[[workflow]]
id = "report"

[[workflow.tasks]]
id = "render"
"#,
        );

        let result = process_file(&path);
        assert_eq!(result.file, path);
        assert!(!result.has_errors());
        let ids: Vec<_> = result.definitions.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["extract_load", "report"]);
    }

    #[test]
    fn test_syntax_error_has_excerpt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "broken.toml", "[[workflow]\nid = 1\n");

        let result = process_file(&path);
        assert!(result.definitions.is_empty());
        assert_eq!(result.import_errors.len(), 1);
        let error = &result.import_errors[0];
        assert_eq!(error.kind, ImportErrorKind::Exception);
        assert!(error.message.starts_with("TOML parse error"));
        assert!(error.traceback.is_some());
    }

    #[test]
    fn test_bad_workflow_does_not_hide_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "mixed.toml",
            r#"
[[workflow]]
id = "good"

[[workflow.tasks]]
id = "a"

[[workflow]]
id = "cyclic"

[[workflow.tasks]]
id = "a"
dependencies = ["b"]

[[workflow.tasks]]
id = "b"
dependencies = ["a"]
"#,
        );

        let result = process_file(&path);
        assert_eq!(result.definitions.len(), 1);
        assert_eq!(result.definitions[0].id, "good");
        assert_eq!(result.import_errors.len(), 1);
        assert!(result.import_errors[0].message.contains("cyclic"));
    }

    #[test]
    fn test_missing_file_is_import_error() {
        let result = process_file(Path::new("/nonexistent/weft/missing.toml"));
        assert_eq!(result.import_errors.len(), 1);
        assert!(result.import_errors[0].message.contains("Cannot read"));
    }

    #[test]
    fn test_file_without_workflows_is_empty_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "notes.toml", "title = \"workflow notes\"\n");
        let result = process_file(&path);
        assert!(result.definitions.is_empty());
        assert!(!result.has_errors());
    }

    #[tokio::test]
    async fn test_run_worker_emits_loaded_then_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "one.toml",
            "[workflow]\nid = \"solo\"\n[[workflow.tasks]]\nid = \"t\"\n",
        );
        let request = serde_json::to_string(&WorkerRequest { file: path.clone() }).unwrap();

        let mut output = Vec::new();
        run_worker(request.as_bytes(), &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(WorkerMessage::from_line(lines[0]).unwrap(), WorkerMessage::Loaded);
        let WorkerMessage::Result(result) = WorkerMessage::from_line(lines[1]).unwrap() else {
            panic!("expected result");
        };
        assert_eq!(result.file, path);
        assert_eq!(result.definitions[0].id, "solo");
    }

    #[tokio::test]
    async fn test_run_worker_load_failure_skips_marker() {
        let request = r#"{"file": "/nonexistent/weft/x.toml"}"#;
        let mut output = Vec::new();
        run_worker(request.as_bytes(), &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(matches!(
            WorkerMessage::from_line(lines[0]).unwrap(),
            WorkerMessage::Result(_)
        ));
    }

    #[tokio::test]
    async fn test_run_worker_rejects_bad_request() {
        let mut output = Vec::new();
        let err = run_worker(&b"not json"[..], &mut output).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Protocol(_)));
    }
}
