//! CLI integration tests for the weft command-line interface.
//!
//! These tests verify:
//! - Help text and argument validation
//! - The hidden worker entrypoint speaks the stdin/stdout protocol
//! - A one-shot `run` persists definitions and import errors
//!
//! Every test points `WEFT_CONFIG_DIR` at a temporary directory so no user
//! config is picked up and logs stay out of the real config dir.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a command for the weft binary, isolated from user config.
fn weft(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("weft").unwrap();
    cmd.env("WEFT_CONFIG_DIR", home.path())
        .env_remove("WEFT_CONFIG")
        .env_remove("WEFT_DATABASE")
        .current_dir(home.path());
    cmd
}

const GOOD: &str = r#"
[[workflow]]
id = "nightly_etl"
schedule = "0 2 * * *"

[[workflow.tasks]]
id = "extract"

[[workflow.tasks]]
id = "load"
dependencies = ["extract"]
"#;

const BROKEN: &str = "[[workflow]\nid = \"half\"\n";

const CYCLIC: &str = r#"
[[workflow]]
id = "loop"

[[workflow.tasks]]
id = "a"
dependencies = ["b"]

[[workflow.tasks]]
id = "b"
dependencies = ["a"]
"#;

fn write(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    let home = TempDir::new().unwrap();
    weft(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("errors"))
        .stdout(predicate::str::contains("parse-file").not());
}

#[test]
fn test_version_displays() {
    let home = TempDir::new().unwrap();
    weft(&home)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("weft"));
}

#[test]
fn test_run_help_shows_flags() {
    let home = TempDir::new().unwrap();
    weft(&home)
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--parsing-processes"))
        .stdout(predicate::str::contains("--dagbag-import-timeout"))
        .stdout(predicate::str::contains("--dag-file-processor-timeout"))
        .stdout(predicate::str::contains("--file-parsing-sort-mode"));
}

#[test]
fn test_invalid_sort_mode_rejected() {
    let home = TempDir::new().unwrap();
    weft(&home)
        .args(["run", "--file-parsing-sort-mode", "sideways"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("sideways"));
}

#[test]
fn test_file_timeout_below_import_timeout_is_fatal() {
    let home = TempDir::new().unwrap();
    weft(&home)
        .args([
            "run",
            "--source",
            ".",
            "--dagbag-import-timeout",
            "30",
            "--dag-file-processor-timeout",
            "10",
            "--store",
            "memory",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("dag_file_processor_timeout"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Entrypoint Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_parse_file_direct() {
    let home = TempDir::new().unwrap();
    write(home.path(), "etl.toml", GOOD);

    weft(&home)
        .args(["parse-file", "etl.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""type":"result""#))
        .stdout(predicate::str::contains("nightly_etl"));
}

#[test]
fn test_parse_file_protocol_over_stdin() {
    let home = TempDir::new().unwrap();
    write(home.path(), "etl.toml", GOOD);
    let request = serde_json::json!({ "file": home.path().join("etl.toml") }).to_string();

    let output = weft(&home)
        .arg("parse-file")
        .write_stdin(request)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["type"], "loaded");
    assert_eq!(lines[1]["type"], "result");
    assert_eq!(lines[1]["definitions"][0]["id"], "nightly_etl");
    assert_eq!(lines[1]["import_errors"].as_array().unwrap().len(), 0);
}

#[test]
fn test_parse_file_reports_syntax_error_as_data() {
    let home = TempDir::new().unwrap();
    write(home.path(), "broken.toml", BROKEN);

    weft(&home)
        .args(["parse-file", "broken.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("TOML parse error"))
        .stdout(predicate::str::contains(r#""definitions":[]"#));
}

// ─────────────────────────────────────────────────────────────────────────────
// Processor Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_run_once_persists_results() {
    let home = TempDir::new().unwrap();
    let defs = home.path().join("defs");
    fs::create_dir(&defs).unwrap();
    write(&defs, "etl.toml", GOOD);
    write(&defs, "broken.toml", "# workflow file\n[[workflow]\n");
    write(&defs, "cyclic.toml", CYCLIC);
    let db = home.path().join("state.db");

    weft(&home)
        .args(["run", "--num-runs", "1", "--store", "sqlite", "--source"])
        .arg(&defs)
        .arg("--database")
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("Processed 3 file(s) in 1 cycle(s), 2 import error(s)"));

    let conn = rusqlite::Connection::open(&db).unwrap();
    let workflows: i64 = conn
        .query_row("SELECT COUNT(*) FROM workflow_definitions", [], |row| row.get(0))
        .unwrap();
    assert_eq!(workflows, 1);
    let id: String = conn
        .query_row("SELECT workflow_id FROM workflow_definitions", [], |row| row.get(0))
        .unwrap();
    assert_eq!(id, "nightly_etl");

    weft(&home)
        .args(["errors", "--database"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("broken.toml [exception]"))
        .stdout(predicate::str::contains("cycle detected"));
}

#[test]
fn test_run_json_summary() {
    let home = TempDir::new().unwrap();
    write(home.path(), "etl.toml", GOOD);

    let output = weft(&home)
        .args(["--json", "run", "-n", "1", "--store", "memory", "--source", "etl.toml"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["files_processed"], 1);
    assert_eq!(summary["import_errors"], 0);
}

#[test]
fn test_list_alphabetical() {
    let home = TempDir::new().unwrap();
    let defs = home.path().join("defs");
    fs::create_dir(&defs).unwrap();
    write(&defs, "zeta.toml", GOOD);
    write(&defs, "alpha.toml", GOOD);
    write(&defs, "notes.md", "workflow notes");

    let output = weft(&home)
        .args(["list", "--file-parsing-sort-mode", "alphabetical", "--source"])
        .arg(&defs)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let names: Vec<_> = stdout
        .lines()
        .map(|l| Path::new(l).file_name().unwrap().to_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["alpha.toml", "zeta.toml"]);
}

#[test]
fn test_errors_without_database_fails() {
    let home = TempDir::new().unwrap();
    weft(&home)
        .args(["errors", "--database", "missing.db"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No definition store"));
}
