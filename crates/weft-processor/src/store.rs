//! Persistence of extracted definitions and import errors.
//!
//! The collector is the only writer. Each upsert replaces everything
//! previously recorded for the file, so a file that stops declaring a
//! workflow (or stops failing) is reflected after its next run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, params};
use tracing::{debug, info};
use weft_config::{StoreBackend, StoreSection};

use crate::definition::WorkflowDefinition;
use crate::error::StoreError;
use crate::protocol::{ImportError, ImportErrorKind, ParseResult};

/// A workflow as persisted, with the file it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredWorkflow {
    pub file: PathBuf,
    pub definition: WorkflowDefinition,
    pub updated_at: DateTime<Utc>,
}

/// Sink for collected parse results.
pub trait DefinitionStore: Send + Sync {
    /// Replace the definitions and import errors recorded for `file`.
    fn upsert(&self, file: &Path, result: &ParseResult) -> Result<(), StoreError>;

    /// Forget everything recorded for files that no longer exist.
    fn remove_files(&self, files: &[PathBuf]) -> Result<(), StoreError>;

    /// All stored workflows, ordered by workflow id then file.
    fn list_workflows(&self) -> Result<Vec<StoredWorkflow>, StoreError>;

    /// All current import errors, ordered by file.
    fn import_errors(&self) -> Result<Vec<ImportError>, StoreError>;
}

/// Open the store selected by `section`.
pub fn open_store(section: &StoreSection) -> Result<Arc<dyn DefinitionStore>, StoreError> {
    Ok(match section.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&section.database)?),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct FileRecord {
    definitions: Vec<WorkflowDefinition>,
    import_errors: Vec<ImportError>,
    updated_at: Option<DateTime<Utc>>,
}

/// Process-local store, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: Mutex<BTreeMap<PathBuf, FileRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DefinitionStore for MemoryStore {
    fn upsert(&self, file: &Path, result: &ParseResult) -> Result<(), StoreError> {
        self.files.lock().insert(
            file.to_path_buf(),
            FileRecord {
                definitions: result.definitions.clone(),
                import_errors: result.import_errors.clone(),
                updated_at: Some(Utc::now()),
            },
        );
        Ok(())
    }

    fn remove_files(&self, files: &[PathBuf]) -> Result<(), StoreError> {
        let mut guard = self.files.lock();
        for file in files {
            guard.remove(file);
        }
        Ok(())
    }

    fn list_workflows(&self) -> Result<Vec<StoredWorkflow>, StoreError> {
        let guard = self.files.lock();
        let mut all: Vec<StoredWorkflow> = guard
            .iter()
            .flat_map(|(file, record)| {
                record.definitions.iter().map(move |definition| StoredWorkflow {
                    file: file.clone(),
                    definition: definition.clone(),
                    updated_at: record.updated_at.unwrap_or_default(),
                })
            })
            .collect();
        all.sort_by(|a, b| (&a.definition.id, &a.file).cmp(&(&b.definition.id, &b.file)));
        Ok(all)
    }

    fn import_errors(&self) -> Result<Vec<ImportError>, StoreError> {
        Ok(self
            .files
            .lock()
            .values()
            .flat_map(|record| record.import_errors.iter().cloned())
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite store
// ─────────────────────────────────────────────────────────────────────────────

/// Current schema version.
const SCHEMA_VERSION: i32 = 1;

/// Store backed by a SQLite database in WAL mode.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Open {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(|e| StoreError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;

        info!("Definition store opened at {:?}", path);
        Ok(store)
    }

    /// Create an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let current_version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);
        if current_version >= SCHEMA_VERSION {
            debug!("Schema up to date (version {})", current_version);
            return Ok(());
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_definitions (
                file TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                definition TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (file, workflow_id)
            );

            CREATE INDEX IF NOT EXISTS idx_workflow_definitions_id
                ON workflow_definitions(workflow_id);

            CREATE TABLE IF NOT EXISTS import_errors (
                file TEXT NOT NULL,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                traceback TEXT,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (file, seq)
            );
            "#,
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

        Ok(())
    }
}

impl DefinitionStore for SqliteStore {
    fn upsert(&self, file: &Path, result: &ParseResult) -> Result<(), StoreError> {
        let key = file.to_string_lossy().into_owned();
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM workflow_definitions WHERE file = ?1", params![key])?;
        tx.execute("DELETE FROM import_errors WHERE file = ?1", params![key])?;

        {
            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO workflow_definitions (file, workflow_id, definition, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for definition in &result.definitions {
                let encoded = serde_json::to_string(definition)?;
                insert.execute(params![key, definition.id, encoded, now])?;
            }

            let mut insert = tx.prepare(
                "INSERT INTO import_errors (file, seq, kind, message, traceback, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (seq, error) in result.import_errors.iter().enumerate() {
                insert.execute(params![
                    key,
                    seq as i64,
                    error.kind.as_str(),
                    error.message,
                    error.traceback,
                    now
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn remove_files(&self, files: &[PathBuf]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for file in files {
            let key = file.to_string_lossy().into_owned();
            tx.execute("DELETE FROM workflow_definitions WHERE file = ?1", params![key])?;
            tx.execute("DELETE FROM import_errors WHERE file = ?1", params![key])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn list_workflows(&self) -> Result<Vec<StoredWorkflow>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT file, definition, updated_at FROM workflow_definitions
             ORDER BY workflow_id, file",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut workflows = Vec::new();
        for row in rows {
            let (file, definition, updated_at) = row?;
            workflows.push(StoredWorkflow {
                file: PathBuf::from(file),
                definition: serde_json::from_str(&definition)?,
                updated_at: parse_timestamp(&updated_at),
            });
        }
        Ok(workflows)
    }

    fn import_errors(&self) -> Result<Vec<ImportError>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT file, kind, message, traceback FROM import_errors ORDER BY file, seq",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ImportError {
                file: PathBuf::from(row.get::<_, String>(0)?),
                kind: parse_kind(&row.get::<_, String>(1)?),
                message: row.get(2)?,
                traceback: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn parse_kind(value: &str) -> ImportErrorKind {
    match value {
        "timeout" => ImportErrorKind::Timeout,
        "crash" => ImportErrorKind::Crash,
        _ => ImportErrorKind::Exception,
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}
