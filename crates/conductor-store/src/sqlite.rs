use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::PersistenceSink;
use conductor_core::types::{RunExecution, RunId, RunStatus, RunSummary, StepExecution};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        definition_id TEXT NOT NULL,
        parent_run_id TEXT,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        initiated_by TEXT NOT NULL DEFAULT '',
        total_cost REAL NOT NULL DEFAULT 0,
        has_errors INTEGER NOT NULL DEFAULT 0,
        snapshot TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_definition
        ON runs(definition_id, started_at DESC);

    CREATE TABLE IF NOT EXISTS steps (
        run_id TEXT NOT NULL,
        stage_id TEXT NOT NULL,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        snapshot TEXT NOT NULL,
        PRIMARY KEY (run_id, stage_id)
    );";

fn db_err(e: impl std::fmt::Display) -> ConductorError {
    ConductorError::Database(e.to_string())
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// SQLite-backed run store. Runs and steps are stored as JSON snapshots
/// next to the columns needed for history queries.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl SqliteRunStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Opened run store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests and one-off runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn upsert_step(conn: &Connection, run_id: &str, step: &StepExecution) -> Result<()> {
        let snapshot = serde_json::to_string(step)?;
        conn.execute(
            "INSERT INTO steps (run_id, stage_id, status, retry_count, snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(run_id, stage_id) DO UPDATE SET
                 status = excluded.status,
                 retry_count = excluded.retry_count,
                 snapshot = excluded.snapshot",
            params![
                run_id,
                step.stage_id,
                step.status.as_str(),
                step.retry_count as i64,
                snapshot,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Number of stored runs for a definition.
    pub fn count_runs(&self, definition_id: &str) -> Result<usize> {
        let conn = self.conn.lock().map_err(db_err)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM runs WHERE definition_id = ?1",
                params![definition_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as usize)
    }
}

impl PersistenceSink for SqliteRunStore {
    fn save_run(&self, run: &RunExecution) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            let snapshot = serde_json::to_string(&run)?;
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            tx.execute(
                "INSERT INTO runs (id, definition_id, parent_run_id, status, started_at, completed_at,
                                   initiated_by, total_cost, has_errors, snapshot)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                     status = excluded.status,
                     completed_at = excluded.completed_at,
                     total_cost = excluded.total_cost,
                     has_errors = excluded.has_errors,
                     snapshot = excluded.snapshot",
                params![
                    run.id.as_str(),
                    run.definition_id,
                    run.parent_run_id.as_ref().map(|p| p.0.clone()),
                    run.status.as_str(),
                    format_ts(&run.started_at),
                    run.completed_at.as_ref().map(format_ts),
                    run.initiated_by,
                    run.total_cost,
                    run.has_errors() as i64,
                    snapshot,
                ],
            )
            .map_err(db_err)?;
            for step in &run.steps {
                Self::upsert_step(&tx, run.id.as_str(), step)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(())
        })
    }

    fn save_step(&self, run_id: &RunId, step: &StepExecution) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.0.clone();
        let step = step.clone();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            Self::upsert_step(&conn, &run_id, &step)
        })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunExecution>>> {
        let run_id = run_id.0.clone();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let snapshot: Option<String> = conn
                .query_row(
                    "SELECT snapshot FROM runs WHERE id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            let Some(snapshot) = snapshot else {
                return Ok(None);
            };
            let mut run: RunExecution = serde_json::from_str(&snapshot)?;

            // Step rows may be newer than the run snapshot.
            let mut stmt = conn
                .prepare("SELECT snapshot FROM steps WHERE run_id = ?1")
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![run_id], |row| row.get::<_, String>(0))
                .map_err(db_err)?;
            for row in rows {
                let step: StepExecution = serde_json::from_str(&row.map_err(db_err)?)?;
                match run.step_mut(&step.stage_id) {
                    Some(existing) => *existing = step,
                    None => run.steps.push(step),
                }
            }
            Ok(Some(run))
        })
    }

    fn list_runs(
        &self,
        definition_id: &str,
        offset: usize,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        let definition_id = definition_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, definition_id, status, started_at, completed_at, initiated_by,
                            total_cost, has_errors
                     FROM runs
                     WHERE definition_id = ?1
                     ORDER BY started_at DESC
                     LIMIT ?2 OFFSET ?3",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![
                    definition_id,
                    i64::try_from(limit).unwrap_or(i64::MAX),
                    i64::try_from(offset).unwrap_or(i64::MAX)
                ], |row| {
                    let status: String = row.get(2)?;
                    let started: String = row.get(3)?;
                    let completed: Option<String> = row.get(4)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        status,
                        started,
                        completed,
                        row.get::<_, String>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, i64>(7)? != 0,
                    ))
                })
                .map_err(db_err)?;

            let mut summaries = Vec::new();
            for row in rows {
                let (id, def, status, started, completed, initiated_by, total_cost, has_errors) =
                    row.map_err(db_err)?;
                let started_at = parse_ts(&started);
                let completed_at = completed.as_deref().map(parse_ts);
                summaries.push(RunSummary {
                    run_id: RunId(id),
                    definition_id: def,
                    status: RunStatus::parse(&status)
                        .ok_or_else(|| db_err(format!("unknown run status '{status}'")))?,
                    started_at,
                    completed_at,
                    duration_ms: completed_at
                        .map(|end| (end - started_at).num_milliseconds().max(0) as u64),
                    initiated_by,
                    total_cost,
                    has_errors,
                });
            }
            Ok(summaries)
        })
    }
}
