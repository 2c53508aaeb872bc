use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use sopflow_core::error::{Result, SopError};
use sopflow_core::state::ExecutionState;
use sopflow_core::traits::SnapshotStore;
use sopflow_core::types::{RunId, RunStatus};

fn db_err(context: &str, e: impl std::fmt::Display) -> SopError {
    SopError::Database(format!("{}: {}", context, e))
}

/// Persistent snapshot store backed by SQLite, one row per run.
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    /// Open or create the snapshot database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(|e| db_err("Failed to open snapshot store", e))?;
        Self::init(conn)
    }

    /// In-memory database, mostly for tests.
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| db_err("Failed to open snapshot store", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS runs (
                 run_id TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 cursor TEXT,
                 pending_step TEXT,
                 state_json TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_runs_status
                 ON runs(status, updated_at DESC);",
        )
        .map_err(|e| db_err("Failed to initialize snapshot schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| db_err("Snapshot store poisoned", e))
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, state: &ExecutionState) -> Result<()> {
        let json = state.to_json()?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (run_id, status, cursor, pending_step, state_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(run_id) DO UPDATE SET
                 status = excluded.status,
                 cursor = excluded.cursor,
                 pending_step = excluded.pending_step,
                 state_json = excluded.state_json,
                 updated_at = excluded.updated_at",
            params![
                state.run_id.as_str(),
                state.status.as_str(),
                state.cursor,
                state.pending_approval.as_ref().map(|p| p.step_id.as_str()),
                json,
                state.created_at.to_rfc3339(),
                state.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| db_err("Failed to save snapshot", e))?;
        Ok(())
    }

    fn load(&self, run_id: &RunId) -> Result<Option<ExecutionState>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("Failed to load snapshot", e))?;
        json.map(|j| ExecutionState::from_json(&j)).transpose()
    }

    fn list(&self, status: Option<RunStatus>) -> Result<Vec<ExecutionState>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT state_json FROM runs
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY updated_at DESC",
            )
            .map_err(|e| db_err("Failed to prepare query", e))?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], |row| row.get::<_, String>(0))
            .map_err(|e| db_err("Failed to list snapshots", e))?;

        let mut states = Vec::new();
        for row in rows {
            let json = row.map_err(|e| db_err("Failed to read snapshot row", e))?;
            states.push(ExecutionState::from_json(&json)?);
        }
        Ok(states)
    }

    fn delete(&self, run_id: &RunId) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute("DELETE FROM runs WHERE run_id = ?1", params![run_id.as_str()])
            .map_err(|e| db_err("Failed to delete snapshot", e))?;
        Ok(deleted > 0)
    }
}

/// Process-local store. Snapshots are kept serialized so loads exercise the
/// same format checks as the durable store.
#[derive(Default)]
pub struct MemorySnapshotStore {
    runs: Mutex<HashMap<RunId, String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, state: &ExecutionState) -> Result<()> {
        let json = state.to_json()?;
        self.runs
            .lock()
            .map_err(|e| SopError::Snapshot(e.to_string()))?
            .insert(state.run_id.clone(), json);
        Ok(())
    }

    fn load(&self, run_id: &RunId) -> Result<Option<ExecutionState>> {
        let runs = self.runs.lock().map_err(|e| SopError::Snapshot(e.to_string()))?;
        runs.get(run_id)
            .map(|j| ExecutionState::from_json(j))
            .transpose()
    }

    fn list(&self, status: Option<RunStatus>) -> Result<Vec<ExecutionState>> {
        let runs = self.runs.lock().map_err(|e| SopError::Snapshot(e.to_string()))?;
        let mut states = runs
            .values()
            .map(|j| ExecutionState::from_json(j))
            .collect::<Result<Vec<_>>>()?;
        states.retain(|s| status.map_or(true, |st| s.status == st));
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states)
    }

    fn delete(&self, run_id: &RunId) -> Result<bool> {
        Ok(self
            .runs
            .lock()
            .map_err(|e| SopError::Snapshot(e.to_string()))?
            .remove(run_id)
            .is_some())
    }
}
