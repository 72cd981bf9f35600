use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use inkflow_core::error::{InkflowError, Result};

/// Snapshot of a run's state right after a node completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub run_id: String,
    /// 1-based node execution count at which the snapshot was taken.
    pub step: usize,
    /// Node whose update produced this state.
    pub node: String,
    pub state: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Append-only store of checkpoint records, keyed by run id.
pub trait CheckpointStore: Send + Sync + 'static {
    fn save(&self, record: &CheckpointRecord) -> Result<()>;

    /// The record with the highest step for this run.
    fn load_latest(&self, run_id: &str) -> Result<Option<CheckpointRecord>>;

    /// All records for this run, ordered by step.
    fn list(&self, run_id: &str) -> Result<Vec<CheckpointRecord>>;

    /// Delete a run's records, returning how many were removed.
    fn delete_run(&self, run_id: &str) -> Result<usize>;
}

/// In-process store. The default for runs that do not configure one.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<HashMap<String, Vec<CheckpointRecord>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<CheckpointRecord>>>> {
        self.runs
            .lock()
            .map_err(|e| InkflowError::Checkpoint(e.to_string()))
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, record: &CheckpointRecord) -> Result<()> {
        self.lock()?
            .entry(record.run_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn load_latest(&self, run_id: &str) -> Result<Option<CheckpointRecord>> {
        Ok(self
            .lock()?
            .get(run_id)
            .and_then(|records| records.iter().max_by_key(|r| r.step).cloned()))
    }

    fn list(&self, run_id: &str) -> Result<Vec<CheckpointRecord>> {
        let mut records = self.lock()?.get(run_id).cloned().unwrap_or_default();
        records.sort_by_key(|r| r.step);
        Ok(records)
    }

    fn delete_run(&self, run_id: &str) -> Result<usize> {
        Ok(self.lock()?.remove(run_id).map_or(0, |r| r.len()))
    }
}

/// Persistent checkpoint store backed by SQLite.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

fn db_err(context: &str, e: impl std::fmt::Display) -> InkflowError {
    InkflowError::Database(format!("{}: {}", context, e))
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(|e| db_err("Failed to open checkpoint store", e))?;
        Self::init(conn)
    }

    /// Private database that disappears with the store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| db_err("Failed to open checkpoint store", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL,
                 step INTEGER NOT NULL,
                 node TEXT NOT NULL,
                 state_json TEXT NOT NULL,
                 timestamp TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_cp_run_step
                 ON checkpoints(run_id, step DESC);",
        )
        .map_err(|e| db_err("Failed to initialize checkpoint schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| InkflowError::Database(e.to_string()))
    }

    /// Distinct run ids with their latest step, most recent first.
    pub fn list_runs(&self) -> Result<Vec<(String, usize)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, MAX(step), MAX(timestamp) AS last
                 FROM checkpoints
                 GROUP BY run_id
                 ORDER BY last DESC",
            )
            .map_err(|e| db_err("Failed to prepare query", e))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })
            .map_err(|e| db_err("Failed to list runs", e))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| db_err("Failed to read run row", e))
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_record(
    (run_id, step, node, state_json, ts): (String, i64, String, String, String),
) -> Result<CheckpointRecord> {
    Ok(CheckpointRecord {
        run_id,
        step: step as usize,
        node,
        state: serde_json::from_str(&state_json)?,
        timestamp: DateTime::parse_from_rfc3339(&ts)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| db_err("Invalid checkpoint timestamp", e))?,
    })
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, record: &CheckpointRecord) -> Result<()> {
        let state_json = serde_json::to_string(&record.state)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO checkpoints (run_id, step, node, state_json, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.run_id,
                record.step as i64,
                record.node,
                state_json,
                record.timestamp.to_rfc3339(),
            ],
        )
        .map_err(|e| db_err("Failed to save checkpoint", e))?;
        Ok(())
    }

    fn load_latest(&self, run_id: &str) -> Result<Option<CheckpointRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT run_id, step, node, state_json, timestamp
                 FROM checkpoints
                 WHERE run_id = ?1
                 ORDER BY step DESC
                 LIMIT 1",
                params![run_id],
                record_from_row,
            )
            .optional()
            .map_err(|e| db_err("Failed to load checkpoint", e))?;

        row.map(decode_record).transpose()
    }

    fn list(&self, run_id: &str) -> Result<Vec<CheckpointRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, step, node, state_json, timestamp
                 FROM checkpoints
                 WHERE run_id = ?1
                 ORDER BY step ASC",
            )
            .map_err(|e| db_err("Failed to prepare query", e))?;

        let rows = stmt
            .query_map(params![run_id], record_from_row)
            .map_err(|e| db_err("Failed to list checkpoints", e))?;

        rows.map(|row| {
            row.map_err(|e| db_err("Failed to read checkpoint row", e))
                .and_then(decode_record)
        })
        .collect()
    }

    fn delete_run(&self, run_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM checkpoints WHERE run_id = ?1", params![run_id])
            .map_err(|e| db_err("Failed to delete checkpoints", e))
    }
}
