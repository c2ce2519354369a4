//! SQLite-backed run state store.
//!
//! The store is the single source of truth shared across workers; all
//! scheduler coordination flows through the atomic `transition`
//! operation rather than in-memory shared state.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;

use super::models::*;
use crate::error::{Error, Result};

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_json(s: Option<String>) -> Option<Value> {
    s.and_then(|raw| serde_json::from_str(&raw).ok())
}

/// Default run listing limit.
const DEFAULT_LIST_LIMIT: usize = 50;
/// Maximum run listing limit.
const MAX_LIST_LIMIT: usize = 1000;

/// SQLite-based run state store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        // WAL must be set before any transaction begins.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                definition TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                graph_version INTEGER NOT NULL,
                status TEXT NOT NULL,
                input TEXT NOT NULL,
                output TEXT,
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE TABLE IF NOT EXISTS node_executions (
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                status TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 1,
                output TEXT,
                error TEXT,
                started_at TEXT,
                finished_at TEXT,
                PRIMARY KEY (run_id, node_id),
                FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_runs_workflow ON runs(workflow_name);
            CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id);
            "#,
        )?;
        Ok(())
    }

    // =========================================================================
    // Workflows
    // =========================================================================

    /// Store a workflow definition, bumping the version on update.
    pub async fn save_workflow(&self, name: &str, definition: &str) -> Result<StoredWorkflow> {
        let conn = self.conn.lock().await;
        let now = Utc::now();

        let existing: Option<(String, u32, String)> = conn
            .query_row(
                "SELECT id, version, created_at FROM workflows WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let workflow = match existing {
            Some((id, version, created_at)) => {
                let version = version + 1;
                conn.execute(
                    "UPDATE workflows SET definition = ?1, version = ?2, updated_at = ?3 WHERE id = ?4",
                    params![definition, version, now.to_rfc3339(), id],
                )?;
                StoredWorkflow {
                    id,
                    name: name.to_string(),
                    definition: definition.to_string(),
                    version,
                    created_at: parse_datetime_utc(&created_at)?,
                    updated_at: now,
                }
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO workflows (id, name, definition, version, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 1, ?4, ?4)",
                    params![id, name, definition, now.to_rfc3339()],
                )?;
                StoredWorkflow {
                    id,
                    name: name.to_string(),
                    definition: definition.to_string(),
                    version: 1,
                    created_at: now,
                    updated_at: now,
                }
            }
        };

        Ok(workflow)
    }

    /// Look up a workflow by name or ID.
    pub async fn get_workflow(&self, name_or_id: &str) -> Result<Option<StoredWorkflow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, name, definition, version, created_at, updated_at
                 FROM workflows WHERE name = ?1 OR id = ?1",
                params![name_or_id],
                |row| {
                    Ok(StoredWorkflow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        definition: row.get(2)?,
                        version: row.get(3)?,
                        created_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
                        updated_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub async fn list_workflows(&self) -> Result<Vec<StoredWorkflow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, definition, version, created_at, updated_at
             FROM workflows ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoredWorkflow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    definition: row.get(2)?,
                    version: row.get(3)?,
                    created_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
                    updated_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Create a new run in `pending` state.
    pub async fn create_run(
        &self,
        workflow_id: &str,
        workflow_name: &str,
        graph_version: u32,
        input: &Value,
    ) -> Result<Run> {
        let run = Run {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            workflow_name: workflow_name.to_string(),
            graph_version,
            status: RunStatus::Pending,
            input: input.clone(),
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO runs (id, workflow_id, workflow_name, graph_version, status, input, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.id,
                run.workflow_id,
                run.workflow_name,
                run.graph_version,
                run.status.to_string(),
                serde_json::to_string(&run.input)?,
                run.started_at.to_rfc3339(),
            ],
        )?;
        Ok(run)
    }

    /// Move a run to a new status. Terminal statuses also record output,
    /// error, and finish time; a run already terminal is left untouched.
    pub async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let finished_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        let changed = conn.execute(
            "UPDATE runs SET status = ?1, output = ?2, error = ?3, finished_at = ?4
             WHERE id = ?5 AND status NOT IN ('succeeded', 'failed', 'cancelled')",
            params![
                status.to_string(),
                output.map(serde_json::to_string).transpose()?,
                error,
                finished_at,
                run_id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, workflow_id, workflow_name, graph_version, status, input, output,
                        error, started_at, finished_at
                 FROM runs WHERE id = ?1",
                params![run_id],
                Self::map_run,
            )
            .optional()?;
        Ok(row)
    }

    /// List recent runs, newest first.
    pub async fn list_runs(&self, status: Option<RunStatus>, limit: usize) -> Result<Vec<Run>> {
        let limit = if limit == 0 { DEFAULT_LIST_LIMIT } else { limit }.min(MAX_LIST_LIMIT);
        let conn = self.conn.lock().await;

        let mut runs = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT id, workflow_id, workflow_name, graph_version, status, input, output,
                            error, started_at, finished_at
                     FROM runs WHERE status = ?1 ORDER BY started_at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![status.to_string(), limit], Self::map_run)?;
                for row in rows {
                    runs.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, workflow_id, workflow_name, graph_version, status, input, output,
                            error, started_at, finished_at
                     FROM runs ORDER BY started_at DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], Self::map_run)?;
                for row in rows {
                    runs.push(row?);
                }
            }
        }
        Ok(runs)
    }

    fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
        let status: String = row.get(4)?;
        let input: String = row.get(5)?;
        Ok(Run {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            workflow_name: row.get(2)?,
            graph_version: row.get(3)?,
            status: RunStatus::from_str(&status).map_err(|_| {
                rusqlite::Error::InvalidColumnType(4, "status".into(), rusqlite::types::Type::Text)
            })?,
            input: serde_json::from_str(&input).unwrap_or(Value::Null),
            output: parse_json(row.get(6)?),
            error: row.get(7)?,
            started_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
            finished_at: row
                .get::<_, Option<String>>(9)?
                .map(|s| parse_datetime_utc(&s))
                .transpose()?,
        })
    }

    // =========================================================================
    // Node executions
    // =========================================================================

    /// Create a node execution row if none exists yet.
    ///
    /// Rows are created lazily when a node first becomes reachable;
    /// racing creators are harmless because of the INSERT OR IGNORE.
    pub async fn init_node_execution(
        &self,
        run_id: &str,
        node_id: &str,
        status: NodeStatus,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO node_executions (run_id, node_id, status, attempt)
             VALUES (?1, ?2, ?3, 1)",
            params![run_id, node_id, status.to_string()],
        )?;
        Ok(())
    }

    /// Atomically transition a node execution.
    ///
    /// The UPDATE only applies while the recorded status is non-terminal,
    /// which guarantees at-most-once acceptance of a terminal transition
    /// per `(run_id, node_id)`: when N workers race, exactly one update
    /// succeeds and the rest observe `AlreadyDecided` with the recorded
    /// result. This is what prevents duplicate downstream side effects.
    ///
    /// The attempt counter only moves forward: a transition carrying a
    /// lower attempt keeps the recorded one.
    pub async fn transition(
        &self,
        run_id: &str,
        node_id: &str,
        status: NodeStatus,
        attempt: u32,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<Transition> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();

        let started_at = matches!(status, NodeStatus::Running).then_some(now.as_str());
        let finished_at = status.is_terminal().then_some(now.as_str());

        let changed = conn.execute(
            "UPDATE node_executions
             SET status = ?1, attempt = MAX(?2, attempt), output = ?3, error = ?4,
                 started_at = COALESCE(started_at, ?5), finished_at = ?6
             WHERE run_id = ?7 AND node_id = ?8
               AND status NOT IN ('succeeded', 'failed', 'skipped', 'cancelled')",
            params![
                status.to_string(),
                attempt,
                output.map(serde_json::to_string).transpose()?,
                error,
                started_at,
                finished_at,
                run_id,
                node_id,
            ],
        )?;

        let record = Self::query_node_execution(&conn, run_id, node_id)?.ok_or_else(|| {
            Error::Storage(format!(
                "node execution {}/{} not initialized before transition",
                run_id, node_id
            ))
        })?;

        if changed > 0 {
            Ok(Transition::Accepted(record))
        } else {
            Ok(Transition::AlreadyDecided(record))
        }
    }

    pub async fn get_node_execution(
        &self,
        run_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeExecution>> {
        let conn = self.conn.lock().await;
        Self::query_node_execution(&conn, run_id, node_id)
    }

    fn query_node_execution(
        conn: &Connection,
        run_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeExecution>> {
        let row = conn
            .query_row(
                "SELECT run_id, node_id, status, attempt, output, error, started_at, finished_at
                 FROM node_executions WHERE run_id = ?1 AND node_id = ?2",
                params![run_id, node_id],
                Self::map_node_execution,
            )
            .optional()?;
        Ok(row)
    }

    fn map_node_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeExecution> {
        let status: String = row.get(2)?;
        Ok(NodeExecution {
            run_id: row.get(0)?,
            node_id: row.get(1)?,
            status: NodeStatus::from_str(&status).map_err(|_| {
                rusqlite::Error::InvalidColumnType(2, "status".into(), rusqlite::types::Type::Text)
            })?,
            attempt: row.get(3)?,
            output: parse_json(row.get(4)?),
            error: row.get(5)?,
            started_at: row
                .get::<_, Option<String>>(6)?
                .map(|s| parse_datetime_utc(&s))
                .transpose()?,
            finished_at: row
                .get::<_, Option<String>>(7)?
                .map(|s| parse_datetime_utc(&s))
                .transpose()?,
        })
    }

    /// Full state of a run for resumption after a crash.
    pub async fn snapshot(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        let run = match self.get_run(run_id).await? {
            Some(run) => run,
            None => return Ok(None),
        };

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT run_id, node_id, status, attempt, output, error, started_at, finished_at
             FROM node_executions WHERE run_id = ?1",
        )?;
        let nodes = stmt
            .query_map(params![run_id], Self::map_node_execution)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Some(RunSnapshot { run, nodes }))
    }

    /// IDs of runs left `running`, used by crash recovery at startup.
    pub async fn unfinished_run_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT id FROM runs WHERE status IN ('pending', 'running')")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Append an event row. Events are write-once and never updated.
    pub async fn append_event(&self, run_id: &str, kind: &str, payload: &Value) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events (run_id, kind, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                run_id,
                kind,
                serde_json::to_string(payload)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Events for a run in append order.
    pub async fn list_events(&self, run_id: &str) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, kind, payload, created_at FROM events
             WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                let payload: String = row.get(3)?;
                Ok(EventRecord {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    kind: row.get(2)?,
                    payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                    created_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store_with_run() -> (SqliteStore, Run) {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store
            .create_run("wf-1", "test-workflow", 1, &json!({"key": "value"}))
            .await
            .unwrap();
        (store, run)
    }

    #[tokio::test]
    async fn run_round_trip() {
        let (store, run) = store_with_run().await;
        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Pending);
        assert_eq!(loaded.input, json!({"key": "value"}));
        assert_eq!(loaded.workflow_name, "test-workflow");
    }

    #[tokio::test]
    async fn terminal_run_status_is_sticky() {
        let (store, run) = store_with_run().await;
        assert!(store
            .update_run_status(&run.id, RunStatus::Cancelled, None, None)
            .await
            .unwrap());
        // A late success result must not overwrite the cancellation.
        assert!(!store
            .update_run_status(&run.id, RunStatus::Succeeded, Some(&json!("late")), None)
            .await
            .unwrap());
        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn transition_happy_path() {
        let (store, run) = store_with_run().await;
        store
            .init_node_execution(&run.id, "a", NodeStatus::Ready)
            .await
            .unwrap();

        let t = store
            .transition(&run.id, "a", NodeStatus::Running, 1, None, None)
            .await
            .unwrap();
        assert!(t.is_accepted());
        assert!(t.record().started_at.is_some());

        let t = store
            .transition(&run.id, "a", NodeStatus::Succeeded, 1, Some(&json!("out")), None)
            .await
            .unwrap();
        assert!(t.is_accepted());
        assert_eq!(t.record().output, Some(json!("out")));
        assert!(t.record().finished_at.is_some());
    }

    #[tokio::test]
    async fn terminal_transition_is_at_most_once() {
        let (store, run) = store_with_run().await;
        store
            .init_node_execution(&run.id, "a", NodeStatus::Ready)
            .await
            .unwrap();

        let first = store
            .transition(&run.id, "a", NodeStatus::Succeeded, 1, Some(&json!(1)), None)
            .await
            .unwrap();
        assert!(first.is_accepted());

        let second = store
            .transition(&run.id, "a", NodeStatus::Failed, 1, None, Some("too late"))
            .await
            .unwrap();
        assert!(!second.is_accepted());
        // The recorded result wins, not the late caller's.
        assert_eq!(second.record().status, NodeStatus::Succeeded);
        assert_eq!(second.record().output, Some(json!(1)));
    }

    #[tokio::test]
    async fn attempt_counter_never_moves_backwards() {
        let (store, run) = store_with_run().await;
        store
            .init_node_execution(&run.id, "a", NodeStatus::Ready)
            .await
            .unwrap();

        // Third retry is in flight when a cancel lands with attempt 1.
        store
            .transition(&run.id, "a", NodeStatus::Running, 3, None, None)
            .await
            .unwrap();

        let t = store
            .transition(&run.id, "a", NodeStatus::Cancelled, 1, None, None)
            .await
            .unwrap();
        assert!(t.is_accepted());
        assert_eq!(t.record().status, NodeStatus::Cancelled);
        assert_eq!(t.record().attempt, 3);
    }

    #[tokio::test]
    async fn racing_terminal_transitions_accept_exactly_one() {
        let (store, run) = store_with_run().await;
        store
            .init_node_execution(&run.id, "a", NodeStatus::Ready)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for worker in 0..8u32 {
            let store = store.clone();
            let run_id = run.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transition(
                        &run_id,
                        "a",
                        NodeStatus::Succeeded,
                        1,
                        Some(&json!(worker)),
                        None,
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut accepted = 0;
        let mut recorded_outputs = std::collections::HashSet::new();
        for handle in handles {
            let t = handle.await.unwrap();
            if t.is_accepted() {
                accepted += 1;
            }
            recorded_outputs.insert(t.record().output.clone().unwrap().to_string());
        }

        assert_eq!(accepted, 1);
        // Every caller observed the single recorded output.
        assert_eq!(recorded_outputs.len(), 1);
    }

    #[tokio::test]
    async fn init_node_execution_is_idempotent() {
        let (store, run) = store_with_run().await;
        store
            .init_node_execution(&run.id, "a", NodeStatus::Ready)
            .await
            .unwrap();
        store
            .transition(&run.id, "a", NodeStatus::Running, 1, None, None)
            .await
            .unwrap();
        // A second init must not reset the status.
        store
            .init_node_execution(&run.id, "a", NodeStatus::Ready)
            .await
            .unwrap();
        let rec = store.get_node_execution(&run.id, "a").await.unwrap().unwrap();
        assert_eq!(rec.status, NodeStatus::Running);
    }

    #[tokio::test]
    async fn snapshot_reconstructs_node_state() {
        let (store, run) = store_with_run().await;
        for (node, status) in [
            ("a", NodeStatus::Succeeded),
            ("b", NodeStatus::Running),
            ("c", NodeStatus::Ready),
        ] {
            store
                .init_node_execution(&run.id, node, NodeStatus::Ready)
                .await
                .unwrap();
            if status != NodeStatus::Ready {
                store
                    .transition(&run.id, node, status, 1, Some(&json!(node)), None)
                    .await
                    .unwrap();
            }
        }

        let snapshot = store.snapshot(&run.id).await.unwrap().unwrap();
        assert_eq!(snapshot.nodes.len(), 3);
        let by_id: std::collections::HashMap<_, _> = snapshot
            .nodes
            .iter()
            .map(|n| (n.node_id.as_str(), n.status))
            .collect();
        assert_eq!(by_id["a"], NodeStatus::Succeeded);
        assert_eq!(by_id["b"], NodeStatus::Running);
        assert_eq!(by_id["c"], NodeStatus::Ready);
    }

    #[tokio::test]
    async fn workflow_version_bumps_on_update() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.save_workflow("flow", "name: flow").await.unwrap();
        assert_eq!(first.version, 1);
        let second = store.save_workflow("flow", "name: flow\nversion: 2").await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn events_preserve_append_order() {
        let (store, run) = store_with_run().await;
        for i in 0..5 {
            store
                .append_event(&run.id, "node_status", &json!({"seq": i}))
                .await
                .unwrap();
        }
        let events = store.list_events(&run.id).await.unwrap();
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.payload["seq"], i);
        }
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weft.db");

        let run_id = {
            let store = SqliteStore::open(&path).unwrap();
            let run = store
                .create_run("wf-1", "durable", 1, &json!({"k": 1}))
                .await
                .unwrap();
            store
                .init_node_execution(&run.id, "a", NodeStatus::Ready)
                .await
                .unwrap();
            store
                .transition(&run.id, "a", NodeStatus::Succeeded, 1, Some(&json!(9)), None)
                .await
                .unwrap();
            run.id
        };

        let reopened = SqliteStore::open(&path).unwrap();
        let run = reopened.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.workflow_name, "durable");
        let rec = reopened
            .get_node_execution(&run_id, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, NodeStatus::Succeeded);
        assert_eq!(rec.output, Some(json!(9)));
    }

    #[tokio::test]
    async fn unfinished_runs_are_listed() {
        let (store, run) = store_with_run().await;
        store
            .update_run_status(&run.id, RunStatus::Running, None, None)
            .await
            .unwrap();
        let other = store.create_run("wf-2", "other", 1, &json!(null)).await.unwrap();
        store
            .update_run_status(&other.id, RunStatus::Succeeded, None, None)
            .await
            .unwrap();

        let ids = store.unfinished_run_ids().await.unwrap();
        assert_eq!(ids, vec![run.id]);
    }
}
