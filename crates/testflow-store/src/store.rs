use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use testflow_core::error::{FlowError, Result};
use testflow_core::flow::Flow;
use testflow_core::traits::{FlowStore, RunStore};
use testflow_core::types::{RunId, TestRun};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        definition TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS test_runs (
        id TEXT PRIMARY KEY,
        flow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        duration_ms INTEGER,
        record TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_test_runs_flow
        ON test_runs(flow_id, started_at);";

fn db_err(e: rusqlite::Error) -> FlowError {
    FlowError::Database(e.to_string())
}

/// SQLite-backed flow and run history store.
///
/// Flows and runs are stored as their JSON form, with the columns needed
/// for lookup and ordering pulled out alongside.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))
    }
}

impl FlowStore for SqliteStore {
    fn save_flow(&self, flow: &Flow) -> BoxFuture<'_, Result<()>> {
        let id = flow.id.clone();
        let name = flow.name.clone();
        let definition = serde_json::to_string(flow);

        Box::pin(async move {
            let definition = definition?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO flows (id, name, definition, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, name, definition, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_flow(&self, id: &str) -> BoxFuture<'_, Result<Option<Flow>>> {
        let id = id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let definition: Option<String> = conn
                .query_row(
                    "SELECT definition FROM flows WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match definition {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    fn list_flows(&self) -> BoxFuture<'_, Result<Vec<Flow>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT definition FROM flows ORDER BY updated_at DESC, rowid DESC")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut flows = Vec::new();
            for row in rows {
                let json = row.map_err(db_err)?;
                flows.push(serde_json::from_str(&json)?);
            }
            Ok(flows)
        })
    }

    fn delete_flow(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();

        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db_err)?;
            let removed = tx
                .execute("DELETE FROM flows WHERE id = ?1", params![id])
                .map_err(db_err)?;
            tx.execute("DELETE FROM test_runs WHERE flow_id = ?1", params![id])
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(removed > 0)
        })
    }
}

impl RunStore for SqliteStore {
    fn save_run(&self, run: &TestRun) -> BoxFuture<'_, Result<()>> {
        let id = run.id.to_string();
        let flow_id = run.flow_id.clone();
        let status = run.status.as_str();
        let started_at = run.started_at.to_rfc3339();
        let completed_at = run.completed_at.map(|t| t.to_rfc3339());
        let duration_ms = run.duration_ms.map(|d| d as i64);
        let record = serde_json::to_string(run);

        Box::pin(async move {
            let record = record?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO test_runs
                    (id, flow_id, status, started_at, completed_at, duration_ms, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id, flow_id, status, started_at, completed_at, duration_ms, record],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<TestRun>>> {
        let id = id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let record: Option<String> = conn
                .query_row(
                    "SELECT record FROM test_runs WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match record {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    fn runs_for_flow(&self, flow_id: &str, limit: usize) -> BoxFuture<'_, Result<Vec<TestRun>>> {
        let flow_id = flow_id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT record FROM test_runs
                     WHERE flow_id = ?1
                     ORDER BY started_at DESC, rowid DESC
                     LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![flow_id, limit as i64], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut runs = Vec::new();
            for row in rows {
                let json = row.map_err(db_err)?;
                runs.push(serde_json::from_str(&json)?);
            }
            Ok(runs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use testflow_core::types::ExecutionStatus;
    use testflow_test_utils::{chain, mock, sample_run, verify_equals};

    fn sample_flow(id: &str) -> Flow {
        chain(
            id,
            vec![mock("m", json!({"status": 200})), verify_equals("v", json!({"status": 200}))],
        )
    }

    #[tokio::test]
    async fn test_flow_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let flow = sample_flow("login");
        store.save_flow(&flow).await.unwrap();

        let loaded = store.get_flow("login").await.unwrap().unwrap();
        assert_eq!(loaded.nodes, flow.nodes);
        assert_eq!(loaded.edges, flow.edges);
        assert!(store.get_flow("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_and_lists_newest_first() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_flow(&sample_flow("a")).await.unwrap();
        store.save_flow(&sample_flow("b")).await.unwrap();

        let mut renamed = sample_flow("a");
        renamed.name = "A v2".into();
        store.save_flow(&renamed).await.unwrap();

        let flows = store.list_flows().await.unwrap();
        let ids: Vec<&str> = flows.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(flows[0].name, "A v2");
    }

    #[tokio::test]
    async fn test_runs_for_flow() {
        let store = SqliteStore::in_memory().unwrap();
        let first = sample_run("login", &[("m", ExecutionStatus::Success)]);
        let mut second = sample_run("login", &[("m", ExecutionStatus::Failed)]);
        second.started_at = first.started_at + chrono::Duration::seconds(1);
        let other = sample_run("checkout", &[("m", ExecutionStatus::Success)]);

        for run in [&first, &second, &other] {
            store.save_run(run).await.unwrap();
        }

        let runs = store.runs_for_flow("login", 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.id);
        assert_eq!(runs[0].status, ExecutionStatus::Failed);

        let limited = store.runs_for_flow("login", 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        let loaded = store.get_run(&first.id).await.unwrap().unwrap();
        assert_eq!(loaded.node_results["m"].status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_delete_flow_removes_history() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_flow(&sample_flow("gone")).await.unwrap();
        store
            .save_run(&sample_run("gone", &[("m", ExecutionStatus::Success)]))
            .await
            .unwrap();

        assert!(store.delete_flow("gone").await.unwrap());
        assert!(!store.delete_flow("gone").await.unwrap());
        assert!(store.runs_for_flow("gone", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("testflow.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_flow(&sample_flow("persisted")).await.unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert!(reopened.get_flow("persisted").await.unwrap().is_some());
    }
}
