//! SQLite implementation of the task store, the prepaid ledger, and the
//! principal store.
//!
//! Uses [`sqlx`] with the `sqlite` feature. Migrations are run automatically
//! on startup via [`SqliteStore::connect`].
//!
//! # Migrations path
//!
//! `sqlx::migrate!("./migrations")` resolves the path **at compile time**
//! relative to `CARGO_MANIFEST_DIR` (the crate root), so the directory is
//! embedded into the binary. The database file location is determined at
//! runtime by the `COURIER_DATABASE_URL` environment variable and is **not**
//! related to the current working directory at runtime.
//!
//! # Queries
//!
//! The `sqlx::query` (runtime-verified) form is used deliberately so that no
//! `DATABASE_URL` environment variable is needed at compile time.

use chrono::{DateTime, Utc};
use courier_core::{
    Affordability, CoreError, ErrorInfo, NewTask, ResourceLedger, TaskId, TaskPatch, TaskRecord,
    TaskState, TaskStore,
};
use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::warn;

use super::{Principal, PrincipalStore};

/// SQLite-backed store for tasks, principals, and the point ledger.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

type TaskRow = (i64, i64, String, String, String, i64, i64, String, String);

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending
    /// migrations. `url` should be a sqlx-compatible SQLite URL, e.g.
    /// `"sqlite://courier.db"` or `"sqlite://:memory:"` for tests.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let opts = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // In-memory databases are per-connection: a second pooled connection
        // would see an empty schema, so the pool is pinned to one.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;
        // Path is resolved relative to CARGO_MANIFEST_DIR at compile time.
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Tasks belonging to one principal, newest first.
    pub async fn list_tasks(&self, principal_id: i64) -> Result<Vec<TaskRecord>, sqlx::Error> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, principal_id, app_id, state, start_time, use_time_ms, used_points, result, error_infos \
             FROM tasks WHERE principal_id = ?1 ORDER BY id DESC",
        )
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(task_from_row).collect())
    }

    /// Startup recovery: records still `processing` from a previous run can
    /// no longer be reconciled (their drivers died with the process), so they
    /// are failed rather than left dangling.
    pub async fn interrupt_processing_tasks(&self) -> Result<u64, sqlx::Error> {
        let errors = serde_json::to_string(&vec![ErrorInfo::new("interrupted by restart")])
            .unwrap_or_else(|_| "[]".to_owned());
        let result = sqlx::query(
            "UPDATE tasks SET state = 'failed', error_infos = ?1 WHERE state = 'processing'",
        )
        .bind(&errors)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn task_from_row(row: TaskRow) -> TaskRecord {
    let (id, principal_id, app_id, state, start_time, use_time_ms, used_points, result, error_infos) =
        row;
    TaskRecord {
        id,
        principal_id,
        app_id,
        state: TaskState::parse(&state).unwrap_or_else(|| {
            warn!(task_id = id, raw = %state, "unknown task state in store; treating as failed");
            TaskState::Failed
        }),
        start_time: start_time
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|e| {
                warn!(task_id = id, raw = %start_time, error = %e, "failed to parse start_time; using now");
                Utc::now()
            }),
        use_time_ms,
        used_points,
        result: serde_json::from_str(&result).unwrap_or_else(|e| {
            warn!(task_id = id, error = %e, "failed to parse stored result; dropping");
            Vec::new()
        }),
        error_infos: serde_json::from_str(&error_infos).unwrap_or_else(|e| {
            warn!(task_id = id, error = %e, "failed to parse stored error_infos; dropping");
            Vec::new()
        }),
    }
}

fn store_err(e: sqlx::Error) -> CoreError {
    CoreError::Store(e.to_string())
}

fn json_err(e: serde_json::Error) -> CoreError {
    CoreError::Store(format!("failed to serialize record field: {e}"))
}

// ── TaskStore ─────────────────────────────────────────────────────────────────

impl TaskStore for SqliteStore {
    async fn create_task(&self, new: NewTask) -> Result<TaskRecord, CoreError> {
        let start_time = new.start_time.to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO tasks (principal_id, app_id, state, start_time) \
             VALUES (?1, ?2, 'processing', ?3)",
        )
        .bind(new.principal_id)
        .bind(&new.app_id)
        .bind(&start_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(TaskRecord {
            id: result.last_insert_rowid(),
            principal_id: new.principal_id,
            app_id: new.app_id,
            state: TaskState::Processing,
            start_time: new.start_time,
            use_time_ms: 0,
            used_points: 0,
            result: Vec::new(),
            error_infos: Vec::new(),
        })
    }

    async fn update_task(&self, id: TaskId, patch: TaskPatch) -> Result<(), CoreError> {
        let state = patch.state.map(|s| s.as_str());
        let result = patch
            .result
            .map(|r| serde_json::to_string(&r))
            .transpose()
            .map_err(json_err)?;
        let error_infos = patch
            .error_infos
            .map(|e| serde_json::to_string(&e))
            .transpose()
            .map_err(json_err)?;

        // The `state = 'processing'` guard makes terminal records immutable:
        // a patch against a terminal row affects zero rows and is dropped.
        sqlx::query(
            "UPDATE tasks SET \
               state = COALESCE(?1, state), \
               use_time_ms = COALESCE(?2, use_time_ms), \
               used_points = COALESCE(?3, used_points), \
               result = COALESCE(?4, result), \
               error_infos = COALESCE(?5, error_infos) \
             WHERE id = ?6 AND state = 'processing'",
        )
        .bind(state)
        .bind(patch.use_time_ms)
        .bind(patch.used_points)
        .bind(&result)
        .bind(&error_infos)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, CoreError> {
        let row: Option<TaskRow> = sqlx::query_as(
            "SELECT id, principal_id, app_id, state, start_time, use_time_ms, used_points, result, error_infos \
             FROM tasks WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(task_from_row))
    }

    async fn delete_task(&self, id: TaskId) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

// ── ResourceLedger ────────────────────────────────────────────────────────────

impl ResourceLedger for SqliteStore {
    async fn is_affordable(
        &self,
        principal: i64,
        amount: i64,
    ) -> Result<Affordability, CoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT balance FROM principals WHERE id = ?1")
            .bind(principal)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        let balance = row.map(|(b,)| b).unwrap_or(0);
        Ok(Affordability {
            ok: balance >= amount,
            balance,
        })
    }

    async fn deduct(&self, principal: i64, amount: i64) -> Result<bool, CoreError> {
        // The balance guard keeps the write from driving a balance negative
        // even when it moved between check and deduct.
        let result = sqlx::query(
            "UPDATE principals SET balance = balance - ?1 WHERE id = ?2 AND balance >= ?1",
        )
        .bind(amount)
        .bind(principal)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }
}

// ── PrincipalStore ────────────────────────────────────────────────────────────

impl PrincipalStore for SqliteStore {
    async fn create_principal(&self, api_key: &str, balance: i64) -> Result<Principal, sqlx::Error> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO principals (api_key, balance, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(api_key)
        .bind(balance)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(Principal {
            id: result.last_insert_rowid(),
            api_key: api_key.to_owned(),
            balance,
            created_at,
        })
    }

    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Principal>, sqlx::Error> {
        let row: Option<(i64, String, i64, String)> = sqlx::query_as(
            "SELECT id, api_key, balance, created_at FROM principals WHERE api_key = ?1",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(principal_from_row))
    }

    async fn get_principal(&self, id: i64) -> Result<Option<Principal>, sqlx::Error> {
        let row: Option<(i64, String, i64, String)> = sqlx::query_as(
            "SELECT id, api_key, balance, created_at FROM principals WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(principal_from_row))
    }

    async fn top_up(&self, id: i64, amount: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE principals SET balance = balance + ?1 WHERE id = ?2")
            .bind(amount)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn principal_from_row(row: (i64, String, i64, String)) -> Principal {
    let (id, api_key, balance, created_at) = row;
    Principal {
        id,
        api_key,
        balance,
        created_at: created_at.parse().unwrap_or_else(|e: chrono::ParseError| {
            warn!(principal = id, raw = %created_at, error = %e, "failed to parse principal created_at; using now");
            Utc::now()
        }),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite://:memory:")
            .await
            .expect("in-memory store should open")
    }

    async fn seeded_task(store: &SqliteStore) -> TaskRecord {
        let principal = store.create_principal("key-1", 100).await.unwrap();
        store
            .create_task(NewTask {
                principal_id: principal.id,
                app_id: "tts".to_owned(),
                start_time: Utc::now(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let store = store().await;
        let record = seeded_task(&store).await;
        assert_eq!(record.state, TaskState::Processing);

        let fetched = store.get_task(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, record.id);
        assert_eq!(fetched.app_id, "tts");
        assert_eq!(fetched.state, TaskState::Processing);
        assert!(fetched.result.is_empty());
    }

    #[tokio::test]
    async fn terminal_state_guard_drops_late_patches() {
        let store = store().await;
        let record = seeded_task(&store).await;

        store
            .update_task(
                record.id,
                TaskPatch {
                    state: Some(TaskState::Success),
                    used_points: Some(7),
                    result: Some(vec![serde_json::json!({ "url": "x" })]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store
            .update_task(
                record.id,
                TaskPatch {
                    state: Some(TaskState::Failed),
                    used_points: Some(999),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let current = store.get_task(record.id).await.unwrap().unwrap();
        assert_eq!(current.state, TaskState::Success);
        assert_eq!(current.used_points, 7);
        assert_eq!(current.result[0]["url"], "x");
    }

    #[tokio::test]
    async fn deduct_never_drives_balance_negative() {
        let store = store().await;
        let principal = store.create_principal("key-2", 10).await.unwrap();

        assert!(store.deduct(principal.id, 6).await.unwrap());
        assert!(!store.deduct(principal.id, 6).await.unwrap(), "only 4 left");

        let current = store.get_principal(principal.id).await.unwrap().unwrap();
        assert_eq!(current.balance, 4);
    }

    #[tokio::test]
    async fn affordability_for_unknown_principal_is_false() {
        let store = store().await;
        let a = store.is_affordable(404, 1).await.unwrap();
        assert!(!a.ok);
        assert_eq!(a.balance, 0);
    }

    #[tokio::test]
    async fn restart_recovery_fails_dangling_processing_tasks() {
        let store = store().await;
        let record = seeded_task(&store).await;

        let interrupted = store.interrupt_processing_tasks().await.unwrap();
        assert_eq!(interrupted, 1);

        let current = store.get_task(record.id).await.unwrap().unwrap();
        assert_eq!(current.state, TaskState::Failed);
        assert_eq!(current.error_infos[0].message, "interrupted by restart");

        // Already-terminal records are untouched by a second recovery pass.
        assert_eq!(store.interrupt_processing_tasks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_tasks_filters_by_principal() {
        let store = store().await;
        let p1 = store.create_principal("key-a", 0).await.unwrap();
        let p2 = store.create_principal("key-b", 0).await.unwrap();
        for principal_id in [p1.id, p1.id, p2.id] {
            store
                .create_task(NewTask {
                    principal_id,
                    app_id: "chat".to_owned(),
                    start_time: Utc::now(),
                })
                .await
                .unwrap();
        }

        assert_eq!(store.list_tasks(p1.id).await.unwrap().len(), 2);
        assert_eq!(store.list_tasks(p2.id).await.unwrap().len(), 1);
    }
}
