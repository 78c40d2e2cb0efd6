//! SqliteTaskStore - SQLite-backed TaskStore.
//!
//! Claims are a single `UPDATE ... WHERE id = (oldest pending) AND status =
//! 'pending' RETURNING ...` statement, so SQLite's write lock serialises
//! concurrent claimers and a lost race simply returns no row.
//!
//! `created_at` is stored as integer microseconds since the epoch so that
//! ordering by it is numeric.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use crate::domain::{
    FailureRecord, NewResult, NewTask, PayloadKind, ResultRecord, StatusCounts, Task, TaskId,
    TaskStatus,
};
use crate::error::StoreError;
use crate::ports::{Clock, SystemClock, TaskStore};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS failure_records (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    url             TEXT    NOT NULL UNIQUE,
    task_type       TEXT    NOT NULL,
    latest_reason   TEXT    NOT NULL,
    fail_count      INTEGER NOT NULL DEFAULT 1,
    updated_at      TEXT    NOT NULL DEFAULT (datetime('now'))
);

-- url is not unique: a failed URL may be queued again by hand
CREATE TABLE IF NOT EXISTS tasks (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    url                 TEXT    NOT NULL,
    task_type           TEXT    NOT NULL,
    status              TEXT    NOT NULL DEFAULT 'pending',
    source              TEXT,
    created_at          INTEGER NOT NULL,
    failure_record_id   INTEGER REFERENCES failure_records(id)
);

CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON tasks(status, created_at, id);
CREATE INDEX IF NOT EXISTS idx_tasks_url ON tasks(url);

CREATE TABLE IF NOT EXISTS results (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    url             TEXT    NOT NULL UNIQUE,
    task_type       TEXT    NOT NULL,
    payload         TEXT    NOT NULL,
    payload_kind    TEXT    NOT NULL,
    task_id         INTEGER NOT NULL,
    updated_at      TEXT    NOT NULL DEFAULT (datetime('now'))
);
"#;

const TASK_COLUMNS: &str = "id, url, task_type, status, source, created_at, failure_record_id";

#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteTaskStore {
    /// Open (creating if missing) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let store = Self::from_pool(pool).await?;
        tracing::info!(path = %path.display(), "task store opened");
        Ok(store)
    }

    /// Wrap an existing pool. The schema is applied if missing.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self {
            pool,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now_micros(&self) -> i64 {
        self.clock.now().timestamp_micros()
    }

    /// Explain why a conditional status update touched no row.
    async fn transition_error(&self, id: TaskId, to: TaskStatus) -> StoreError {
        let row = sqlx::query("SELECT status FROM tasks WHERE id = ?1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await;

        match row {
            Ok(Some(row)) => match decode_status(&row) {
                Ok(from) => StoreError::InvalidTransition { id, from, to },
                Err(err) => err,
            },
            Ok(None) => StoreError::NotFound(id),
            Err(err) => err.into(),
        }
    }
}

fn decode_status(row: &SqliteRow) -> Result<TaskStatus, StoreError> {
    let raw: String = row.try_get("status")?;
    raw.parse()
        .map_err(|e: crate::domain::UnknownStatus| StoreError::Corrupt(e.to_string()))
}

fn decode_task(row: &SqliteRow) -> Result<Task, StoreError> {
    let micros: i64 = row.try_get("created_at")?;
    let created_at = DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Corrupt(format!("created_at out of range: {micros}")))?;

    Ok(Task {
        id: TaskId::new(row.try_get("id")?),
        url: row.try_get("url")?,
        task_type: row.try_get::<String, _>("task_type")?.into(),
        status: decode_status(row)?,
        source: row.try_get("source")?,
        created_at,
        failure_record_id: row
            .try_get::<Option<i64>, _>("failure_record_id")?
            .map(Into::into),
    })
}

fn decode_failure(row: &SqliteRow) -> Result<FailureRecord, StoreError> {
    let fail_count: i64 = row.try_get("fail_count")?;
    Ok(FailureRecord {
        id: row.try_get::<i64, _>("id")?.into(),
        url: row.try_get("url")?,
        task_type: row.try_get::<String, _>("task_type")?.into(),
        latest_reason: row.try_get("latest_reason")?,
        fail_count: u32::try_from(fail_count)
            .map_err(|_| StoreError::Corrupt(format!("fail_count out of range: {fail_count}")))?,
    })
}

fn decode_result(row: &SqliteRow) -> Result<ResultRecord, StoreError> {
    let kind: String = row.try_get("payload_kind")?;
    Ok(ResultRecord {
        id: row.try_get::<i64, _>("id")?.into(),
        url: row.try_get("url")?,
        task_type: row.try_get::<String, _>("task_type")?.into(),
        payload: row.try_get("payload")?,
        payload_kind: kind.parse::<PayloadKind>().map_err(StoreError::Corrupt)?,
        task_id: TaskId::new(row.try_get("task_id")?),
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn claim_next(&self) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            "UPDATE tasks SET status = 'in_progress'
             WHERE id = (
                 SELECT id FROM tasks WHERE status = 'pending'
                 ORDER BY created_at, id LIMIT 1
             )
             AND status = 'pending'
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(decode_task).transpose()
    }

    async fn mark_completed(&self, id: TaskId) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE tasks SET status = 'completed' WHERE id = ?1 AND status = 'in_progress'",
        )
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.transition_error(id, TaskStatus::Completed).await);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: TaskId, reason: &str) -> Result<FailureRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        // write first so the transaction holds the write lock from the start
        let task = sqlx::query(
            "UPDATE tasks SET status = 'failed' WHERE id = ?1 AND status = 'in_progress'
             RETURNING url, task_type",
        )
        .bind(id.get())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(task) = task else {
            tx.rollback().await?;
            return Err(self.transition_error(id, TaskStatus::Failed).await);
        };
        let url: String = task.try_get("url")?;
        let task_type: String = task.try_get("task_type")?;

        let row = sqlx::query(
            "INSERT INTO failure_records (url, task_type, latest_reason, fail_count)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(url) DO UPDATE SET
                 task_type = excluded.task_type,
                 latest_reason = excluded.latest_reason,
                 fail_count = failure_records.fail_count + 1,
                 updated_at = datetime('now')
             RETURNING id, url, task_type, latest_reason, fail_count",
        )
        .bind(&url)
        .bind(&task_type)
        .bind(reason)
        .fetch_one(&mut *tx)
        .await?;
        let record = decode_failure(&row)?;

        sqlx::query("UPDATE tasks SET failure_record_id = ?1 WHERE id = ?2")
            .bind(record.id.get())
            .bind(id.get())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn release(&self, id: TaskId) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE tasks SET status = 'pending' WHERE id = ?1 AND status = 'in_progress'",
        )
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.transition_error(id, TaskStatus::Pending).await);
        }
        Ok(())
    }

    async fn has_pending_tasks(&self) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE status = 'pending') AS has_pending",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("has_pending")? != 0)
    }

    async fn add_task(&self, task: NewTask) -> Result<TaskId, StoreError> {
        let done = sqlx::query(
            "INSERT INTO tasks (url, task_type, status, source, created_at)
             VALUES (?1, ?2, 'pending', ?3, ?4)",
        )
        .bind(&task.url)
        .bind(task.task_type.as_str())
        .bind(&task.source)
        .bind(self.now_micros())
        .execute(&self.pool)
        .await?;
        Ok(TaskId::new(done.last_insert_rowid()))
    }

    async fn add_multiple_tasks(&self, tasks: Vec<NewTask>) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for task in &tasks {
            // earlier rows of this batch are visible inside the transaction
            let done = sqlx::query(
                "INSERT INTO tasks (url, task_type, status, source, created_at)
                 SELECT ?1, ?2, 'pending', ?3, ?4
                 WHERE NOT EXISTS (SELECT 1 FROM tasks WHERE url = ?1)",
            )
            .bind(&task.url)
            .bind(task.task_type.as_str())
            .bind(&task.source)
            .bind(self.now_micros())
            .execute(&mut *tx)
            .await?;
            inserted += done.rows_affected() as usize;
        }

        tx.commit().await?;
        tracing::debug!(requested = tasks.len(), inserted, "bulk insert");
        Ok(inserted)
    }

    async fn store_result(&self, result: NewResult) -> Result<ResultRecord, StoreError> {
        let row = sqlx::query(
            "INSERT INTO results (url, task_type, payload, payload_kind, task_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(url) DO UPDATE SET
                 task_type = excluded.task_type,
                 payload = excluded.payload,
                 payload_kind = excluded.payload_kind,
                 task_id = excluded.task_id,
                 updated_at = datetime('now')
             RETURNING id, url, task_type, payload, payload_kind, task_id",
        )
        .bind(&result.url)
        .bind(result.task_type.as_str())
        .bind(&result.payload)
        .bind(result.payload_kind.as_str())
        .bind(result.task_id.get())
        .fetch_one(&self.pool)
        .await?;
        decode_result(&row)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_task).transpose()
    }

    async fn failure_record(&self, url: &str) -> Result<Option<FailureRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, url, task_type, latest_reason, fail_count
             FROM failure_records WHERE url = ?1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_failure).transpose()
    }

    async fn result_for_url(&self, url: &str) -> Result<Option<ResultRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, url, task_type, payload, payload_kind, task_id
             FROM results WHERE url = ?1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_result).transpose()
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StatusCounts::default();
        for row in &rows {
            let n: i64 = row.try_get("n")?;
            counts.add(decode_status(row)?, n as usize);
        }
        Ok(counts)
    }
}
