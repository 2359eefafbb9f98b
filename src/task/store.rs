//! Durable task table plus the process-local stop-token registry.
//!
//! The store owns every read and write of the `tasks` table. Stop tokens
//! exist only in memory: one per running task, registered when a worker
//! picks the task up and dropped when it finishes. Losing them on process
//! death is what boot recovery compensates for.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use rand::distributions::Alphanumeric;
use thiserror::Error;
use tracing::{info, instrument};

use super::item::{Task, TaskParams, TaskStatus};
use crate::comic::Source;
use crate::db::{Database, now_millis};
use crate::progress::ProgressSink;
use crate::stop::{StopMode, StopToken};

/// Length of generated task ids (alphanumeric, URL-safe).
const TASK_ID_LEN: usize = 24;

/// Task persistence errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("task query failed: {0}")]
    Db(#[from] sqlx::Error),

    /// No task with the given id.
    #[error("task not found")]
    NotFound,
}

/// Repository over the `tasks` table + the in-memory stop-token map.
#[derive(Debug)]
pub struct TaskStore {
    db: Database,
    tokens: DashMap<String, StopToken>,
}

impl TaskStore {
    /// Creates a store over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            tokens: DashMap::new(),
        }
    }

    /// Inserts a new `queued` download task and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on insert failure.
    #[instrument(skip(self, params), fields(source = %source, target = %target))]
    pub async fn insert(
        &self,
        source: Source,
        target: &str,
        params: &TaskParams,
    ) -> Result<Task, StoreError> {
        let id = new_task_id();
        let now = now_millis();
        let params_json = serde_json::to_string(params).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            "INSERT INTO tasks (id, task_type, source, target, params, status, created_at, updated_at) \
             VALUES (?, 'download', ?, ?, ?, 'queued', ?, ?)",
        )
        .bind(&id)
        .bind(source.as_str())
        .bind(target)
        .bind(&params_json)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        info!(task = %id, "task created");
        self.get(&id).await
    }

    /// Fetches one task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id.
    pub async fn get(&self, id: &str) -> Result<Task, StoreError> {
        self.try_get(id).await?.ok_or(StoreError::NotFound)
    }

    /// Fetches one task, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub async fn try_get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let task = sqlx::query_as::<_, Task>(
            "SELECT id, task_type, source, target, params, status, progress, total, \
                    message, comic_id, created_at, updated_at \
             FROM tasks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(task)
    }

    /// Lists tasks, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub async fn list(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
        let tasks = sqlx::query_as::<_, Task>(
            "SELECT id, task_type, source, target, params, status, progress, total, \
                    message, comic_id, created_at, updated_at \
             FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(tasks)
    }

    /// Returns the blocking task for `(source, target)`, if any task for the
    /// pair is queued, running or paused.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub async fn find_active(
        &self,
        source: Source,
        target: &str,
    ) -> Result<Option<Task>, StoreError> {
        let task = sqlx::query_as::<_, Task>(
            "SELECT id, task_type, source, target, params, status, progress, total, \
                    message, comic_id, created_at, updated_at \
             FROM tasks WHERE source = ? AND target = ? \
               AND status IN ('queued', 'running', 'paused') LIMIT 1",
        )
        .bind(source.as_str())
        .bind(target)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(task)
    }

    /// Moves a task to `running`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub async fn mark_running(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET status = 'running', updated_at = ? WHERE id = ?")
            .bind(now_millis())
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Moves a task back to `queued`, optionally clearing the message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub async fn mark_queued(&self, id: &str, clear_message: bool) -> Result<(), StoreError> {
        if clear_message {
            sqlx::query(
                "UPDATE tasks SET status = 'queued', message = NULL, updated_at = ? WHERE id = ?",
            )
            .bind(now_millis())
            .bind(id)
            .execute(self.db.pool())
            .await?;
        } else {
            sqlx::query("UPDATE tasks SET status = 'queued', updated_at = ? WHERE id = ?")
                .bind(now_millis())
                .bind(id)
                .execute(self.db.pool())
                .await?;
        }
        Ok(())
    }

    /// Writes a terminal (or paused) state in one statement.
    ///
    /// `progress_to_total` additionally snaps `progress = total`, used when
    /// a task succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub async fn mark_finished(
        &self,
        id: &str,
        status: TaskStatus,
        message: Option<&str>,
        comic_id: Option<&str>,
        progress_to_total: bool,
    ) -> Result<(), StoreError> {
        let progress_sql = if progress_to_total {
            ", progress = total"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE tasks SET status = ?, message = ?, \
             comic_id = COALESCE(?, comic_id), updated_at = ?{progress_sql} WHERE id = ?"
        );
        sqlx::query(&sql)
            .bind(status.as_str())
            .bind(message)
            .bind(comic_id)
            .bind(now_millis())
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Deletes a task row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Boot recovery, run once before the listener binds.
    ///
    /// Rewrites every `running` row to `failed` / "server restarted" (their
    /// stop tokens died with the previous process) and returns the `queued`
    /// rows in `created_at` ascending order for re-enqueueing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    #[instrument(skip(self))]
    pub async fn recover_on_boot(&self) -> Result<Vec<Task>, StoreError> {
        let interrupted = sqlx::query(
            "UPDATE tasks SET status = 'failed', message = 'server restarted', updated_at = ? \
             WHERE status = 'running'",
        )
        .bind(now_millis())
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if interrupted > 0 {
            info!(interrupted, "rewrote interrupted tasks to failed");
        }

        let queued = sqlx::query_as::<_, Task>(
            "SELECT id, task_type, source, target, params, status, progress, total, \
                    message, comic_id, created_at, updated_at \
             FROM tasks WHERE status = 'queued' ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(queued)
    }

    /// Ids of every task row, used by the boot staging sweep.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub async fn all_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM tasks")
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    // ---- auth sessions --------------------------------------------------

    /// Stores an auth blob for a source, verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on write failure.
    pub async fn put_auth(&self, source: Source, payload: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO auth_sessions (source, payload, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(source) DO UPDATE SET payload = excluded.payload, \
             updated_at = excluded.updated_at",
        )
        .bind(source.as_str())
        .bind(payload)
        .bind(now_millis())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Reads a source's auth blob and its update time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] on query failure.
    pub async fn get_auth(&self, source: Source) -> Result<Option<(String, i64)>, StoreError> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT payload, updated_at FROM auth_sessions WHERE source = ?")
                .bind(source.as_str())
                .fetch_optional(self.db.pool())
                .await?;
        Ok(row)
    }

    // ---- stop-token registry -------------------------------------------

    /// Registers a fresh stop token for a task about to run.
    ///
    /// Any stale token from a previous run is replaced.
    #[must_use]
    pub fn register_token(&self, id: &str) -> StopToken {
        let token = StopToken::new();
        self.tokens.insert(id.to_string(), token.clone());
        token
    }

    /// Signals the running task's token. Returns `false` when no token is
    /// registered (the task is not running in this process).
    pub fn signal(&self, id: &str, mode: StopMode) -> bool {
        match self.tokens.get(id) {
            Some(token) => {
                token.signal(mode);
                true
            }
            None => false,
        }
    }

    /// Drops the token when the worker exits.
    pub fn remove_token(&self, id: &str) {
        self.tokens.remove(id);
    }
}

#[async_trait]
impl ProgressSink for TaskStore {
    async fn persist_progress(
        &self,
        task_id: &str,
        progress: u64,
        total: u64,
        message: Option<String>,
    ) -> Result<(), sqlx::Error> {
        #[allow(clippy::cast_possible_wrap)]
        sqlx::query(
            "UPDATE tasks SET progress = ?, total = ?, message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(progress as i64)
        .bind(total as i64)
        .bind(message)
        .bind(now_millis())
        .bind(task_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}

/// Generates a 24-char alphanumeric task id.
fn new_task_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TASK_ID_LEN)
        .map(char::from)
        .collect()
}
