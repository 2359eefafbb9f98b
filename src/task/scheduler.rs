//! Task scheduler: worker pool, run loop and external controls.
//!
//! One in-memory FIFO queue of task ids plus a set of running ids, behind a
//! single mutex. [`pump`](TaskScheduler::pump) fills worker slots up to the
//! mutable ceiling; every worker completion re-enters the pump. Workers own
//! the whole per-task flow: collision re-check, staging directory, adapter
//! invocation, commit, and the translation of adapter outcomes into terminal
//! task states.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::{error, info, instrument, warn};

use super::commit;
use super::item::{Task, TaskParams, TaskStatus};
use super::store::{StoreError, TaskStore};
use crate::comic::{BadTarget, Source, canonical_id};
use crate::config::{Policy, Storage};
use crate::fetch::Fetcher;
use crate::library::{Library, LibraryError};
use crate::progress::{ProgressReporter, ProgressSink};
use crate::source::{AdapterContext, SourceError, run_source};
use crate::stop::StopMode;

/// Message recorded when a canonical-id collision short-circuits a task.
pub const ALREADY_DOWNLOADED: &str = "already downloaded";

/// Cap applied to failure messages (debug chains can get long).
const MESSAGE_CAP: usize = 2000;

/// Scheduler-level errors, mapped to REST statuses by the control plane.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The canonical id already has a library row.
    #[error("already downloaded")]
    AlreadyDownloaded {
        /// The colliding canonical id.
        comic_id: String,
    },

    /// An active task for the same `(source, target)` exists.
    #[error("task already exists")]
    TaskExists,

    /// Unknown task id.
    #[error("task not found")]
    NotFound,

    /// `delete` was attempted on a running task.
    #[error("task is running")]
    TaskRunning,

    /// The requested control does not apply to the task's current state.
    #[error("cannot {op} task in state {from}")]
    InvalidTransition {
        /// The attempted operation.
        op: &'static str,
        /// The task's current status.
        from: &'static str,
    },

    /// The target cannot produce a canonical id.
    #[error(transparent)]
    BadTarget(#[from] BadTarget),

    /// Task table failure.
    #[error("task store error: {0}")]
    Store(sqlx::Error),

    /// Library table failure.
    #[error(transparent)]
    Library(#[from] LibraryError),

    /// Staging directory manipulation failed.
    #[error("staging io failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for SchedulerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => Self::NotFound,
            StoreError::Db(db) => Self::Store(db),
        }
    }
}

#[derive(Debug, Default)]
struct PumpState {
    queue: VecDeque<String>,
    running: HashSet<String>,
}

/// Worker pool over the task store.
///
/// Construct with [`TaskScheduler::new`], then call
/// [`recover_and_start`](Self::recover_and_start) once before accepting
/// REST traffic.
pub struct TaskScheduler {
    store: Arc<TaskStore>,
    library: Library,
    storage: Storage,
    policy: RwLock<Policy>,
    state: Mutex<PumpState>,
    task_debug: bool,
}

impl TaskScheduler {
    /// Creates a scheduler over explicit collaborators.
    ///
    /// Tests instantiate a fresh scheduler over a fresh storage directory;
    /// nothing here is process-global.
    #[must_use]
    pub fn new(
        store: Arc<TaskStore>,
        library: Library,
        storage: Storage,
        policy: Policy,
        task_debug: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            library,
            storage,
            policy: RwLock::new(policy),
            state: Mutex::new(PumpState::default()),
            task_debug,
        })
    }

    /// The underlying task store.
    #[must_use]
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// The storage layout.
    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Snapshot of the current policy record.
    #[must_use]
    pub fn policy(&self) -> Policy {
        let guard = match self.policy.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }

    /// Swaps the policy record; an increased ceiling resumes pumping
    /// immediately.
    pub fn set_policy(self: &Arc<Self>, policy: Policy) {
        {
            let mut guard = match self.policy.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = policy;
        }
        self.pump();
    }

    /// Boot sequence: recover persisted tasks, sweep orphan staging, start
    /// pumping.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] when recovery queries fail.
    #[instrument(skip(self))]
    pub async fn recover_and_start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let queued = self.store.recover_on_boot().await?;
        self.sweep_orphan_staging().await?;

        {
            let mut state = lock_state(&self.state);
            for task in &queued {
                state.queue.push_back(task.id.clone());
            }
        }
        if !queued.is_empty() {
            info!(count = queued.len(), "re-enqueued persisted tasks");
        }
        self.pump();
        Ok(())
    }

    /// Removes staging directories whose task row no longer exists.
    ///
    /// Rows in resumable states keep their staging; this only collects
    /// leftovers from deleted tasks and crashed cleanup paths.
    async fn sweep_orphan_staging(&self) -> Result<(), SchedulerError> {
        let known: HashSet<String> = self.store.all_ids().await?.into_iter().collect();
        let tasks_dir = self.storage.tasks_dir();
        let mut entries = match tokio::fs::read_dir(&tasks_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !known.contains(&name) {
                warn!(staging = %name, "removing orphan staging directory");
                let _ = tokio::fs::remove_dir_all(entry.path()).await;
            }
        }
        Ok(())
    }

    // ---- create ---------------------------------------------------------

    /// Creates a download task for `(source, target)`.
    ///
    /// Rejects targets that already have a library row and pairs that
    /// already have an active (queued/running/paused) task.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyDownloaded`],
    /// [`SchedulerError::TaskExists`], [`SchedulerError::BadTarget`] or a
    /// persistence error.
    #[instrument(skip(self, params), fields(source = %source, target = %target))]
    pub async fn create_download_task(
        self: &Arc<Self>,
        source: Source,
        target: &str,
        params: TaskParams,
    ) -> Result<Task, SchedulerError> {
        let comic_id = canonical_id(source, target)?;

        if self.library.exists(&comic_id).await? {
            return Err(SchedulerError::AlreadyDownloaded { comic_id });
        }
        if self.store.find_active(source, target).await?.is_some() {
            return Err(SchedulerError::TaskExists);
        }

        let task = self.store.insert(source, target, &params).await?;
        {
            let mut state = lock_state(&self.state);
            state.queue.push_back(task.id.clone());
        }
        self.pump();
        Ok(task)
    }

    // ---- pump / workers -------------------------------------------------

    /// Fills free worker slots from the queue.
    pub fn pump(self: &Arc<Self>) {
        loop {
            let id = {
                let max = self.policy().max_concurrent();
                let mut state = lock_state(&self.state);
                if state.running.len() >= max {
                    return;
                }
                let Some(id) = state.queue.pop_front() else {
                    return;
                };
                state.running.insert(id.clone());
                id
            };

            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_task_guarded(id).await;
            });
        }
    }

    async fn run_task_guarded(self: Arc<Self>, id: String) {
        if let Err(error) = self.run_task(&id).await {
            // Persistence failures inside the worker: the row keeps whatever
            // state the last successful write left.
            error!(task = %id, %error, "worker aborted");
        }

        {
            let mut state = lock_state(&self.state);
            state.running.remove(&id);
        }
        self.store.remove_token(&id);
        self.pump();
    }

    #[instrument(skip(self), fields(task = %id))]
    async fn run_task(&self, id: &str) -> Result<(), SchedulerError> {
        // Token first: a pause/cancel racing this startup either signals the
        // token (we observe it at the first suspension point) or rewrites the
        // row before the status check below.
        let token = self.store.register_token(id);

        let Some(task) = self.store.try_get(id).await? else {
            return Ok(());
        };
        if task.status() != TaskStatus::Queued {
            return Ok(());
        }

        let Some(source) = task.source() else {
            self.store
                .mark_finished(id, TaskStatus::Failed, Some("unknown source"), None, false)
                .await?;
            return Ok(());
        };

        // Re-check the collision: a competing commit may have happened while
        // this task sat in the queue.
        let comic_id = match canonical_id(source, &task.target) {
            Ok(comic_id) => comic_id,
            Err(bad) => {
                let message = format!("download failed: {bad}");
                self.store
                    .mark_finished(id, TaskStatus::Failed, Some(&message), None, false)
                    .await?;
                return Ok(());
            }
        };
        if self.library.exists(&comic_id).await? {
            self.store
                .mark_finished(
                    id,
                    TaskStatus::Succeeded,
                    Some(ALREADY_DOWNLOADED),
                    Some(&comic_id),
                    true,
                )
                .await?;
            return Ok(());
        }

        self.store.mark_running(id).await?;
        info!(source = %source, target = %task.target, "task started");

        let work_dir = self.storage.task_dir(id);
        tokio::fs::create_dir_all(&work_dir).await?;

        let auth = self.load_auth(source).await?;
        let params = task.params();
        let policy = self.policy();
        let progress = Arc::new(ProgressReporter::new(
            id,
            Arc::clone(&self.store) as Arc<dyn ProgressSink>,
        ));

        let ctx = AdapterContext {
            work_dir: work_dir.clone(),
            auth,
            target: task.target.clone(),
            params,
            progress,
            stop: token,
            fetcher: Fetcher::new(),
            file_retries: policy.file_retries(source),
            file_concurrent: policy.file_concurrent(source),
        };

        let outcome = run_source(source, &ctx).await;
        self.finish_task(id, source, &work_dir, outcome).await
    }

    async fn finish_task(
        &self,
        id: &str,
        source: Source,
        work_dir: &std::path::Path,
        outcome: Result<crate::comic::DownloadedComic, SourceError>,
    ) -> Result<(), SchedulerError> {
        match outcome {
            Ok(comic) => {
                match commit::publish(&self.library, &self.storage, work_dir, &comic).await {
                    Ok(committed) => {
                        info!(task = %id, comic = %comic.id, size = committed.size, "task succeeded");
                        self.store
                            .mark_finished(id, TaskStatus::Succeeded, None, Some(&comic.id), true)
                            .await?;
                    }
                    Err(error) => {
                        let message = self.failure_message(&error);
                        warn!(task = %id, %error, "commit failed");
                        self.store
                            .mark_finished(id, TaskStatus::Failed, Some(&message), None, false)
                            .await?;
                    }
                }
            }
            Err(error) => match error.stopped() {
                Some(StopMode::Pause) => {
                    info!(task = %id, "task paused");
                    self.store
                        .mark_finished(id, TaskStatus::Paused, None, None, false)
                        .await?;
                }
                Some(StopMode::Cancel) => {
                    info!(task = %id, "task canceled");
                    remove_staging(work_dir).await;
                    self.store
                        .mark_finished(id, TaskStatus::Canceled, None, None, false)
                        .await?;
                }
                None => {
                    let message = self.failure_message(&error);
                    warn!(task = %id, source = %source, %error, "task failed");
                    self.store
                        .mark_finished(id, TaskStatus::Failed, Some(&message), None, false)
                        .await?;
                }
            },
        }
        Ok(())
    }

    fn failure_message(&self, error: &(dyn std::error::Error)) -> String {
        let mut message = format!("download failed: {error}");
        if self.task_debug {
            let mut cause = error.source();
            while let Some(step) = cause {
                message.push_str(&format!(" | caused by: {step}"));
                cause = step.source();
            }
        }
        if message.len() > MESSAGE_CAP {
            message.truncate(MESSAGE_CAP);
        }
        message
    }

    async fn load_auth(
        &self,
        source: Source,
    ) -> Result<serde_json::Map<String, serde_json::Value>, SchedulerError> {
        let Some((payload, _)) = self.store.get_auth(source).await? else {
            return Ok(serde_json::Map::new());
        };
        match serde_json::from_str::<serde_json::Value>(&payload) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            _ => Ok(serde_json::Map::new()),
        }
    }

    // ---- external controls ---------------------------------------------

    /// Pauses a queued or running task.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTransition`] for other states.
    pub async fn pause(&self, id: &str) -> Result<(), SchedulerError> {
        let task = self.store.get(id).await?;
        match task.status() {
            TaskStatus::Queued => {
                self.drop_from_queue(id);
                // A worker may have popped the id already; its token wins.
                if !self.store.signal(id, StopMode::Pause) {
                    self.store
                        .mark_finished(id, TaskStatus::Paused, None, None, false)
                        .await?;
                }
                Ok(())
            }
            TaskStatus::Running => {
                if !self.store.signal(id, StopMode::Pause) {
                    // Worker already gone; leave the row to its writer.
                    warn!(task = %id, "pause requested but no worker token found");
                }
                Ok(())
            }
            other => Err(SchedulerError::InvalidTransition {
                op: "pause",
                from: other.as_str(),
            }),
        }
    }

    /// Re-queues a paused or failed task, keeping its message.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTransition`] for other states.
    pub async fn resume(self: &Arc<Self>, id: &str) -> Result<(), SchedulerError> {
        let task = self.store.get(id).await?;
        match task.status() {
            TaskStatus::Paused | TaskStatus::Failed => {
                self.store.mark_queued(id, false).await?;
                self.enqueue(id);
                Ok(())
            }
            other => Err(SchedulerError::InvalidTransition {
                op: "resume",
                from: other.as_str(),
            }),
        }
    }

    /// Re-queues a failed, canceled or paused task, clearing its message.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTransition`] for other states.
    pub async fn retry(self: &Arc<Self>, id: &str) -> Result<(), SchedulerError> {
        let task = self.store.get(id).await?;
        match task.status() {
            TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::Paused => {
                self.store.mark_queued(id, true).await?;
                self.enqueue(id);
                Ok(())
            }
            other => Err(SchedulerError::InvalidTransition {
                op: "retry",
                from: other.as_str(),
            }),
        }
    }

    /// Cancels a queued, running, paused or failed task.
    ///
    /// Staging is torn down here for parked tasks, or by the worker when one
    /// is still attached.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTransition`] for other states.
    pub async fn cancel(&self, id: &str) -> Result<(), SchedulerError> {
        let task = self.store.get(id).await?;
        match task.status() {
            TaskStatus::Queued => {
                self.drop_from_queue(id);
                if !self.store.signal(id, StopMode::Cancel) {
                    remove_staging(&self.storage.task_dir(id)).await;
                    self.store
                        .mark_finished(id, TaskStatus::Canceled, None, None, false)
                        .await?;
                }
                Ok(())
            }
            TaskStatus::Running => {
                if !self.store.signal(id, StopMode::Cancel) {
                    warn!(task = %id, "cancel requested but no worker token found");
                }
                Ok(())
            }
            TaskStatus::Paused | TaskStatus::Failed => {
                remove_staging(&self.storage.task_dir(id)).await;
                self.store
                    .mark_finished(id, TaskStatus::Canceled, None, None, false)
                    .await?;
                Ok(())
            }
            other => Err(SchedulerError::InvalidTransition {
                op: "cancel",
                from: other.as_str(),
            }),
        }
    }

    /// Deletes a non-running task: row and staging both go away.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TaskRunning`] while a worker owns the task.
    pub async fn delete(&self, id: &str) -> Result<(), SchedulerError> {
        let task = self.store.get(id).await?;
        if task.status() == TaskStatus::Running {
            return Err(SchedulerError::TaskRunning);
        }
        self.drop_from_queue(id);
        self.store.delete(id).await?;
        remove_staging(&self.storage.task_dir(id)).await;
        Ok(())
    }

    fn enqueue(self: &Arc<Self>, id: &str) {
        {
            let mut state = lock_state(&self.state);
            state.queue.push_back(id.to_string());
        }
        self.pump();
    }

    fn drop_from_queue(&self, id: &str) {
        let mut state = lock_state(&self.state);
        state.queue.retain(|queued| queued != id);
    }
}

fn lock_state(state: &Mutex<PumpState>) -> std::sync::MutexGuard<'_, PumpState> {
    // Never held across an await point.
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn remove_staging(dir: &std::path::Path) {
    if let Err(error) = tokio::fs::remove_dir_all(dir).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), %error, "failed to remove staging directory");
        }
    }
}
