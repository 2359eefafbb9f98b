//! Rate-limited progress reporting for one running task.
//!
//! The reporter keeps the authoritative in-memory `progress`/`total`/
//! `message` for a task and writes them through to the task row. Writes are
//! throttled to one per [`WRITE_INTERVAL`] — progress updates are the
//! dominant database traffic — except for total and message changes, which
//! always go through immediately.
//!
//! Persistence is best effort: a failed write is logged and the next update
//! retries; the scheduler writes the authoritative terminal state itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::warn;

/// Minimum spacing between throttled writes.
pub const WRITE_INTERVAL: Duration = Duration::from_millis(500);

/// Write-through destination for progress snapshots (the task store).
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Persists the current snapshot onto the task row.
    ///
    /// # Errors
    ///
    /// Returns the underlying database error; the reporter logs and
    /// continues.
    async fn persist_progress(
        &self,
        task_id: &str,
        progress: u64,
        total: u64,
        message: Option<String>,
    ) -> Result<(), sqlx::Error>;
}

/// Per-task progress reporter.
///
/// Cheap to share: fan-out jobs clone the `Arc` and call
/// [`advance`](Self::advance) concurrently; writes are serialized through an
/// internal lock so at most one writer touches the task row.
pub struct ProgressReporter {
    task_id: String,
    sink: Arc<dyn ProgressSink>,
    progress: AtomicU64,
    total: AtomicU64,
    message: std::sync::Mutex<Option<String>>,
    last_write: tokio::sync::Mutex<Option<Instant>>,
}

impl ProgressReporter {
    /// Creates a reporter for `task_id` writing through `sink`.
    #[must_use]
    pub fn new(task_id: impl Into<String>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            task_id: task_id.into(),
            sink,
            progress: AtomicU64::new(0),
            total: AtomicU64::new(0),
            message: std::sync::Mutex::new(None),
            last_write: tokio::sync::Mutex::new(None),
        }
    }

    /// Current progress value.
    #[must_use]
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    /// Current total (0 = unknown).
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Sets the total work-unit count and writes through immediately.
    pub async fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Release);
        self.write(true).await;
    }

    /// Adds `delta` completed units; the write-through is throttled.
    pub async fn advance(&self, delta: u64) {
        self.progress.fetch_add(delta, Ordering::AcqRel);
        self.write(false).await;
    }

    /// Raises progress to at least `floor` (resume support) and writes
    /// through immediately.
    pub async fn ensure_at_least(&self, floor: u64) {
        self.progress.fetch_max(floor, Ordering::AcqRel);
        self.write(true).await;
    }

    /// Replaces the task message and writes through immediately.
    pub async fn set_message(&self, message: impl Into<String>) {
        if let Ok(mut slot) = self.message.lock() {
            *slot = Some(message.into());
        }
        self.write(true).await;
    }

    async fn write(&self, forced: bool) {
        let mut last = self.last_write.lock().await;
        if !forced {
            if let Some(at) = *last {
                if at.elapsed() < WRITE_INTERVAL {
                    return;
                }
            }
        }

        let message = self.message.lock().ok().and_then(|m| m.clone());
        let result = self
            .sink
            .persist_progress(&self.task_id, self.progress(), self.total(), message)
            .await;
        match result {
            Ok(()) => *last = Some(Instant::now()),
            Err(error) => warn!(task = %self.task_id, %error, "progress write failed"),
        }
    }
}
