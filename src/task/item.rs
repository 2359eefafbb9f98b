//! Task record and status definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::comic::Source;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the scheduler queue.
    Queued,
    /// Owned by a worker in this process.
    Running,
    /// Suspended; staging kept for resume.
    Paused,
    /// Committed to the library.
    Succeeded,
    /// Terminal failure; staging kept so retry can resume.
    Failed,
    /// Canceled; staging removed.
    Canceled,
}

impl TaskStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Whether this status is sticky (only `retry` leaves it).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Whether a task in this status blocks a duplicate `(source, target)`
    /// submission.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Paused)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("invalid task status: {s}")),
        }
    }
}

/// Client-supplied task parameters.
///
/// `eps` selects chapters by zero-based display index; empty or missing
/// means "all". Unknown keys are preserved verbatim so clients can stash
/// hints (title, cover URL) without a schema change here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskParams {
    /// Ordered set of selected episode display indices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eps: Option<Vec<u32>>,

    /// Client display-title hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Client cover-URL hint.
    #[serde(default, rename = "coverUrl", skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,

    /// Anything else the client sent.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskParams {
    /// Episode selection with duplicates removed, first occurrence wins.
    /// `None` means "all episodes".
    #[must_use]
    pub fn selected_eps(&self) -> Option<Vec<u32>> {
        let eps = self.eps.as_ref()?;
        if eps.is_empty() {
            return None;
        }
        let mut seen = std::collections::HashSet::new();
        Some(
            eps.iter()
                .copied()
                .filter(|ep| seen.insert(*ep))
                .collect(),
        )
    }
}

/// One row of the `tasks` table.
#[derive(Debug, Clone, FromRow)]
pub struct Task {
    /// Opaque random id (24 URL-safe chars).
    pub id: String,
    /// Task kind; currently always `download`.
    pub task_type: String,
    /// Upstream source name (stored as text, parsed via `source()`).
    #[sqlx(rename = "source")]
    pub source_str: String,
    /// Source-specific target (comic id, gallery URL, ...).
    pub target: String,
    /// Raw params JSON (parsed via `params()`).
    pub params: String,
    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Completed work units.
    pub progress: i64,
    /// Total work units; 0 = not yet known.
    pub total: i64,
    /// Last actionable message, if any.
    pub message: Option<String>,
    /// Canonical comic id, set when the task succeeds.
    pub comic_id: Option<String>,
    /// Creation time, epoch millis.
    pub created_at: i64,
    /// Last mutation time, epoch millis.
    pub updated_at: i64,
}

impl Task {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Failed` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.status_str.parse().unwrap_or(TaskStatus::Failed)
    }

    /// Returns the parsed source.
    ///
    /// The column carries a CHECK constraint, so this only fails on a
    /// hand-edited database.
    #[must_use]
    pub fn source(&self) -> Option<Source> {
        self.source_str.parse().ok()
    }

    /// Parses the params JSON. Invalid JSON yields the default params.
    #[must_use]
    pub fn params(&self) -> TaskParams {
        serde_json::from_str(&self.params).unwrap_or_default()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task {{ id: {}, source: {}, target: {}, status: {} }}",
            self.id,
            self.source_str,
            self.target,
            self.status()
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn task_with(status: &str) -> Task {
        Task {
            id: "abc".to_string(),
            task_type: "download".to_string(),
            source_str: "nhentai".to_string(),
            target: "177013".to_string(),
            params: "{}".to_string(),
            status_str: status.to_string(),
            progress: 0,
            total: 0,
            message: None,
            comic_id: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_and_active_partitions() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());

        assert!(TaskStatus::Queued.is_active());
        assert!(TaskStatus::Running.is_active());
        assert!(TaskStatus::Paused.is_active());
        assert!(!TaskStatus::Failed.is_active());
    }

    #[test]
    fn test_task_parses_status_and_source() {
        let task = task_with("running");
        assert_eq!(task.status(), TaskStatus::Running);
        assert_eq!(task.source(), Some(Source::Nhentai));
    }

    #[test]
    fn test_task_status_fallback_on_invalid() {
        assert_eq!(task_with("garbage").status(), TaskStatus::Failed);
    }

    #[test]
    fn test_params_eps_dedupe_preserves_order() {
        let params: TaskParams = serde_json::from_str(r#"{"eps":[3,1,3,2,1]}"#).unwrap();
        assert_eq!(params.selected_eps().unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn test_params_empty_eps_means_all() {
        let params: TaskParams = serde_json::from_str(r#"{"eps":[]}"#).unwrap();
        assert!(params.selected_eps().is_none());
    }

    #[test]
    fn test_params_preserve_unknown_keys() {
        let params: TaskParams =
            serde_json::from_str(r#"{"coverUrl":"http://x/c.jpg","quality":"hq"}"#).unwrap();
        assert_eq!(params.cover_url.as_deref(), Some("http://x/c.jpg"));
        assert_eq!(
            params.extra.get("quality"),
            Some(&serde_json::Value::String("hq".into()))
        );
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("quality"));
    }
}
