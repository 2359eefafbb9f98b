//! Cooperative per-task stop signalling.
//!
//! A [`StopToken`] is attached to one running task and carries a single
//! one-shot mode cell: `none`, `pause` or `cancel`. Workers poll the token at
//! every suspension point (between HTTP round trips, between fan-out jobs);
//! a positive observation unwinds the call stack with [`Stopped`], which is
//! recovered by the scheduler and never treated as an ordinary error.
//!
//! Tokens live only in process memory. A process death drops every token,
//! which is what makes boot recovery rewrite `running` rows to `failed`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

const MODE_NONE: u8 = 0;
const MODE_PAUSE: u8 = 1;
const MODE_CANCEL: u8 = 2;

/// Requested stop mode for a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Suspend the task, keep its staging directory for resume.
    Pause,
    /// Abort the task and tear down its staging directory.
    Cancel,
}

impl StopMode {
    /// Returns the canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Cancel => "cancel",
        }
    }
}

impl fmt::Display for StopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Distinguished unwind signal raised when a stop request is observed.
///
/// This is carried through the error channel but is not an error: the
/// scheduler maps it to the `paused` or `canceled` terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("task stopped ({0})")]
pub struct Stopped(pub StopMode);

/// One-shot cooperative cancellation primitive shared by all jobs of a task.
///
/// Cloning is cheap; clones observe the same cell. Only the first
/// [`signal`](Self::signal) wins: the mode never transitions back and never
/// changes once set.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    mode: Arc<AtomicU8>,
}

impl StopToken {
    /// Creates a token in the `none` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop. Returns `true` if this call set the mode,
    /// `false` if a mode was already set (the call is then a no-op).
    pub fn signal(&self, mode: StopMode) -> bool {
        let raw = match mode {
            StopMode::Pause => MODE_PAUSE,
            StopMode::Cancel => MODE_CANCEL,
        };
        self.mode
            .compare_exchange(MODE_NONE, raw, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns the currently requested mode, if any. O(1).
    #[must_use]
    pub fn mode(&self) -> Option<StopMode> {
        match self.mode.load(Ordering::Acquire) {
            MODE_PAUSE => Some(StopMode::Pause),
            MODE_CANCEL => Some(StopMode::Cancel),
            _ => None,
        }
    }

    /// Polls the token, unwinding with [`Stopped`] when a stop was requested.
    ///
    /// # Errors
    ///
    /// Returns `Stopped(mode)` once a stop has been signalled.
    pub fn check(&self) -> Result<(), Stopped> {
        match self.mode() {
            None => Ok(()),
            Some(mode) => Err(Stopped(mode)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_is_clear() {
        let token = StopToken::new();
        assert_eq!(token.mode(), None);
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_first_signal_wins() {
        let token = StopToken::new();
        assert!(token.signal(StopMode::Pause));
        assert!(!token.signal(StopMode::Cancel), "second signal must lose");
        assert_eq!(token.mode(), Some(StopMode::Pause));
    }

    #[test]
    fn test_signal_is_idempotent() {
        let token = StopToken::new();
        assert!(token.signal(StopMode::Cancel));
        assert!(!token.signal(StopMode::Cancel));
        assert_eq!(token.mode(), Some(StopMode::Cancel));
    }

    #[test]
    fn test_check_unwinds_with_mode() {
        let token = StopToken::new();
        token.signal(StopMode::Cancel);
        assert_eq!(token.check(), Err(Stopped(StopMode::Cancel)));
    }

    #[test]
    fn test_clones_share_the_cell() {
        let token = StopToken::new();
        let observer = token.clone();
        token.signal(StopMode::Pause);
        assert_eq!(observer.mode(), Some(StopMode::Pause));
    }

    #[test]
    fn test_stopped_display_names_mode() {
        assert_eq!(Stopped(StopMode::Pause).to_string(), "task stopped (pause)");
        assert_eq!(
            Stopped(StopMode::Cancel).to_string(),
            "task stopped (cancel)"
        );
    }
}
