//! Error types for the HTTP fetcher.

use thiserror::Error;

use crate::stop::{StopMode, Stopped};

/// Maximum length of a body snippet carried inside error messages.
pub const SNIPPET_MAX_CHARS: usize = 240;

/// Errors produced by [`Fetcher`](super::Fetcher) operations.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The URL could not be parsed. Never retried.
    #[error("invalid url {url}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Parse failure detail.
        reason: String,
    },

    /// The URL scheme is not http/https. Never retried.
    #[error("unsupported scheme '{scheme}' in {url}")]
    Scheme {
        /// The offending URL.
        url: String,
        /// The rejected scheme.
        scheme: String,
    },

    /// The server answered with a non-success status.
    ///
    /// Statuses in {408, 409, 425, 429} and >= 500 are retried; the rest are
    /// surfaced immediately.
    #[error("bad status: {status} for {url}{}", fmt_snippet(.snippet))]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Whitespace-collapsed body snippet (may be empty).
        snippet: String,
    },

    /// Transport-level failure (DNS, connect, timeout, reset). Retried.
    #[error("network error for {url}: {source}")]
    Network {
        /// Requested URL.
        url: String,
        /// Underlying reqwest error.
        source: reqwest::Error,
    },

    /// Declared or streamed size exceeded the caller's byte cap.
    #[error("response for {url} exceeds {limit} bytes")]
    TooLarge {
        /// Requested URL.
        url: String,
        /// The configured cap.
        limit: u64,
    },

    /// Local filesystem failure while persisting the download.
    #[error("write failed for {url}: {source}")]
    Io {
        /// Requested URL.
        url: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A JSON endpoint returned a body that does not parse as JSON.
    #[error("expected JSON from {url}, got: {snippet}")]
    NotJson {
        /// Requested URL.
        url: String,
        /// Whitespace-collapsed body snippet.
        snippet: String,
    },

    /// Cooperative stop observed mid-transfer. Not an error; never retried.
    #[error(transparent)]
    Stopped(#[from] Stopped),
}

impl FetchError {
    /// Returns the stop mode when this value is a stop signal.
    #[must_use]
    pub fn stopped(&self) -> Option<StopMode> {
        match self {
            Self::Stopped(Stopped(mode)) => Some(*mode),
            _ => None,
        }
    }

    /// Whether another attempt may succeed.
    ///
    /// Network failures and retryable statuses qualify; argument errors,
    /// byte-cap violations, local I/O failures and stop signals do not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Status { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

/// Whether an HTTP status is worth another attempt.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 425 | 429) || status >= 500
}

/// Collapses whitespace runs and truncates to [`SNIPPET_MAX_CHARS`] so an
/// upstream body can be embedded in a one-line task message.
#[must_use]
pub fn body_snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let mut out = String::with_capacity(SNIPPET_MAX_CHARS);
    let mut last_was_space = true;
    for ch in text.chars() {
        let ch = if ch.is_whitespace() { ' ' } else { ch };
        if ch == ' ' && last_was_space {
            continue;
        }
        last_was_space = ch == ' ';
        out.push(ch);
        if out.chars().count() >= SNIPPET_MAX_CHARS {
            break;
        }
    }
    out.trim_end().to_string()
}

fn fmt_snippet(snippet: &str) -> String {
    if snippet.is_empty() {
        String::new()
    } else {
        format!(": {snippet}")
    }
}
