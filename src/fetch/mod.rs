//! Bounded HTTP fetching with retry and stop-token awareness.
//!
//! This module provides the [`Fetcher`], the single HTTP entry point for all
//! download pipelines. It produces either a file on disk
//! ([`download_to_file`](Fetcher::download_to_file)) or an in-memory byte
//! buffer ([`get_bytes_with_retry`](Fetcher::get_bytes_with_retry)), with:
//!
//! - http/https scheme enforcement and a redirect ceiling,
//! - a byte cap checked against `Content-Length` and again mid-stream,
//! - per-request timeouts (short for HTML/JSON, long for images),
//! - retry on network errors and retryable statuses with `400·2^n` ms
//!   backoff,
//! - stop-token polling before the request and between streamed chunks.
//!
//! One `Fetcher` (and therefore one connection pool) is created per task and
//! shared by all of that task's fan-out jobs, so dropping it on unwind tears
//! down the task's connections without affecting other tasks.

mod error;

pub use error::{FetchError, SNIPPET_MAX_CHARS, body_snippet, is_retryable_status};

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::redirect::Policy;
use reqwest::{Client, ClientBuilder, Method};
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::stop::StopToken;

/// TCP connect timeout, all request kinds.
pub const CONNECT_TIMEOUT_SECS: u64 = 25;

/// Total per-request timeout for HTML/JSON endpoints.
pub const TEXT_TIMEOUT_SECS: u64 = 25;

/// Total per-request timeout for image transfers.
pub const IMAGE_TIMEOUT_SECS: u64 = 300;

/// Redirect ceiling for every request.
const MAX_REDIRECTS: usize = 5;

/// Base backoff delay; attempt `n` sleeps `400 * 2^n` ms.
const BACKOFF_BASE_MS: u64 = 400;

/// How much of an error body is read for the diagnostic snippet.
const ERROR_BODY_CAP: u64 = 16 * 1024;

/// Per-request knobs. Construct with [`FetchOptions::text`] or
/// [`FetchOptions::image`] and override as needed.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Extra request headers.
    pub headers: HeaderMap,
    /// Total request timeout.
    pub timeout: Duration,
    /// Reject responses larger than this many bytes.
    pub max_bytes: Option<u64>,
    /// Additional attempts after the first (0 = single attempt).
    pub retries: u32,
}

impl FetchOptions {
    /// Options for HTML/JSON endpoints: short timeout.
    #[must_use]
    pub fn text() -> Self {
        Self {
            timeout: Duration::from_secs(TEXT_TIMEOUT_SECS),
            ..Self::default()
        }
    }

    /// Options for image transfers: long timeout.
    #[must_use]
    pub fn image() -> Self {
        Self {
            timeout: Duration::from_secs(IMAGE_TIMEOUT_SECS),
            ..Self::default()
        }
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the byte cap.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Sets extra request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Response buffer returned by the byte-oriented operations.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    /// HTTP status code.
    pub status: u16,
    /// Response body, capped at the configured `max_bytes`.
    pub body: Vec<u8>,
    /// URL after redirects.
    pub final_url: String,
    /// `Content-Type` header value, when present.
    pub content_type: Option<String>,
}

/// HTTP fetcher shared by every job of one task.
///
/// The underlying `reqwest::Client` pools connections; the fetcher does not
/// own any task state, so it is cheap to clone and safe to share.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    /// Creates a fetcher with the standard connect timeout and redirect
    /// ceiling.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let client = ClientBuilder::new()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Downloads `url` into `dst`, truncating any previous content.
    ///
    /// The destination is deleted again on every failed or stopped attempt,
    /// so a present non-empty file is always a complete one.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] on bad arguments, exhausted retries, byte-cap
    /// violations, filesystem failures, or an observed stop signal.
    #[instrument(level = "debug", skip(self, opts, stop), fields(url = %url, dst = %dst.display()))]
    pub async fn download_to_file(
        &self,
        url: &str,
        dst: &Path,
        opts: &FetchOptions,
        stop: &StopToken,
    ) -> Result<(), FetchError> {
        let parsed = parse_http_url(url)?;

        let mut attempt: u32 = 0;
        loop {
            stop.check()?;
            match self.stream_to_file_once(&parsed, dst, opts, stop).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    remove_partial(dst).await;
                    if err.stopped().is_some() {
                        return Err(err);
                    }
                    if err.is_retryable() && attempt < opts.retries {
                        let delay = backoff_delay(attempt);
                        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying download");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Performs a single GET and buffers up to `max_bytes` of the body.
    ///
    /// Does not judge the status code; callers inspect
    /// [`FetchedBody::status`].
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] on bad arguments, transport failures,
    /// byte-cap violations, or an observed stop signal.
    pub async fn get_bytes(
        &self,
        url: &str,
        opts: &FetchOptions,
        stop: &StopToken,
    ) -> Result<FetchedBody, FetchError> {
        let parsed = parse_http_url(url)?;
        self.buffer_once(&parsed, opts, stop).await
    }

    /// GET with the full retry contract; success requires HTTP 2xx.
    ///
    /// Non-2xx responses carry a whitespace-collapsed body snippet and are
    /// retried when the status qualifies.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Status`] for a non-2xx terminal response, plus
    /// everything [`get_bytes`](Self::get_bytes) can return.
    #[instrument(level = "debug", skip(self, opts, stop), fields(url = %url))]
    pub async fn get_bytes_with_retry(
        &self,
        url: &str,
        opts: &FetchOptions,
        stop: &StopToken,
    ) -> Result<FetchedBody, FetchError> {
        let parsed = parse_http_url(url)?;

        let mut attempt: u32 = 0;
        loop {
            stop.check()?;
            let err = match self.buffer_once(&parsed, opts, stop).await {
                Ok(fetched) if (200..300).contains(&fetched.status) => return Ok(fetched),
                Ok(fetched) => FetchError::Status {
                    url: url.to_string(),
                    status: fetched.status,
                    snippet: body_snippet(&fetched.body),
                },
                Err(err) => err,
            };

            if err.stopped().is_some() {
                return Err(err);
            }
            if err.is_retryable() && attempt < opts.retries {
                let delay = backoff_delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying request");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(err);
        }
    }

    /// GET + JSON parse. A non-JSON body from a JSON endpoint fails with a
    /// short actionable snippet so it can become the task message verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::NotJson`] on parse failure, plus everything
    /// [`get_bytes_with_retry`](Self::get_bytes_with_retry) can return.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        opts: &FetchOptions,
        stop: &StopToken,
    ) -> Result<T, FetchError> {
        let fetched = self.get_bytes_with_retry(url, opts, stop).await?;
        serde_json::from_slice(&fetched.body).map_err(|_| FetchError::NotJson {
            url: url.to_string(),
            snippet: body_snippet(&fetched.body),
        })
    }

    async fn stream_to_file_once(
        &self,
        url: &Url,
        dst: &Path,
        opts: &FetchOptions,
        stop: &StopToken,
    ) -> Result<(), FetchError> {
        let response = self.send(url, opts).await?;
        let status = response.status();

        if !status.is_success() {
            let snippet = read_error_snippet(response).await;
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                snippet,
            });
        }

        check_declared_length(url, &response, opts.max_bytes)?;

        let file = File::create(dst)
            .await
            .map_err(|source| io_error(url, source))?;
        let mut writer = BufWriter::new(file);
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            stop.check()?;
            let chunk = chunk.map_err(|source| FetchError::Network {
                url: url.to_string(),
                source,
            })?;
            written += chunk.len() as u64;
            if let Some(limit) = opts.max_bytes {
                if written > limit {
                    return Err(FetchError::TooLarge {
                        url: url.to_string(),
                        limit,
                    });
                }
            }
            writer
                .write_all(&chunk)
                .await
                .map_err(|source| io_error(url, source))?;
        }

        writer.flush().await.map_err(|source| io_error(url, source))?;
        Ok(())
    }

    async fn buffer_once(
        &self,
        url: &Url,
        opts: &FetchOptions,
        stop: &StopToken,
    ) -> Result<FetchedBody, FetchError> {
        let response = self.send(url, opts).await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        check_declared_length(url, &response, opts.max_bytes)?;

        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            stop.check()?;
            let chunk = chunk.map_err(|source| FetchError::Network {
                url: url.to_string(),
                source,
            })?;
            if let Some(limit) = opts.max_bytes {
                if body.len() as u64 + chunk.len() as u64 > limit {
                    return Err(FetchError::TooLarge {
                        url: url.to_string(),
                        limit,
                    });
                }
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedBody {
            status,
            body,
            final_url,
            content_type,
        })
    }

    async fn send(&self, url: &Url, opts: &FetchOptions) -> Result<reqwest::Response, FetchError> {
        let mut request = self
            .client
            .request(Method::GET, url.clone())
            .headers(opts.headers.clone());
        if !opts.timeout.is_zero() {
            request = request.timeout(opts.timeout);
        }
        request.send().await.map_err(|source| FetchError::Network {
            url: url.to_string(),
            source,
        })
    }
}

/// Computes the backoff delay for a finished attempt number (0-indexed).
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(factor))
}

fn parse_http_url(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(FetchError::Scheme {
            url: url.to_string(),
            scheme: other.to_string(),
        }),
    }
}

fn check_declared_length(
    url: &Url,
    response: &reqwest::Response,
    max_bytes: Option<u64>,
) -> Result<(), FetchError> {
    if let (Some(limit), Some(declared)) = (max_bytes, response.content_length()) {
        if declared > limit {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                limit,
            });
        }
    }
    Ok(())
}

async fn read_error_snippet(response: reqwest::Response) -> String {
    match response.bytes().await {
        Ok(bytes) => body_snippet(&bytes[..bytes.len().min(ERROR_BODY_CAP as usize)]),
        Err(_) => String::new(),
    }
}

async fn remove_partial(dst: &Path) {
    if let Err(error) = tokio::fs::remove_file(dst).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(dst = %dst.display(), %error, "failed to remove partial file");
        }
    }
}

fn io_error(url: &Url, source: std::io::Error) -> FetchError {
    FetchError::Io {
        url: url.to_string(),
        source,
    }
}
