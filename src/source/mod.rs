//! Per-source download pipelines.
//!
//! Every upstream gets one adapter implementing the shared [`SourceAdapter`]
//! contract: consume credentials, a target, an optional episode selection, a
//! staging directory, a progress reporter and a stop token; produce a
//! [`DownloadedComic`] and a populated staging layout. Adapters never write
//! outside their staging directory.
//!
//! # Architecture
//!
//! - [`SourceAdapter`] - async trait the six adapters implement
//! - [`AdapterContext`] - everything a run needs, owned so fan-out jobs can
//!   clone what they capture
//! - [`run_source`] - dispatch from a [`Source`] to its adapter
//! - [`PicacgAdapter`] - signed-API service (HMAC request signatures)
//! - [`EhentaiAdapter`] - cookie-gated HTML galleries
//! - [`JmAdapter`] - encrypted API + image descrambling
//! - [`HitomiAdapter`] - gg.js-derived image URLs
//! - [`HtmangaAdapter`] - configurable-base-URL HTML galleries
//! - [`NhentaiAdapter`] - plain JSON API

mod ehentai;
mod hitomi;
mod htmanga;
mod jm;
mod nhentai;
mod picacg;

pub use ehentai::EhentaiAdapter;
pub use hitomi::HitomiAdapter;
pub use htmanga::HtmangaAdapter;
pub use jm::JmAdapter;
pub use nhentai::NhentaiAdapter;
pub use picacg::PicacgAdapter;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use thiserror::Error;

use crate::comic::{DownloadedComic, Source};
use crate::fanout::{StopAware, run_jobs};
use crate::fetch::{FetchError, FetchOptions, Fetcher};
use crate::progress::ProgressReporter;
use crate::stop::{StopMode, StopToken, Stopped};
use crate::task::TaskParams;

/// Adapter-level errors.
///
/// Everything except [`Stopped`](SourceError::Stopped) ends up as the failed
/// task's message, so variants keep their display to one actionable line.
#[derive(Error, Debug)]
pub enum SourceError {
    /// A required credential key is absent.
    #[error("missing auth.{0}")]
    MissingAuth(&'static str),

    /// An upstream response broke the adapter's contract
    /// (missing field, unexpected shape, refused image).
    #[error("{0}")]
    Upstream(String),

    /// HTTP-level failure, already retried per policy.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Local write failure inside the staging directory.
    #[error("staging write failed: {0}")]
    Io(#[from] std::io::Error),

    /// Cooperative stop observed; not an error.
    #[error(transparent)]
    Stopped(#[from] Stopped),
}

impl SourceError {
    /// Builds an upstream-invariant error from any displayable detail.
    #[must_use]
    pub fn upstream(detail: impl Into<String>) -> Self {
        Self::Upstream(detail.into())
    }

    /// Returns the stop mode when this value wraps a stop signal.
    #[must_use]
    pub fn stopped(&self) -> Option<StopMode> {
        match self {
            Self::Stopped(Stopped(mode)) => Some(*mode),
            Self::Fetch(fetch) => fetch.stopped(),
            _ => None,
        }
    }
}

impl StopAware for SourceError {
    fn stopped(&self) -> Option<StopMode> {
        SourceError::stopped(self)
    }
}

/// Everything one adapter run needs.
///
/// Fields are owned (or cheaply clonable) because fan-out jobs move clones
/// into spawned futures.
pub struct AdapterContext {
    /// The task's staging directory. Adapters never write outside it.
    pub work_dir: PathBuf,
    /// Credential blob for the source, stored verbatim by the control plane.
    pub auth: serde_json::Map<String, serde_json::Value>,
    /// Source-specific target (comic id, gallery URL, ...).
    pub target: String,
    /// Client parameters (episode selection and hints).
    pub params: TaskParams,
    /// Progress reporter for this task.
    pub progress: Arc<ProgressReporter>,
    /// Stop token for this task.
    pub stop: StopToken,
    /// HTTP client shared by every job of this task.
    pub fetcher: Fetcher,
    /// Per-file retry budget.
    pub file_retries: u32,
    /// File fan-out width.
    pub file_concurrent: usize,
}

impl AdapterContext {
    /// Required string credential; the error names the missing key.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::MissingAuth`] when absent or not a string.
    pub fn auth_str(&self, key: &'static str) -> Result<&str, SourceError> {
        self.auth
            .get(key)
            .and_then(serde_json::Value::as_str)
            .filter(|v| !v.trim().is_empty())
            .ok_or(SourceError::MissingAuth(key))
    }

    /// Optional string credential.
    #[must_use]
    pub fn auth_opt(&self, key: &str) -> Option<&str> {
        self.auth
            .get(key)
            .and_then(serde_json::Value::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Fetch options for HTML/JSON round trips.
    #[must_use]
    pub fn text_opts(&self) -> FetchOptions {
        FetchOptions::text().with_retries(self.file_retries)
    }

    /// Fetch options for image transfers.
    #[must_use]
    pub fn image_opts(&self) -> FetchOptions {
        FetchOptions::image().with_retries(self.file_retries)
    }
}

/// Shared adapter contract.
///
/// # Object Safety
///
/// This trait uses `async_trait` to support dynamic dispatch via
/// `Box<dyn SourceAdapter>`. Rust 2024 native async traits are not
/// object-safe, so `async_trait` is required for the dispatch table.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// The source this adapter serves.
    fn source(&self) -> Source;

    /// Runs the full pipeline: metadata, totals, resume floor, file jobs.
    async fn run(&self, ctx: &AdapterContext) -> Result<DownloadedComic, SourceError>;
}

/// Returns the adapter for a source.
#[must_use]
pub fn adapter_for(source: Source) -> Box<dyn SourceAdapter> {
    match source {
        Source::Picacg => Box::new(PicacgAdapter),
        Source::Ehentai => Box::new(EhentaiAdapter),
        Source::Jm => Box::new(JmAdapter::new()),
        Source::Hitomi => Box::new(HitomiAdapter),
        Source::Htmanga => Box::new(HtmangaAdapter),
        Source::Nhentai => Box::new(NhentaiAdapter),
    }
}

/// Dispatches one task run to the matching adapter.
///
/// # Errors
///
/// Propagates the adapter's [`SourceError`].
pub async fn run_source(
    source: Source,
    ctx: &AdapterContext,
) -> Result<DownloadedComic, SourceError> {
    adapter_for(source).run(ctx).await
}

// ---- shared staging helpers ------------------------------------------------

/// One plain file-download job: fetch `url` into `dst` with `headers`.
#[derive(Debug, Clone)]
pub(crate) struct FileJob {
    pub url: String,
    pub dst: PathBuf,
    pub headers: HeaderMap,
}

/// Runs plain file jobs through the bounded fan-out.
///
/// Jobs whose destination already holds a non-empty file skip themselves
/// without advancing progress; the resume floor accounts for them.
pub(crate) async fn download_files(
    ctx: &AdapterContext,
    jobs: Vec<FileJob>,
) -> Result<(), SourceError> {
    let fetcher = ctx.fetcher.clone();
    let progress = Arc::clone(&ctx.progress);
    let stop = ctx.stop.clone();
    let retries = ctx.file_retries;

    run_jobs(
        jobs,
        ctx.file_concurrent,
        &ctx.stop,
        move |job: FileJob| {
            let fetcher = fetcher.clone();
            let progress = Arc::clone(&progress);
            let stop = stop.clone();
            let opts = FetchOptions::image()
                .with_retries(retries)
                .with_headers(job.headers.clone());
            async move {
                if file_present(&job.dst) {
                    return Ok(());
                }
                fetcher
                    .download_to_file(&job.url, &job.dst, &opts, &stop)
                    .await?;
                progress.advance(1).await;
                Ok(())
            }
        },
        || {},
    )
    .await
}

/// Whether `path` is an existing non-empty file.
pub(crate) fn file_present(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// Whether a page numbered `n` already exists (any extension) in `dir`.
pub(crate) fn page_file_exists(dir: &Path, n: usize) -> bool {
    let prefix = format!("{n}.");
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() && meta.len() > 0 {
                    return true;
                }
            }
        }
    }
    false
}

/// Counts completed files in a staging directory: a non-empty `cover.jpg`
/// plus every non-empty file under `pages/` (recursively, so chaptered
/// layouts count too). Used as the resume floor after a paused/failed run.
pub(crate) fn count_downloaded(work_dir: &Path) -> u64 {
    let mut count = 0;
    if file_present(&work_dir.join("cover.jpg")) {
        count += 1;
    }
    count + count_files(&work_dir.join("pages"))
}

fn count_files(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut count = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            count += count_files(&entry.path());
        } else if meta.len() > 0 {
            count += 1;
        }
    }
    count
}

/// File extension taken from a URL path, lowercased, default `jpg`.
pub(crate) fn ext_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('.').next() {
        Some(ext)
            if ext.len() <= 5
                && !ext.contains('/')
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => "jpg".to_string(),
    }
}
