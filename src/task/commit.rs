//! Commit protocol: publish a staging directory as a library entry.
//!
//! The commit point is the rename plus the row insert. A crash between the
//! two leaves a comic directory without a row; it is invisible to clients
//! and the next commit for the same id overwrites it cleanly. If the row
//! insert fails while the process lives, the directory is renamed back to
//! staging so a later retry can resume from the downloaded files.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::comic::DownloadedComic;
use crate::config::Storage;
use crate::library::{Library, LibraryError};

/// Commit failures.
#[derive(Error, Debug)]
pub enum CommitError {
    /// Filesystem failure during rename or size accounting.
    #[error("commit io failed at {path}: {source}")]
    Io {
        /// The path being touched.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The library row insert failed.
    #[error(transparent)]
    Library(#[from] LibraryError),
}

/// Result of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Bytes under `pages/`.
    pub size: i64,
    /// Resolved cover path, when a cover was downloaded.
    pub cover_path: Option<String>,
}

/// Publishes `staging` as the comic's library directory and inserts the row.
///
/// # Errors
///
/// Returns [`CommitError`] when the rename, the size walk or the row insert
/// fails. On insert failure the directory has been moved back to `staging`.
#[instrument(skip(library, storage, comic), fields(comic = %comic.id))]
pub async fn publish(
    library: &Library,
    storage: &Storage,
    staging: &Path,
    comic: &DownloadedComic,
) -> Result<CommitOutcome, CommitError> {
    let dest = storage.comic_dir(&comic.directory);

    // A previous half-commit (or forced overwrite) may have left a
    // destination behind; the new content wins.
    if tokio::fs::metadata(&dest).await.is_ok() {
        warn!(dest = %dest.display(), "removing existing comic directory before commit");
        tokio::fs::remove_dir_all(&dest)
            .await
            .map_err(|source| io_at(&dest, source))?;
    }

    tokio::fs::rename(staging, &dest)
        .await
        .map_err(|source| io_at(staging, source))?;

    let outcome = match finish(library, &dest, comic).await {
        Ok(outcome) => outcome,
        Err(error) => {
            // Put the files back where retry expects them.
            if let Err(undo) = tokio::fs::rename(&dest, staging).await {
                warn!(dest = %dest.display(), %undo, "could not restore staging after failed commit");
            }
            return Err(error);
        }
    };

    info!(comic = %comic.id, size = outcome.size, "comic committed");
    Ok(outcome)
}

async fn finish(
    library: &Library,
    dest: &Path,
    comic: &DownloadedComic,
) -> Result<CommitOutcome, CommitError> {
    let pages = dest.join("pages");
    let size = dir_size_blocking(pages).await?;
    let cover_path = resolve_cover(dest).await;

    library.upsert(comic, size, cover_path.as_deref()).await?;

    Ok(CommitOutcome { size, cover_path })
}

/// Prefers `<comicDir>/cover.jpg`, falls back to `<comicDir>/pages/cover.jpg`.
async fn resolve_cover(dest: &Path) -> Option<String> {
    for candidate in [dest.join("cover.jpg"), dest.join("pages").join("cover.jpg")] {
        if tokio::fs::metadata(&candidate).await.is_ok() {
            return Some(candidate.to_string_lossy().into_owned());
        }
    }
    None
}

/// Sums file lengths under `path` recursively on a blocking thread.
async fn dir_size_blocking(path: PathBuf) -> Result<i64, CommitError> {
    let walked = path.clone();
    tokio::task::spawn_blocking(move || dir_size(&walked))
        .await
        .map_err(|join_error| io_at(&path, std::io::Error::other(join_error)))?
        .map_err(|source| io_at(&path, source))
}

#[allow(clippy::cast_possible_wrap)]
fn dir_size(path: &Path) -> std::io::Result<i64> {
    let mut total: i64 = 0;
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        // A comic without pages/ (cover-only) commits with size 0.
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(error) => return Err(error),
    };
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len() as i64;
        }
    }
    Ok(total)
}

fn io_at(path: &Path, source: std::io::Error) -> CommitError {
    CommitError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::comic::Source;
    use crate::db::Database;

    fn sample_comic() -> DownloadedComic {
        DownloadedComic::new(
            Source::Nhentai,
            "nhentai177013",
            "Title",
            "",
            vec![],
            serde_json::json!({}),
        )
    }

    async fn setup() -> (tempfile::TempDir, Storage, Library) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        storage.ensure_layout().unwrap();
        let library = Library::new(Database::new_in_memory().await.unwrap());
        (dir, storage, library)
    }

    fn stage_files(storage: &Storage, task_id: &str) -> PathBuf {
        let staging = storage.task_dir(task_id);
        std::fs::create_dir_all(staging.join("pages")).unwrap();
        std::fs::write(staging.join("cover.jpg"), b"cover").unwrap();
        std::fs::write(staging.join("pages").join("1.jpg"), b"page-one").unwrap();
        std::fs::write(staging.join("pages").join("2.png"), b"page-two!").unwrap();
        staging
    }

    #[tokio::test]
    async fn test_publish_moves_staging_and_inserts_row() {
        let (_guard, storage, library) = setup().await;
        let staging = stage_files(&storage, "t1");
        let comic = sample_comic();

        let outcome = publish(&library, &storage, &staging, &comic).await.unwrap();

        assert!(!staging.exists(), "staging must be gone after commit");
        let dest = storage.comic_dir("nhentai177013");
        assert!(dest.join("pages").join("1.jpg").exists());
        assert_eq!(outcome.size, 8 + 9);
        assert!(outcome.cover_path.as_deref().unwrap().ends_with("cover.jpg"));

        let row = library.get("nhentai177013").await.unwrap().unwrap();
        assert_eq!(row.size, 17);
        assert_eq!(row.directory, "nhentai177013");
    }

    #[tokio::test]
    async fn test_publish_overwrites_existing_destination() {
        let (_guard, storage, library) = setup().await;
        let dest = storage.comic_dir("nhentai177013");
        std::fs::create_dir_all(dest.join("pages")).unwrap();
        std::fs::write(dest.join("pages").join("stale.jpg"), b"stale").unwrap();

        let staging = stage_files(&storage, "t1");
        publish(&library, &storage, &staging, &sample_comic()).await.unwrap();

        assert!(!dest.join("pages").join("stale.jpg").exists());
        assert!(dest.join("pages").join("1.jpg").exists());
    }

    #[tokio::test]
    async fn test_publish_without_pages_commits_size_zero() {
        let (_guard, storage, library) = setup().await;
        let staging = storage.task_dir("t1");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("cover.jpg"), b"c").unwrap();

        let outcome = publish(&library, &storage, &staging, &sample_comic()).await.unwrap();
        assert_eq!(outcome.size, 0);
        assert!(outcome.cover_path.is_some());
    }

    #[tokio::test]
    async fn test_cover_fallback_under_pages() {
        let (_guard, storage, library) = setup().await;
        let staging = storage.task_dir("t1");
        std::fs::create_dir_all(staging.join("pages")).unwrap();
        std::fs::write(staging.join("pages").join("cover.jpg"), b"c").unwrap();

        let outcome = publish(&library, &storage, &staging, &sample_comic()).await.unwrap();
        let cover = outcome.cover_path.unwrap();
        assert!(cover.contains("pages"), "fallback cover expected: {cover}");
    }
}
