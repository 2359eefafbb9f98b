//! Committed-comics repository.
//!
//! A library row exists iff the comic's directory has been published under
//! `<storage>/comics/<safe_id>/` by the commit protocol. The row carries the
//! serialized [`DownloadedComic`] plus commit time, on-disk size and the
//! resolved cover path.

use sqlx::FromRow;
use thiserror::Error;

use crate::comic::DownloadedComic;
use crate::db::{Database, now_millis};

/// Library persistence errors.
#[derive(Error, Debug)]
pub enum LibraryError {
    /// Underlying database failure.
    #[error("library query failed: {0}")]
    Db(#[from] sqlx::Error),

    /// Stored meta JSON no longer parses.
    #[error("corrupt meta_json for comic {id}")]
    CorruptMeta {
        /// The affected comic id.
        id: String,
    },
}

/// One committed comic.
#[derive(Debug, Clone, FromRow)]
pub struct LibraryRow {
    /// Canonical comic id.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Secondary title.
    pub subtitle: String,
    /// Source ordinal, 0..5.
    pub comic_type: i64,
    /// Tags as a JSON array (stored as text, parsed via `tags()`).
    #[sqlx(rename = "tags")]
    pub tags_json: String,
    /// Filesystem-safe directory name under `<storage>/comics/`.
    pub directory: String,
    /// Commit time, epoch millis.
    pub time: i64,
    /// Bytes under `pages/` at commit time.
    pub size: i64,
    /// Serialized [`DownloadedComic`].
    pub meta_json: String,
    /// Cover file path, when one was present at commit.
    pub cover_path: Option<String>,
}

impl LibraryRow {
    /// Parses the tags column. Invalid JSON yields an empty list.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        serde_json::from_str(&self.tags_json).unwrap_or_default()
    }

    /// Deserializes the stored comic record.
    ///
    /// # Errors
    ///
    /// Returns [`LibraryError::CorruptMeta`] when the blob no longer parses.
    pub fn meta(&self) -> Result<DownloadedComic, LibraryError> {
        serde_json::from_str(&self.meta_json).map_err(|_| LibraryError::CorruptMeta {
            id: self.id.clone(),
        })
    }
}

/// Repository over the `comics` table.
#[derive(Debug, Clone)]
pub struct Library {
    db: Database,
}

impl Library {
    /// Creates a repository over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Whether a row exists for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`LibraryError::Db`] on query failure.
    pub async fn exists(&self, id: &str) -> Result<bool, LibraryError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM comics WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.is_some())
    }

    /// Fetches one row.
    ///
    /// # Errors
    ///
    /// Returns [`LibraryError::Db`] on query failure.
    pub async fn get(&self, id: &str) -> Result<Option<LibraryRow>, LibraryError> {
        let row = sqlx::query_as::<_, LibraryRow>(
            "SELECT id, title, subtitle, comic_type, tags, directory, time, size, meta_json, cover_path \
             FROM comics WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row)
    }

    /// Inserts or replaces the row for a freshly committed comic.
    ///
    /// # Errors
    ///
    /// Returns [`LibraryError::Db`] on write failure.
    pub async fn upsert(
        &self,
        comic: &DownloadedComic,
        size: i64,
        cover_path: Option<&str>,
    ) -> Result<(), LibraryError> {
        let tags_json = serde_json::to_string(&comic.tags).unwrap_or_else(|_| "[]".to_string());
        let meta_json =
            serde_json::to_string(comic).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            "INSERT OR REPLACE INTO comics \
             (id, title, subtitle, comic_type, tags, directory, time, size, meta_json, cover_path) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&comic.id)
        .bind(&comic.title)
        .bind(&comic.subtitle)
        .bind(comic.comic_type)
        .bind(tags_json)
        .bind(&comic.directory)
        .bind(now_millis())
        .bind(size)
        .bind(meta_json)
        .bind(cover_path)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Removes a row.
    ///
    /// # Errors
    ///
    /// Returns [`LibraryError::Db`] on write failure.
    pub async fn delete(&self, id: &str) -> Result<(), LibraryError> {
        sqlx::query("DELETE FROM comics WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::comic::Source;

    fn sample() -> DownloadedComic {
        DownloadedComic::new(
            Source::Nhentai,
            "nhentai177013",
            "Title",
            "Sub",
            vec!["tag1".into(), "tag2".into()],
            serde_json::json!({"media_id": "1"}),
        )
    }

    #[tokio::test]
    async fn test_upsert_then_get_roundtrip() {
        let db = Database::new_in_memory().await.unwrap();
        let library = Library::new(db);
        library.upsert(&sample(), 123, Some("cover.jpg")).await.unwrap();

        let row = library.get("nhentai177013").await.unwrap().unwrap();
        assert_eq!(row.title, "Title");
        assert_eq!(row.size, 123);
        assert_eq!(row.cover_path.as_deref(), Some("cover.jpg"));
        assert_eq!(row.tags(), vec!["tag1".to_string(), "tag2".to_string()]);
        assert_eq!(row.meta().unwrap().id, "nhentai177013");
    }

    #[tokio::test]
    async fn test_exists_reflects_upsert_and_delete() {
        let db = Database::new_in_memory().await.unwrap();
        let library = Library::new(db);
        assert!(!library.exists("nhentai177013").await.unwrap());

        library.upsert(&sample(), 0, None).await.unwrap();
        assert!(library.exists("nhentai177013").await.unwrap());

        library.delete("nhentai177013").await.unwrap();
        assert!(!library.exists("nhentai177013").await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_row() {
        let db = Database::new_in_memory().await.unwrap();
        let library = Library::new(db);
        library.upsert(&sample(), 1, None).await.unwrap();

        let mut updated = sample();
        updated.title = "Renamed".into();
        library.upsert(&updated, 2, None).await.unwrap();

        let row = library.get("nhentai177013").await.unwrap().unwrap();
        assert_eq!(row.title, "Renamed");
        assert_eq!(row.size, 2);
    }
}
