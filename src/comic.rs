//! Comic identity and the adapter-to-commit record.
//!
//! Every task targets one upstream [`Source`]. The pair `(source, target)`
//! deterministically yields a canonical comic id — the library's primary
//! key — via [`canonical_id`]; [`safe_id`] turns that id into a
//! filesystem-safe directory name. Adapters return a [`DownloadedComic`],
//! which the commit step serializes verbatim into the library row.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The six supported upstream sources.
///
/// The ordinal (0..5) is stored as the library row's `comic_type` and must
/// stay stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Signed-API comic service.
    Picacg,
    /// HTML gallery site, cookie-gated.
    Ehentai,
    /// Encrypted-API comic service with scrambled images.
    Jm,
    /// gg.js-driven image host.
    Hitomi,
    /// Plain HTML gallery site behind a configurable base URL.
    Htmanga,
    /// Plain JSON API gallery service.
    Nhentai,
}

impl Source {
    /// All sources, in ordinal order.
    pub const ALL: [Self; 6] = [
        Self::Picacg,
        Self::Ehentai,
        Self::Jm,
        Self::Hitomi,
        Self::Htmanga,
        Self::Nhentai,
    ];

    /// Canonical lowercase name, as used in the REST surface and database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Picacg => "picacg",
            Self::Ehentai => "ehentai",
            Self::Jm => "jm",
            Self::Hitomi => "hitomi",
            Self::Htmanga => "htmanga",
            Self::Nhentai => "nhentai",
        }
    }

    /// Stable ordinal stored as `comic_type`.
    #[must_use]
    pub fn ordinal(self) -> i64 {
        match self {
            Self::Picacg => 0,
            Self::Ehentai => 1,
            Self::Jm => 2,
            Self::Hitomi => 3,
            Self::Htmanga => 4,
            Self::Nhentai => 5,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "picacg" => Ok(Self::Picacg),
            "ehentai" => Ok(Self::Ehentai),
            "jm" => Ok(Self::Jm),
            "hitomi" => Ok(Self::Hitomi),
            "htmanga" => Ok(Self::Htmanga),
            "nhentai" => Ok(Self::Nhentai),
            _ => Err(format!("unknown source: {s}")),
        }
    }
}

/// The target could not be turned into a canonical comic id.
#[derive(Debug, Clone, Error)]
#[error("cannot derive comic id for {origin} target '{target}': {reason}")]
pub struct BadTarget {
    /// The source the target was submitted for.
    pub origin: Source,
    /// The offending target string.
    pub target: String,
    /// What was missing.
    pub reason: &'static str,
}

/// Derives the canonical comic id for `(source, target)`.
///
/// The derivation is pure and stable: the same pair always yields the same
/// id, and ids never collide across sources by construction (each source
/// contributes a distinct prefix or namespace).
///
/// # Errors
///
/// Returns [`BadTarget`] when the target lacks the piece the source keys on
/// (digits, a gallery id segment, or any content at all).
pub fn canonical_id(source: Source, target: &str) -> Result<String, BadTarget> {
    let bad = |reason| BadTarget {
        origin: source,
        target: target.to_string(),
        reason,
    };
    let target = target.trim();

    match source {
        Source::Picacg => {
            if target.is_empty() {
                Err(bad("empty target"))
            } else {
                Ok(target.to_string())
            }
        }
        Source::Jm => digits(target)
            .map(|d| format!("jm{d}"))
            .ok_or_else(|| bad("no digits")),
        Source::Hitomi => last_digits(target)
            .map(|d| format!("hitomi{d}"))
            .ok_or_else(|| bad("no digits")),
        Source::Htmanga => digits(target)
            .map(|d| format!("Ht{d}"))
            .ok_or_else(|| bad("no digits")),
        Source::Nhentai => digits(target)
            .map(|d| format!("nhentai{d}"))
            .ok_or_else(|| bad("no digits")),
        Source::Ehentai => gallery_id(target).ok_or_else(|| bad("no /g/<gid>/ segment")),
    }
}

/// Replaces every character outside `[A-Za-z0-9._-]` with `_`.
#[must_use]
pub fn safe_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// First run of ASCII digits in `s`.
fn digits(s: &str) -> Option<&str> {
    let start = s.find(|c: char| c.is_ascii_digit())?;
    let rest = &s[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Last run of ASCII digits in `s` (hitomi links end in `-<id>.html`).
fn last_digits(s: &str) -> Option<&str> {
    let mut best: Option<(usize, usize)> = None;
    let mut current: Option<usize> = None;
    for (i, c) in s.char_indices() {
        if c.is_ascii_digit() {
            if current.is_none() {
                current = Some(i);
            }
        } else if let Some(start) = current.take() {
            best = Some((start, i));
        }
    }
    if let Some(start) = current {
        best = Some((start, s.len()));
    }
    best.map(|(start, end)| &s[start..end])
}

/// Extracts `<gid>` from an ehentai gallery URL path `/g/<gid>/<token>/`.
fn gallery_id(url: &str) -> Option<String> {
    let after = url.split("/g/").nth(1)?;
    let gid = after.split('/').next()?;
    if gid.is_empty() || !gid.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(gid.to_string())
}

/// Adapter output: everything the commit step needs to publish a comic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadedComic {
    /// Canonical id (library primary key). Never empty.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Secondary title (author, subtitle, or empty).
    pub subtitle: String,
    /// Source ordinal, 0..5.
    #[serde(rename = "type")]
    pub comic_type: i64,
    /// Ordered tag list.
    pub tags: Vec<String>,
    /// Filesystem-safe folder name derived from `id`.
    pub directory: String,
    /// Source-specific blob preserved verbatim for later client use.
    #[serde(rename = "downloadedJson")]
    pub downloaded_json: serde_json::Value,
}

impl DownloadedComic {
    /// Builds the record, deriving `comic_type` and `directory`.
    #[must_use]
    pub fn new(
        source: Source,
        id: impl Into<String>,
        title: impl Into<String>,
        subtitle: impl Into<String>,
        tags: Vec<String>,
        downloaded_json: serde_json::Value,
    ) -> Self {
        let id = id.into();
        let directory = safe_id(&id);
        Self {
            id,
            title: title.into(),
            subtitle: subtitle.into(),
            comic_type: source.ordinal(),
            tags,
            directory,
            downloaded_json,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_source_roundtrip() {
        for source in Source::ALL {
            assert_eq!(source.as_str().parse::<Source>().unwrap(), source);
        }
    }

    #[test]
    fn test_source_ordinals_are_stable() {
        let ordinals: Vec<i64> = Source::ALL.iter().map(|s| s.ordinal()).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_canonical_id_per_source() {
        assert_eq!(canonical_id(Source::Picacg, "5f3a9").unwrap(), "5f3a9");
        assert_eq!(canonical_id(Source::Jm, "12345").unwrap(), "jm12345");
        assert_eq!(canonical_id(Source::Jm, "JM-12345!").unwrap(), "jm12345");
        assert_eq!(
            canonical_id(Source::Hitomi, "https://hitomi.la/gallery/foo-123456.html").unwrap(),
            "hitomi123456"
        );
        assert_eq!(canonical_id(Source::Htmanga, "9012").unwrap(), "Ht9012");
        assert_eq!(canonical_id(Source::Nhentai, "177013").unwrap(), "nhentai177013");
        assert_eq!(
            canonical_id(Source::Ehentai, "https://e-hentai.org/g/2618183/5d2b1f0a51/").unwrap(),
            "2618183"
        );
    }

    #[test]
    fn test_canonical_id_is_stable() {
        for _ in 0..3 {
            assert_eq!(canonical_id(Source::Nhentai, "177013").unwrap(), "nhentai177013");
        }
    }

    #[test]
    fn test_canonical_id_rejects_bad_targets() {
        assert!(canonical_id(Source::Picacg, "  ").is_err());
        assert!(canonical_id(Source::Jm, "no-number-here").is_err());
        assert!(canonical_id(Source::Ehentai, "https://e-hentai.org/tag/x").is_err());
        assert!(canonical_id(Source::Ehentai, "https://e-hentai.org/g/notdigits/tok/").is_err());
    }

    #[test]
    fn test_safe_id_replaces_non_portable_characters() {
        assert_eq!(safe_id("nhentai177013"), "nhentai177013");
        assert_eq!(safe_id("a b/c:d"), "a_b_c_d");
        assert_eq!(safe_id("jm-12.3_4"), "jm-12.3_4");
    }

    #[test]
    fn test_downloaded_comic_derives_directory_and_type() {
        let comic = DownloadedComic::new(
            Source::Nhentai,
            "nhentai177013",
            "Title",
            "",
            vec!["tag1".into()],
            serde_json::json!({"media_id": "1"}),
        );
        assert_eq!(comic.comic_type, 5);
        assert_eq!(comic.directory, "nhentai177013");
    }

    #[test]
    fn test_downloaded_comic_serializes_with_wire_names() {
        let comic = DownloadedComic::new(
            Source::Jm,
            "jm1",
            "t",
            "s",
            vec![],
            serde_json::Value::Null,
        );
        let json = serde_json::to_value(&comic).unwrap();
        assert!(json.get("type").is_some());
        assert!(json.get("downloadedJson").is_some());
    }
}
