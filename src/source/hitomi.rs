//! hitomi adapter: gallery JSON from the `ltn` host, image URLs derived
//! from the rotating `gg.js` tables.
//!
//! `gg.js` supplies three inputs: the set of case-label integers, the route
//! fragment `b`, and the initial `var o = N` value. The per-image URL is
//! `<subdomain>.<domain>/<b>/<s(hash)>/<hash>.<ext>` where `s(hash)` is the
//! decimal of the hex number formed by the hash's last byte and the two
//! before it, and the subdomain letter flips on membership of `s` in the
//! case-label set. The table is cached and refreshed at most once a minute.
//! Every page is first tried as `.webp`, then falls back to the file's
//! original extension.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;

use super::{
    AdapterContext, SourceAdapter, SourceError, count_downloaded, ext_from_url, file_present,
    page_file_exists,
};
use crate::comic::{DownloadedComic, Source, canonical_id};
use crate::fanout::run_jobs;
use crate::fetch::{FetchOptions, Fetcher};
use crate::stop::StopToken;

const DEFAULT_LTN_BASE: &str = "https://ltn.hitomi.la";
const DEFAULT_DOMAIN: &str = "hitomi.la";

/// Minimum age before `gg.js` is fetched again.
const GG_REFRESH: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct Gallery {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    japanese_title: Option<String>,
    #[serde(default)]
    tags: Vec<GalleryTag>,
    #[serde(default)]
    files: Vec<GalleryFile>,
}

#[derive(Debug, Deserialize)]
struct GalleryTag {
    tag: String,
    #[serde(default)]
    female: Option<serde_json::Value>,
    #[serde(default)]
    male: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct GalleryFile {
    name: String,
    hash: String,
}

/// Parsed `gg.js` tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GgTable {
    /// Case-label integers from the `gg.js` switch.
    numbers: std::collections::HashSet<u64>,
    /// Route fragment (`b: '...'`).
    b: String,
    /// The `var o = N` initial value.
    initial: u64,
}

impl GgTable {
    /// Subdomain selector: flip the initial value's low bit when `g` is a
    /// case label, otherwise keep the initial value.
    fn mm(&self, g: u64) -> u64 {
        if self.numbers.contains(&g) {
            !self.initial & 1
        } else {
            self.initial & 1
        }
    }
}

/// Adapter for the gg.js-driven source.
pub struct HitomiAdapter;

#[async_trait]
impl SourceAdapter for HitomiAdapter {
    fn source(&self) -> Source {
        Source::Hitomi
    }

    async fn run(&self, ctx: &AdapterContext) -> Result<DownloadedComic, SourceError> {
        let ltn_base = ctx
            .auth_opt("ltnBaseUrl")
            .unwrap_or(DEFAULT_LTN_BASE)
            .trim_end_matches('/')
            .to_string();
        let domain = ctx.auth_opt("baseDomain").unwrap_or(DEFAULT_DOMAIN).to_string();

        let id = canonical_id(Source::Hitomi, &ctx.target)
            .map_err(|e| SourceError::upstream(e.to_string()))?;
        let numeric = id.trim_start_matches("hitomi").to_string();

        // Gallery JSON ships as a JS assignment; strip to the first '{'.
        let gallery_js = ctx
            .fetcher
            .get_bytes_with_retry(
                &format!("{ltn_base}/galleries/{numeric}.js"),
                &ctx.text_opts(),
                &ctx.stop,
            )
            .await?;
        let gallery_text = String::from_utf8_lossy(&gallery_js.body).into_owned();
        let gallery_json = strip_js_prefix(&gallery_text)
            .ok_or_else(|| SourceError::upstream("gallery js carries no JSON object"))?;
        let raw: serde_json::Value = serde_json::from_str(gallery_json)
            .map_err(|_| SourceError::upstream("gallery js is not valid JSON"))?;
        let gallery: Gallery = serde_json::from_value(raw.clone())
            .map_err(|_| SourceError::upstream("unexpected gallery shape"))?;
        if gallery.files.is_empty() {
            return Err(SourceError::upstream("gallery has no files"));
        }

        let gg = Arc::new(GgCache::new(ltn_base.clone()));

        // Cover from the gallery block markup, with a thumbnail-host
        // fallback derived from the first file's hash.
        let block = ctx
            .fetcher
            .get_bytes_with_retry(
                &format!("{ltn_base}/galleryblock/{numeric}.html"),
                &ctx.text_opts(),
                &ctx.stop,
            )
            .await?;
        let cover_url = match parse_block_cover(&String::from_utf8_lossy(&block.body)) {
            Some(url) => url,
            None => {
                let table = gg.get(&ctx.fetcher, &ctx.stop).await?;
                thumb_url(&table, &domain, &gallery.files[0].hash, "jpg")
            }
        };

        let pages_dir = ctx.work_dir.join("pages");
        tokio::fs::create_dir_all(&pages_dir).await?;

        ctx.progress.set_total(gallery.files.len() as u64 + 1).await;
        ctx.progress.ensure_at_least(count_downloaded(&ctx.work_dir)).await;

        let cover_dst = ctx.work_dir.join("cover.jpg");
        if !file_present(&cover_dst) {
            ctx.fetcher
                .download_to_file(&cover_url, &cover_dst, &ctx.image_opts(), &ctx.stop)
                .await?;
            ctx.progress.advance(1).await;
        }

        run_file_jobs(ctx, &gallery.files, pages_dir, gg, domain).await?;

        let title = gallery
            .title
            .clone()
            .or_else(|| gallery.japanese_title.clone())
            .unwrap_or_else(|| id.clone());
        let subtitle = gallery.japanese_title.clone().unwrap_or_default();
        let tags = gallery.tags.iter().map(tag_text).collect();

        Ok(DownloadedComic::new(Source::Hitomi, id, title, subtitle, tags, raw))
    }
}

async fn run_file_jobs(
    ctx: &AdapterContext,
    files: &[GalleryFile],
    pages_dir: std::path::PathBuf,
    gg: Arc<GgCache>,
    domain: String,
) -> Result<(), SourceError> {
    let fetcher = ctx.fetcher.clone();
    let progress = Arc::clone(&ctx.progress);
    let stop = ctx.stop.clone();
    let retries = ctx.file_retries;

    let jobs: Vec<(usize, GalleryFile)> =
        files.iter().cloned().enumerate().collect();

    run_jobs(
        jobs,
        ctx.file_concurrent,
        &ctx.stop,
        move |(index, file): (usize, GalleryFile)| {
            let fetcher = fetcher.clone();
            let progress = Arc::clone(&progress);
            let stop = stop.clone();
            let gg = Arc::clone(&gg);
            let pages_dir = pages_dir.clone();
            let domain = domain.clone();
            async move {
                let n = index + 1;
                if page_file_exists(&pages_dir, n) {
                    return Ok(());
                }

                let table = gg.get(&fetcher, &stop).await?;
                let opts = FetchOptions::image().with_retries(retries);

                // webp first, original extension as fallback.
                let webp_url = image_url(&table, &domain, &file.hash, "webp");
                let webp_dst = pages_dir.join(format!("{n}.webp"));
                match fetcher.download_to_file(&webp_url, &webp_dst, &opts, &stop).await {
                    Ok(()) => {
                        progress.advance(1).await;
                        return Ok(());
                    }
                    Err(error) if error.stopped().is_some() => {
                        return Err(SourceError::from(error));
                    }
                    Err(_) => {}
                }

                let ext = ext_from_url(&file.name);
                let url = image_url(&table, &domain, &file.hash, &ext);
                let dst = pages_dir.join(format!("{n}.{ext}"));
                fetcher.download_to_file(&url, &dst, &opts, &stop).await?;
                progress.advance(1).await;
                Ok(())
            }
        },
        || {},
    )
    .await
}

/// Cached `gg.js` tables with a one-minute refresh floor.
pub(crate) struct GgCache {
    ltn_base: String,
    inner: tokio::sync::Mutex<Option<(Instant, Arc<GgTable>)>>,
}

impl GgCache {
    fn new(ltn_base: String) -> Self {
        Self {
            ltn_base,
            inner: tokio::sync::Mutex::new(None),
        }
    }

    async fn get(&self, fetcher: &Fetcher, stop: &StopToken) -> Result<Arc<GgTable>, SourceError> {
        let mut slot = self.inner.lock().await;
        if let Some((at, table)) = slot.as_ref() {
            if at.elapsed() < GG_REFRESH {
                return Ok(Arc::clone(table));
            }
        }

        let body = fetcher
            .get_bytes_with_retry(
                &format!("{}/gg.js", self.ltn_base),
                &FetchOptions::text(),
                stop,
            )
            .await?;
        let text = String::from_utf8_lossy(&body.body);
        let table = Arc::new(
            parse_gg(&text).ok_or_else(|| SourceError::upstream("gg.js did not parse"))?,
        );
        *slot = Some((Instant::now(), Arc::clone(&table)));
        Ok(table)
    }
}

// ---- pure derivation functions --------------------------------------------

/// Strips the JS assignment prefix, keeping everything from the first `{`.
fn strip_js_prefix(text: &str) -> Option<&str> {
    text.find('{').map(|index| &text[index..])
}

/// Parses the three gg.js inputs: case labels, `b` fragment, initial `o`.
pub(crate) fn parse_gg(text: &str) -> Option<GgTable> {
    let case_re = Regex::new(r"case\s+(\d+):").ok()?;
    let numbers: std::collections::HashSet<u64> = case_re
        .captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect();

    let initial = Regex::new(r"var\s+o\s*=\s*(\d+)")
        .ok()?
        .captures(text)?
        .get(1)?
        .as_str()
        .parse()
        .ok()?;

    let b = Regex::new(r"b:\s*'([^']+)'")
        .ok()?
        .captures(text)?
        .get(1)?
        .as_str()
        .trim_matches('/')
        .to_string();

    Some(GgTable {
        numbers,
        b,
        initial,
    })
}

/// `s(hash)`: decimal of the hex number formed by the last byte of the hash
/// followed by the two hex chars before it.
pub(crate) fn s_value(hash: &str) -> Option<u64> {
    if hash.len() < 3 {
        return None;
    }
    let tail = &hash[hash.len() - 3..];
    let reordered = format!("{}{}", &tail[2..], &tail[..2]);
    u64::from_str_radix(&reordered, 16).ok()
}

/// Full image URL for one hash/extension pair.
pub(crate) fn image_url(gg: &GgTable, domain: &str, hash: &str, ext: &str) -> String {
    let g = s_value(hash).unwrap_or(0);
    let m = gg.mm(g);
    let path = format!("{}/{g}/{hash}.{ext}", gg.b);
    if ext == "webp" {
        format!("https://w{}.{domain}/{path}", m + 1)
    } else {
        let letter = letter_for(m);
        format!("https://{letter}a.{domain}/{path}")
    }
}

/// Thumbnail URL (`<letter>tn` subdomain) for a hash.
pub(crate) fn thumb_url(gg: &GgTable, domain: &str, hash: &str, ext: &str) -> String {
    let g = s_value(hash).unwrap_or(0);
    let letter = letter_for(gg.mm(g));
    format!("https://{letter}tn.{domain}/{}/{g}/{hash}.{ext}", gg.b)
}

fn letter_for(m: u64) -> char {
    char::from(b'a' + u8::try_from(m & 1).unwrap_or(0))
}

/// Cover image from the galleryblock markup: `img[data-src]` or `img[src]`,
/// with protocol-relative URLs made absolute.
fn parse_block_cover(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let selector = Selector::parse("img").ok()?;
    let img = doc.select(&selector).next()?;
    let src = img.value().attr("data-src").or_else(|| img.value().attr("src"))?;
    if let Some(rest) = src.strip_prefix("//") {
        Some(format!("https://{rest}"))
    } else {
        Some(src.to_string())
    }
}

fn tag_text(tag: &GalleryTag) -> String {
    let flagged = |value: &Option<serde_json::Value>| {
        value
            .as_ref()
            .is_some_and(|v| !matches!(v, serde_json::Value::String(s) if s.is_empty()))
    };
    if flagged(&tag.female) {
        format!("female:{}", tag.tag)
    } else if flagged(&tag.male) {
        format!("male:{}", tag.tag)
    } else {
        tag.tag.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const GG_JS: &str = r"
        var gg = {
            m: function(g) {
                var o = 0;
                switch (g) {
                    case 1234:
                    case 2171:
                        o = 1; break;
                }
                return o;
            },
            b: '1700000000/'
        };";

    #[test]
    fn test_parse_gg_extracts_all_three_tables() {
        let gg = parse_gg(GG_JS).unwrap();
        assert!(gg.numbers.contains(&1234));
        assert!(gg.numbers.contains(&2171));
        assert_eq!(gg.b, "1700000000");
        assert_eq!(gg.initial, 0);
    }

    #[test]
    fn test_s_value_reorders_last_bytes() {
        // hash tail "87b" -> "b87" -> 0xb87 = 2951
        assert_eq!(s_value("0a1f87b").unwrap(), 0xb87);
        assert!(s_value("ab").is_none());
    }

    /// Tail "b87" reorders to "7b8" = 1976 (not a case label).
    const HASH_PLAIN: &str = "0000000000000000000000000000000000000b87";
    /// Tail "7b8" reorders to "87b" = 2171 (a case label).
    const HASH_FLIPPED: &str = "00000000000000000000000000000000000007b8";

    #[test]
    fn test_image_url_flips_subdomain_on_case_membership() {
        let gg = parse_gg(GG_JS).unwrap();

        let url = image_url(&gg, "hitomi.la", HASH_PLAIN, "avif");
        assert!(url.starts_with("https://aa.hitomi.la/1700000000/1976/"), "{url}");

        let url = image_url(&gg, "hitomi.la", HASH_FLIPPED, "avif");
        assert!(url.starts_with("https://ba.hitomi.la/1700000000/2171/"), "{url}");
    }

    #[test]
    fn test_webp_uses_w_subdomains() {
        let gg = parse_gg(GG_JS).unwrap();
        let url = image_url(&gg, "hitomi.la", HASH_PLAIN, "webp");
        assert!(url.starts_with("https://w1.hitomi.la/"), "{url}");
        let url = image_url(&gg, "hitomi.la", HASH_FLIPPED, "webp");
        assert!(url.starts_with("https://w2.hitomi.la/"), "{url}");
    }

    #[test]
    fn test_thumb_url_uses_tn_subdomain() {
        let gg = parse_gg(GG_JS).unwrap();
        let url = thumb_url(&gg, "hitomi.la", HASH_PLAIN, "jpg");
        assert!(url.starts_with("https://atn.hitomi.la/"), "{url}");
    }

    #[test]
    fn test_strip_js_prefix() {
        assert_eq!(strip_js_prefix("var galleryinfo = {\"id\":1}"), Some("{\"id\":1}"));
        assert!(strip_js_prefix("no json here").is_none());
    }

    #[test]
    fn test_parse_block_cover_handles_protocol_relative() {
        let html = r#"<div><img data-src="//atn.hitomi.la/smalltn/1/ab/cd.jpg"></div>"#;
        assert_eq!(
            parse_block_cover(html).unwrap(),
            "https://atn.hitomi.la/smalltn/1/ab/cd.jpg"
        );
    }

    #[test]
    fn test_tag_text_namespaces() {
        let tag: GalleryTag =
            serde_json::from_value(serde_json::json!({"tag": "x", "female": "1"})).unwrap();
        assert_eq!(tag_text(&tag), "female:x");
        let tag: GalleryTag = serde_json::from_value(serde_json::json!({"tag": "y"})).unwrap();
        assert_eq!(tag_text(&tag), "y");
    }
}
