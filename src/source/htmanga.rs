//! htmanga adapter: plain HTML galleries behind a configurable base URL.
//!
//! Metadata comes from `photos-index-page-1-aid-<id>.html`; the image list
//! is harvested from `photos-gallery-aid-<id>.html`, accepting only URLs
//! that contain `/data/` or `wnimg` and rejecting scripts and stylesheets.

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue};
use scraper::{Html, Selector};

use super::{
    AdapterContext, FileJob, SourceAdapter, SourceError, count_downloaded, download_files,
    ext_from_url,
};
use crate::comic::{DownloadedComic, Source, canonical_id};
use crate::fetch::body_snippet;

/// Adapter for the configurable-base HTML source.
pub struct HtmangaAdapter;

#[async_trait]
impl SourceAdapter for HtmangaAdapter {
    fn source(&self) -> Source {
        Source::Htmanga
    }

    async fn run(&self, ctx: &AdapterContext) -> Result<DownloadedComic, SourceError> {
        let base = ctx.auth_str("baseUrl")?.trim_end_matches('/').to_string();
        let id = canonical_id(Source::Htmanga, &ctx.target)
            .map_err(|e| SourceError::upstream(e.to_string()))?;
        let numeric = id.trim_start_matches("Ht");

        let mut headers = HeaderMap::new();
        if let Some(cookie) = ctx.auth_opt("cookie") {
            let value = HeaderValue::from_str(cookie)
                .map_err(|_| SourceError::upstream("cookie contains unencodable bytes"))?;
            headers.insert(COOKIE, value);
        }
        let opts = ctx.text_opts().with_headers(headers.clone());

        let index = ctx
            .fetcher
            .get_bytes_with_retry(
                &format!("{base}/photos-index-page-1-aid-{numeric}.html"),
                &opts,
                &ctx.stop,
            )
            .await?;
        let index_html = String::from_utf8_lossy(&index.body).into_owned();
        let (title, tags, cover_url) = parse_index(&index_html);
        let title = title.ok_or_else(|| {
            SourceError::upstream(format!(
                "no title on index page: {}",
                body_snippet(&index.body)
            ))
        })?;

        let gallery = ctx
            .fetcher
            .get_bytes_with_retry(
                &format!("{base}/photos-gallery-aid-{numeric}.html"),
                &opts,
                &ctx.stop,
            )
            .await?;
        let gallery_html = String::from_utf8_lossy(&gallery.body).into_owned();
        let image_urls = harvest_image_urls(&gallery_html);
        if image_urls.is_empty() {
            return Err(SourceError::upstream(format!(
                "no image urls on gallery page: {}",
                body_snippet(&gallery.body)
            )));
        }

        let pages_dir = ctx.work_dir.join("pages");
        tokio::fs::create_dir_all(&pages_dir).await?;

        let mut jobs = Vec::with_capacity(image_urls.len() + 1);
        if let Some(cover_url) = &cover_url {
            jobs.push(FileJob {
                url: cover_url.clone(),
                dst: ctx.work_dir.join("cover.jpg"),
                headers: headers.clone(),
            });
        }
        for (index, url) in image_urls.iter().enumerate() {
            let n = index + 1;
            let ext = ext_from_url(url);
            jobs.push(FileJob {
                url: url.clone(),
                dst: pages_dir.join(format!("{n}.{ext}")),
                headers: headers.clone(),
            });
        }

        ctx.progress.set_total(jobs.len() as u64).await;
        ctx.progress.ensure_at_least(count_downloaded(&ctx.work_dir)).await;

        download_files(ctx, jobs).await?;

        let downloaded_json = serde_json::json!({
            "title": title,
            "tags": tags,
            "pages": image_urls.len(),
        });

        Ok(DownloadedComic::new(
            Source::Htmanga,
            id,
            title,
            String::new(),
            tags,
            downloaded_json,
        ))
    }
}

/// Title (`h2`, falling back to `<title>`), tag links, and the first
/// acceptable image as the cover.
fn parse_index(html: &str) -> (Option<String>, Vec<String>, Option<String>) {
    let doc = Html::parse_document(html);

    let text_of = |css: &str| -> Option<String> {
        let selector = Selector::parse(css).ok()?;
        let element = doc.select(&selector).next()?;
        let text = element.text().collect::<String>().trim().to_string();
        if text.is_empty() { None } else { Some(text) }
    };

    let title = text_of("h2").or_else(|| text_of("title"));

    let mut tags = Vec::new();
    if let Ok(selector) = Selector::parse("a[href*='tag']") {
        for a in doc.select(&selector) {
            let text = a.text().collect::<String>().trim().to_string();
            if !text.is_empty() && !tags.contains(&text) {
                tags.push(text);
            }
        }
    }

    let mut cover = None;
    if let Ok(selector) = Selector::parse("img") {
        for img in doc.select(&selector) {
            if let Some(src) = img.value().attr("src") {
                if acceptable_image_url(src) {
                    cover = Some(absolutize(src));
                    break;
                }
            }
        }
    }

    (title, tags, cover)
}

/// Quoted URLs from the gallery page, filtered to real image hosts,
/// deduplicated in first-seen order.
fn harvest_image_urls(html: &str) -> Vec<String> {
    let Ok(re) = Regex::new(r#"["'](?P<url>(?:https?:)?//[^"']+)["']"#) else {
        return Vec::new();
    };
    let mut seen = std::collections::HashSet::new();
    let mut urls = Vec::new();
    for captures in re.captures_iter(html) {
        let Some(url) = captures.name("url") else { continue };
        let url = url.as_str();
        if !acceptable_image_url(url) {
            continue;
        }
        let absolute = absolutize(url);
        if seen.insert(absolute.clone()) {
            urls.push(absolute);
        }
    }
    urls
}

/// Accepts only `/data/` or `wnimg` URLs and rejects scripts/stylesheets.
fn acceptable_image_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.ends_with(".js") || path.ends_with(".css") {
        return false;
    }
    url.contains("/data/") || url.contains("wnimg")
}

fn absolutize(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        url.to_string()
    }
}
