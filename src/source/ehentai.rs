//! ehentai adapter: cookie-gated HTML galleries.
//!
//! The gallery page yields title (`#gn`), subtitle (`#gj`), uploader, page
//! count, the tag taxonomy and the cover. Reader-page links are collected by
//! walking the thumbnail pages (`?p=0..`), then each reader page is fetched
//! inside its own fan-out job to extract `#i3 > a > img[src]`. A `509.gif`
//! image URL means the account hit the upstream image limit and fails the
//! task with one actionable line.
//!
//! Selectors are deliberately minimal; when they miss, the failure surfaces
//! as an upstream error with a body snippet instead of a guess.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue};
use scraper::{Html, Selector};

use super::{
    AdapterContext, SourceAdapter, SourceError, count_downloaded, ext_from_url, page_file_exists,
};
use crate::comic::{DownloadedComic, Source, canonical_id};
use crate::fanout::run_jobs;
use crate::fetch::{FetchOptions, Fetcher, body_snippet};
use crate::stop::StopToken;

/// Gallery metadata scraped from the landing page.
#[derive(Debug, Clone)]
struct GalleryMeta {
    title: String,
    subtitle: String,
    uploader: String,
    page_count: usize,
    tags: Vec<String>,
    cover_url: Option<String>,
}

/// Adapter for the cookie-gated HTML source.
pub struct EhentaiAdapter;

#[async_trait]
impl SourceAdapter for EhentaiAdapter {
    fn source(&self) -> Source {
        Source::Ehentai
    }

    async fn run(&self, ctx: &AdapterContext) -> Result<DownloadedComic, SourceError> {
        let cookie = ctx.auth_str("cookie")?.to_string();
        let id = canonical_id(Source::Ehentai, &ctx.target)
            .map_err(|e| SourceError::upstream(e.to_string()))?;

        let headers = cookie_headers(&cookie)?;
        let opts = ctx.text_opts().with_headers(headers.clone());

        let landing = ctx
            .fetcher
            .get_bytes_with_retry(&ctx.target, &opts, &ctx.stop)
            .await?;
        let html = String::from_utf8_lossy(&landing.body).into_owned();
        let meta = parse_gallery(&html)
            .map_err(|reason| upstream_with_snippet(reason, &landing.body))?;

        // Collect reader links across the thumbnail pages. The first page is
        // already in hand; per-page capacity comes from its link count.
        let mut reader_urls = parse_thumb_links(&html);
        if reader_urls.is_empty() {
            return Err(upstream_with_snippet("no thumbnails on gallery page", &landing.body));
        }
        let per_page = reader_urls.len();
        let thumb_pages = meta.page_count.div_ceil(per_page);
        for p in 1..thumb_pages {
            ctx.stop.check()?;
            let url = page_url(&ctx.target, p);
            let listing = ctx.fetcher.get_bytes_with_retry(&url, &opts, &ctx.stop).await?;
            let listing_html = String::from_utf8_lossy(&listing.body).into_owned();
            reader_urls.extend(parse_thumb_links(&listing_html));
        }
        if reader_urls.len() < meta.page_count {
            return Err(SourceError::upstream(format!(
                "expected {} reader pages, found {}",
                meta.page_count,
                reader_urls.len()
            )));
        }
        reader_urls.truncate(meta.page_count);

        let pages_dir = ctx.work_dir.join("pages");
        tokio::fs::create_dir_all(&pages_dir).await?;

        let total = reader_urls.len() as u64 + u64::from(meta.cover_url.is_some());
        ctx.progress.set_total(total).await;
        ctx.progress.ensure_at_least(count_downloaded(&ctx.work_dir)).await;

        if let Some(cover_url) = &meta.cover_url {
            let cover_dst = ctx.work_dir.join("cover.jpg");
            if !super::file_present(&cover_dst) {
                let cover_opts = ctx.image_opts().with_headers(headers.clone());
                ctx.fetcher
                    .download_to_file(cover_url, &cover_dst, &cover_opts, &ctx.stop)
                    .await?;
                ctx.progress.advance(1).await;
            }
        }

        run_reader_jobs(ctx, reader_urls, pages_dir, headers).await?;

        let downloaded_json = serde_json::json!({
            "title": meta.title,
            "subtitle": meta.subtitle,
            "uploader": meta.uploader,
            "pages": meta.page_count,
            "tags": meta.tags,
            "gallery": ctx.target,
        });

        Ok(DownloadedComic::new(
            Source::Ehentai,
            id,
            meta.title.clone(),
            meta.subtitle.clone(),
            meta.tags.clone(),
            downloaded_json,
        ))
    }
}

/// One reader-page job: fetch the page, extract the image, fetch the image.
async fn run_reader_jobs(
    ctx: &AdapterContext,
    reader_urls: Vec<String>,
    pages_dir: std::path::PathBuf,
    headers: HeaderMap,
) -> Result<(), SourceError> {
    let fetcher = ctx.fetcher.clone();
    let progress = Arc::clone(&ctx.progress);
    let stop = ctx.stop.clone();
    let retries = ctx.file_retries;

    let jobs: Vec<(usize, String)> = reader_urls.into_iter().enumerate().collect();

    run_jobs(
        jobs,
        ctx.file_concurrent,
        &ctx.stop,
        move |(index, reader_url): (usize, String)| {
            let fetcher = fetcher.clone();
            let progress = Arc::clone(&progress);
            let stop = stop.clone();
            let headers = headers.clone();
            let pages_dir = pages_dir.clone();
            async move {
                let n = index + 1;
                if page_file_exists(&pages_dir, n) {
                    return Ok(());
                }

                let image_url =
                    fetch_reader_image_url(&fetcher, &reader_url, &headers, retries, &stop).await?;
                let ext = ext_from_url(&image_url);
                let dst = pages_dir.join(format!("{n}.{ext}"));
                let opts = FetchOptions::image()
                    .with_retries(retries)
                    .with_headers(headers);
                fetcher.download_to_file(&image_url, &dst, &opts, &stop).await?;
                progress.advance(1).await;
                Ok(())
            }
        },
        || {},
    )
    .await
}

async fn fetch_reader_image_url(
    fetcher: &Fetcher,
    reader_url: &str,
    headers: &HeaderMap,
    retries: u32,
    stop: &StopToken,
) -> Result<String, SourceError> {
    let opts = FetchOptions::text()
        .with_retries(retries)
        .with_headers(headers.clone());
    let page = fetcher.get_bytes_with_retry(reader_url, &opts, stop).await?;
    let html = String::from_utf8_lossy(&page.body).into_owned();

    let image_url = parse_reader_image(&html)
        .ok_or_else(|| upstream_with_snippet("no image on reader page", &page.body))?;
    if image_url.contains("509.gif") {
        return Err(SourceError::upstream("image limit exceeded"));
    }
    Ok(image_url)
}

fn cookie_headers(cookie: &str) -> Result<HeaderMap, SourceError> {
    let mut headers = HeaderMap::new();
    let value = HeaderValue::from_str(cookie)
        .map_err(|_| SourceError::upstream("cookie contains unencodable bytes"))?;
    headers.insert(COOKIE, value);
    Ok(headers)
}

fn upstream_with_snippet(reason: &str, body: &[u8]) -> SourceError {
    let snippet = body_snippet(body);
    if snippet.is_empty() {
        SourceError::upstream(reason.to_string())
    } else {
        SourceError::upstream(format!("{reason}: {snippet}"))
    }
}

/// Appends/overrides the `p` query parameter on the gallery URL.
fn page_url(target: &str, p: usize) -> String {
    if target.contains('?') {
        format!("{target}&p={p}")
    } else {
        format!("{target}?p={p}")
    }
}

// ---- pure HTML extraction (sync, so nothing !Send crosses an await) -------

fn parse_gallery(html: &str) -> Result<GalleryMeta, &'static str> {
    let doc = Html::parse_document(html);
    let select = |css: &str| Selector::parse(css).ok();

    let text_of = |css: &str| -> Option<String> {
        let selector = select(css)?;
        let element = doc.select(&selector).next()?;
        let text: String = element.text().collect::<String>().trim().to_string();
        if text.is_empty() { None } else { Some(text) }
    };

    let title = text_of("#gn").ok_or("no gallery title (#gn)")?;
    let subtitle = text_of("#gj").unwrap_or_default();
    let uploader = text_of("#gdn").unwrap_or_default();

    // "NN pages" appears in the #gdd details table.
    let details = text_of("#gdd").unwrap_or_default();
    let page_count = page_count_from_details(&details).ok_or("no page count in #gdd")?;

    let tags = parse_tags(&doc);
    let cover_url = parse_cover(&doc);

    Ok(GalleryMeta {
        title,
        subtitle,
        uploader,
        page_count,
        tags,
        cover_url,
    })
}

fn page_count_from_details(details: &str) -> Option<usize> {
    let re = Regex::new(r"(\d+)\s+pages?").ok()?;
    let captures = re.captures(details)?;
    captures.get(1)?.as_str().parse().ok()
}

/// Tag taxonomy rows: `td.tc` holds the namespace ("artist:"), the sibling
/// cell holds the values.
fn parse_tags(doc: &Html) -> Vec<String> {
    let mut tags = Vec::new();
    let Ok(row_selector) = Selector::parse("#taglist tr") else {
        return tags;
    };
    let Ok(namespace_selector) = Selector::parse("td.tc") else {
        return tags;
    };
    let Ok(value_selector) = Selector::parse("td div a, td a") else {
        return tags;
    };

    for row in doc.select(&row_selector) {
        let namespace = row
            .select(&namespace_selector)
            .next()
            .map(|cell| {
                cell.text()
                    .collect::<String>()
                    .trim()
                    .trim_end_matches(':')
                    .to_string()
            })
            .unwrap_or_default();
        for value in row.select(&value_selector) {
            let value: String = value.text().collect::<String>().trim().to_string();
            if value.is_empty() {
                continue;
            }
            if namespace.is_empty() {
                tags.push(value);
            } else {
                tags.push(format!("{namespace}:{value}"));
            }
        }
    }
    tags
}

/// Cover from the `#gd1` container's inline `background:url(...)` style.
fn parse_cover(doc: &Html) -> Option<String> {
    let selector = Selector::parse("#gd1 div").ok()?;
    let style = doc.select(&selector).next()?.value().attr("style")?;
    let re = Regex::new(r"url\(([^)]+)\)").ok()?;
    let url = re.captures(style)?.get(1)?.as_str().trim_matches(['\'', '"']);
    Some(url.to_string())
}

/// Reader-page links from a thumbnail listing (`#gdt a`).
fn parse_thumb_links(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let Ok(selector) = Selector::parse("#gdt a") else {
        return Vec::new();
    };
    doc.select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .map(ToString::to_string)
        .collect()
}

/// The full-size image on a reader page (`#i3 > a > img[src]`).
fn parse_reader_image(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let selector = Selector::parse("#i3 a img").ok()?;
    doc.select(&selector)
        .next()?
        .value()
        .attr("src")
        .map(ToString::to_string)
}
