//! nhentai adapter: plain JSON gallery API, flat page layout.
//!
//! `GET {api}/api/gallery/{id}` yields the media id, typed page list and
//! tags. Image hosts follow the fixed `t.`/`i.` pattern unless the auth blob
//! overrides them (used by tests and mirrors).

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;

use super::{
    AdapterContext, FileJob, SourceAdapter, SourceError, count_downloaded, download_files,
};
use crate::comic::{DownloadedComic, Source, canonical_id};

const DEFAULT_API_BASE: &str = "https://nhentai.net";
const DEFAULT_IMAGE_BASE: &str = "https://i.nhentai.net";
const DEFAULT_THUMB_BASE: &str = "https://t.nhentai.net";

#[derive(Debug, Deserialize)]
struct Gallery {
    media_id: Option<serde_json::Value>,
    #[serde(default)]
    title: Title,
    images: Option<Images>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Default, Deserialize)]
struct Title {
    english: Option<String>,
    japanese: Option<String>,
    pretty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Images {
    cover: Option<PageImage>,
    #[serde(default)]
    pages: Vec<PageImage>,
}

#[derive(Debug, Deserialize)]
struct PageImage {
    /// One-letter image type: j/p/g/w.
    t: String,
}

#[derive(Debug, Deserialize)]
struct Tag {
    #[serde(rename = "type")]
    kind: String,
    name: String,
}

/// Adapter for the plain JSON API source.
pub struct NhentaiAdapter;

#[async_trait]
impl SourceAdapter for NhentaiAdapter {
    fn source(&self) -> Source {
        Source::Nhentai
    }

    async fn run(&self, ctx: &AdapterContext) -> Result<DownloadedComic, SourceError> {
        let id = canonical_id(Source::Nhentai, &ctx.target)
            .map_err(|e| SourceError::upstream(e.to_string()))?;
        let numeric = id.trim_start_matches("nhentai");

        let api_base = trim_base(ctx.auth_opt("apiBaseUrl").unwrap_or(DEFAULT_API_BASE));
        let image_base = trim_base(ctx.auth_opt("imageBaseUrl").unwrap_or(DEFAULT_IMAGE_BASE));
        let thumb_base = trim_base(ctx.auth_opt("thumbBaseUrl").unwrap_or(DEFAULT_THUMB_BASE));

        let url = format!("{api_base}/api/gallery/{numeric}");
        let raw: serde_json::Value = ctx.fetcher.get_json(&url, &ctx.text_opts(), &ctx.stop).await?;
        let gallery: Gallery = serde_json::from_value(raw.clone())
            .map_err(|_| SourceError::upstream("unexpected gallery shape"))?;

        let media_id = media_id(&gallery)?;
        let images = gallery
            .images
            .ok_or_else(|| SourceError::upstream("gallery has no images"))?;
        if images.pages.is_empty() {
            return Err(SourceError::upstream("gallery page list is empty"));
        }

        let pages_dir = ctx.work_dir.join("pages");
        tokio::fs::create_dir_all(&pages_dir).await?;

        // Cover counts as one work unit.
        let mut jobs = Vec::with_capacity(images.pages.len() + 1);
        if let Some(cover) = &images.cover {
            jobs.push(FileJob {
                url: format!(
                    "{thumb_base}/galleries/{media_id}/cover.{}",
                    ext_for(&cover.t)?
                ),
                dst: ctx.work_dir.join("cover.jpg"),
                headers: HeaderMap::new(),
            });
        }
        for (index, page) in images.pages.iter().enumerate() {
            let n = index + 1;
            let ext = ext_for(&page.t)?;
            jobs.push(FileJob {
                url: format!("{image_base}/galleries/{media_id}/{n}.{ext}"),
                dst: pages_dir.join(format!("{n}.{ext}")),
                headers: HeaderMap::new(),
            });
        }

        ctx.progress.set_total(jobs.len() as u64).await;
        ctx.progress.ensure_at_least(count_downloaded(&ctx.work_dir)).await;

        download_files(ctx, jobs).await?;

        let title = gallery
            .title
            .english
            .clone()
            .or_else(|| gallery.title.pretty.clone())
            .or_else(|| gallery.title.japanese.clone())
            .unwrap_or_else(|| id.clone());
        let subtitle = gallery.title.japanese.clone().unwrap_or_default();
        let tags = gallery
            .tags
            .iter()
            .map(|tag| {
                if tag.kind == "tag" {
                    tag.name.clone()
                } else {
                    format!("{}:{}", tag.kind, tag.name)
                }
            })
            .collect();

        Ok(DownloadedComic::new(
            Source::Nhentai,
            id,
            title,
            subtitle,
            tags,
            raw,
        ))
    }
}

/// Maps the API's one-letter image type to a file extension.
fn ext_for(t: &str) -> Result<&'static str, SourceError> {
    match t {
        "j" => Ok("jpg"),
        "p" => Ok("png"),
        "g" => Ok("gif"),
        "w" => Ok("webp"),
        other => Err(SourceError::upstream(format!("unknown image type '{other}'"))),
    }
}

fn media_id(gallery: &Gallery) -> Result<String, SourceError> {
    match &gallery.media_id {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => Err(SourceError::upstream("missing media_id in gallery")),
    }
}

fn trim_base(base: &str) -> String {
    base.trim_end_matches('/').to_string()
}
