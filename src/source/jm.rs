//! jm adapter: token-authenticated API with encrypted payloads and
//! scrambled images.
//!
//! Every API request carries `token = md5(time + token_key)` and
//! `tokenparam = "time,appVersion"`. Response bodies arrive as
//! base64(AES-128-ECB(json)) keyed by `md5(time + data_secret)`; the
//! decrypted text is right-trimmed to the last `}` or `]` before parsing.
//!
//! Images are split into N horizontal bands stacked in reverse order, where
//! N derives from `(chapterId, pictureName, scrambleId)`; the adapter
//! reassembles them and re-encodes as JPEG. An unreadable image or a
//! non-`image/*` content type is a hard error.

use std::sync::Arc;

use aes::Aes128;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, KeyInit};
use image::codecs::jpeg::JpegEncoder;
use image::{RgbImage, imageops};
use md5::{Digest, Md5};
use serde::Deserialize;

use super::{
    AdapterContext, SourceAdapter, SourceError, count_downloaded, file_present, page_file_exists,
};
use crate::comic::{DownloadedComic, Source, canonical_id};
use crate::fanout::run_jobs;
use crate::fetch::FetchOptions;

/// Key material mixed into the `token` header.
const TOKEN_KEY: &str = "18comicAPPContent";

/// Key material mixed into the AES payload key.
const DATA_SECRET: &str = "185Hcomic3PAPP7R";

/// Default scramble threshold when auth does not override it.
const DEFAULT_SCRAMBLE_ID: &str = "220980";

/// JPEG quality for re-encoded descrambled pages.
const JPEG_QUALITY: u8 = 91;

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    /// base64(AES-128-ECB(json)).
    data: String,
}

#[derive(Debug, Deserialize)]
struct Album {
    name: String,
    #[serde(default)]
    author: serde_json::Value,
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    id: serde_json::Value,
    #[serde(default)]
    sort: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Chapter {
    #[serde(default)]
    images: Vec<String>,
}

/// Adapter for the encrypted-API source.
pub struct JmAdapter;

impl JmAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for JmAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for JmAdapter {
    fn source(&self) -> Source {
        Source::Jm
    }

    async fn run(&self, ctx: &AdapterContext) -> Result<DownloadedComic, SourceError> {
        let api_base = ctx.auth_str("apiBaseUrl")?.trim_end_matches('/').to_string();
        let img_base = ctx.auth_str("imgBaseUrl")?.trim_end_matches('/').to_string();
        let app_version = ctx.auth_str("appVersion")?.to_string();
        let scramble_id: u64 = ctx
            .auth_opt("scrambleId")
            .unwrap_or(DEFAULT_SCRAMBLE_ID)
            .parse()
            .map_err(|_| SourceError::upstream("scrambleId is not numeric"))?;

        let id = canonical_id(Source::Jm, &ctx.target)
            .map_err(|e| SourceError::upstream(e.to_string()))?;
        let numeric = id.trim_start_matches("jm").to_string();

        let api = JmApi {
            api_base,
            app_version,
        };

        let (album_json, album) = api.get::<Album>(ctx, &format!("album?id={numeric}")).await?;

        // Chapter list in display order; a series-less album is its own
        // single chapter.
        let mut chapters: Vec<u64> = Vec::new();
        if album.series.is_empty() {
            let album_id = numeric
                .parse()
                .map_err(|_| SourceError::upstream("album id is not numeric"))?;
            chapters.push(album_id);
        } else {
            let mut series: Vec<(i64, u64)> = Vec::with_capacity(album.series.len());
            for (index, entry) in album.series.iter().enumerate() {
                let chapter = parse_u64(&entry.id)
                    .ok_or_else(|| SourceError::upstream("series id is not numeric"))?;
                #[allow(clippy::cast_possible_wrap)]
                let sort = parse_u64(&entry.sort).map_or(index as i64, |s| s as i64);
                series.push((sort, chapter));
            }
            series.sort_by_key(|(sort, _)| *sort);
            chapters.extend(series.into_iter().map(|(_, chapter)| chapter));
        }

        let selected: Vec<usize> = match ctx.params.selected_eps() {
            Some(eps) => eps
                .into_iter()
                .map(|ep| ep as usize)
                .filter(|index| *index < chapters.len())
                .collect(),
            None => (0..chapters.len()).collect(),
        };

        // Enumerate every selected chapter before downloading anything.
        // The staging layout is chaptered even for a single-episode album.
        let mut jobs: Vec<PageJob> = Vec::new();
        for display_index in &selected {
            let chapter_id = chapters[*display_index];
            let (_, chapter) = api
                .get::<Chapter>(ctx, &format!("chapter?id={chapter_id}"))
                .await?;
            if chapter.images.is_empty() {
                return Err(SourceError::upstream(format!(
                    "chapter {chapter_id} has no images"
                )));
            }
            let ep_dir = ctx.work_dir.join("pages").join((display_index + 1).to_string());
            tokio::fs::create_dir_all(&ep_dir).await?;

            for (index, name) in chapter.images.iter().enumerate() {
                jobs.push(PageJob {
                    url: format!("{img_base}/media/photos/{chapter_id}/{name}"),
                    dir: ep_dir.clone(),
                    n: index + 1,
                    segments: segment_count(chapter_id, scramble_id, stem(name)),
                    ext: super::ext_from_url(name),
                });
            }
        }

        let cover_dst = ctx.work_dir.join("cover.jpg");
        let cover_url = format!("{img_base}/media/albums/{numeric}.jpg");

        ctx.progress.set_total(jobs.len() as u64 + 1).await;
        ctx.progress.ensure_at_least(count_downloaded(&ctx.work_dir)).await;

        // Cover is a plain transfer; page jobs descramble in-memory.
        if !file_present(&cover_dst) {
            ctx.fetcher
                .download_to_file(&cover_url, &cover_dst, &ctx.image_opts(), &ctx.stop)
                .await?;
            ctx.progress.advance(1).await;
        }

        run_page_jobs(ctx, jobs).await?;

        let author = author_text(&album.author);
        let downloaded_json = album_json;

        Ok(DownloadedComic::new(
            Source::Jm,
            id,
            album.name.clone(),
            author,
            album.tags.clone(),
            downloaded_json,
        ))
    }
}

#[derive(Debug, Clone)]
struct PageJob {
    url: String,
    dir: std::path::PathBuf,
    n: usize,
    segments: u32,
    ext: String,
}

async fn run_page_jobs(ctx: &AdapterContext, jobs: Vec<PageJob>) -> Result<(), SourceError> {
    let fetcher = ctx.fetcher.clone();
    let progress = Arc::clone(&ctx.progress);
    let stop = ctx.stop.clone();
    let retries = ctx.file_retries;

    run_jobs(
        jobs,
        ctx.file_concurrent,
        &ctx.stop,
        move |job: PageJob| {
            let fetcher = fetcher.clone();
            let progress = Arc::clone(&progress);
            let stop = stop.clone();
            let opts = FetchOptions::image().with_retries(retries);
            async move {
                if page_file_exists(&job.dir, job.n) {
                    return Ok(());
                }

                let fetched = fetcher.get_bytes_with_retry(&job.url, &opts, &stop).await?;
                let content_type = fetched.content_type.as_deref().unwrap_or("");
                if !content_type.starts_with("image/") {
                    return Err(SourceError::upstream(format!(
                        "non-image response ({content_type}) for {}",
                        job.url
                    )));
                }

                let (bytes, ext) = if job.segments > 1 {
                    (descramble(&fetched.body, job.segments)?, "jpg".to_string())
                } else {
                    (fetched.body, job.ext.clone())
                };

                let dst = job.dir.join(format!("{}.{ext}", job.n));
                tokio::fs::write(&dst, bytes).await.map_err(SourceError::from)?;
                progress.advance(1).await;
                Ok(())
            }
        },
        || {},
    )
    .await
}

/// Per-request API helper.
struct JmApi {
    api_base: String,
    app_version: String,
}

impl JmApi {
    /// Fetches and decrypts one endpoint; returns both the raw JSON value
    /// (preserved for the client) and the typed parse.
    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        ctx: &AdapterContext,
        path_and_query: &str,
    ) -> Result<(serde_json::Value, T), SourceError> {
        let time = (crate::db::now_millis() / 1000).to_string();

        let mut headers = reqwest::header::HeaderMap::new();
        let token = md5_hex(&format!("{time}{TOKEN_KEY}"));
        let tokenparam = format!("{time},{}", self.app_version);
        insert_header(&mut headers, "token", &token)?;
        insert_header(&mut headers, "tokenparam", &tokenparam)?;

        let url = format!("{}/{path_and_query}", self.api_base);
        let opts = ctx.text_opts().with_headers(headers);
        let envelope: Envelope = ctx.fetcher.get_json(&url, &opts, &ctx.stop).await?;
        if envelope.code != 200 {
            return Err(SourceError::upstream(format!(
                "api answered code {} for {path_and_query}",
                envelope.code
            )));
        }

        let plaintext = decrypt_payload(&envelope.data, &time)?;
        let value: serde_json::Value = serde_json::from_str(&plaintext)
            .map_err(|_| SourceError::upstream("decrypted payload is not JSON"))?;
        let typed: T = serde_json::from_value(value.clone())
            .map_err(|_| SourceError::upstream("unexpected payload shape"))?;
        Ok((value, typed))
    }
}

fn insert_header(
    headers: &mut reqwest::header::HeaderMap,
    name: &'static str,
    value: &str,
) -> Result<(), SourceError> {
    let value = reqwest::header::HeaderValue::from_str(value)
        .map_err(|_| SourceError::upstream(format!("unencodable header {name}")))?;
    headers.insert(reqwest::header::HeaderName::from_static(name), value);
    Ok(())
}

/// base64 -> AES-128-ECB -> PKCS7 strip -> right-trim to the last `}`/`]`.
fn decrypt_payload(data: &str, time: &str) -> Result<String, SourceError> {
    let raw = BASE64
        .decode(data.trim())
        .map_err(|_| SourceError::upstream("payload is not base64"))?;
    if raw.is_empty() || raw.len() % 16 != 0 {
        return Err(SourceError::upstream("payload length is not a block multiple"));
    }

    let key = Md5::digest(format!("{time}{DATA_SECRET}").as_bytes());
    let cipher = Aes128::new(&key);

    let mut plain = raw;
    for block in plain.chunks_exact_mut(16) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }

    // PKCS7
    let pad = usize::from(*plain.last().unwrap_or(&0));
    if pad == 0 || pad > 16 || pad > plain.len() {
        return Err(SourceError::upstream("payload padding is invalid"));
    }
    plain.truncate(plain.len() - pad);

    let text = String::from_utf8(plain)
        .map_err(|_| SourceError::upstream("decrypted payload is not UTF-8"))?;
    match text.rfind(['}', ']']) {
        Some(index) => Ok(text[..=index].to_string()),
        None => Err(SourceError::upstream("decrypted payload is not JSON")),
    }
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Derives the band count for one image.
pub(crate) fn segment_count(chapter_id: u64, scramble_id: u64, picture_name: &str) -> u32 {
    if chapter_id < scramble_id {
        return 0;
    }
    if chapter_id < 268_850 {
        return 10;
    }
    let h = md5_hex(&format!("{chapter_id}{picture_name}"));
    let c = u32::from(h.as_bytes().last().copied().unwrap_or(0));
    if chapter_id > 421_926 {
        (c % 8) * 2 + 2
    } else {
        (c % 10) * 2 + 2
    }
}

/// Reassembles a scrambled image: N horizontal bands of height
/// `floor(H/N)` (residual rows appended to the last band), stacked in
/// reverse order, re-encoded as JPEG.
pub(crate) fn descramble(bytes: &[u8], segments: u32) -> Result<Vec<u8>, SourceError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|_| SourceError::upstream("unreadable image"))?;
    let src = decoded.to_rgb8();
    let (width, height) = (src.width(), src.height());
    if segments <= 1 || height < segments {
        return encode_jpeg(&src);
    }

    let band_height = height / segments;
    let residual = height % segments;

    let mut out = RgbImage::new(width, height);
    let mut dst_y: i64 = 0;
    for index in (0..segments).rev() {
        let src_y = index * band_height;
        let mut this_height = band_height;
        if index == segments - 1 {
            this_height += residual;
        }
        let band = imageops::crop_imm(&src, 0, src_y, width, this_height).to_image();
        imageops::replace(&mut out, &band, 0, dst_y);
        dst_y += i64::from(this_height);
    }

    encode_jpeg(&out)
}

fn encode_jpeg(img: &RgbImage) -> Result<Vec<u8>, SourceError> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY);
    img.write_with_encoder(encoder)
        .map_err(|_| SourceError::upstream("jpeg encode failed"))?;
    Ok(buffer)
}

/// Filename without its extension.
fn stem(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

fn parse_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn author_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        _ => String::new(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Scrambles an image the way the upstream serves it: the exact inverse
    /// of `descramble`. Consecutive runs of the original are written into
    /// the fixed band grid from the bottom band upwards, so that the
    /// descramble's reverse-stacking walk restores the original.
    fn scramble_reference(img: &RgbImage, segments: u32) -> RgbImage {
        let (width, height) = (img.width(), img.height());
        let band_height = height / segments;
        let residual = height % segments;

        let mut out = RgbImage::new(width, height);
        let mut src_y = 0u32;
        for index in (0..segments).rev() {
            let mut this_height = band_height;
            if index == segments - 1 {
                this_height += residual;
            }
            let band = imageops::crop_imm(img, 0, src_y, width, this_height).to_image();
            imageops::replace(&mut out, &band, 0, i64::from(index * band_height));
            src_y += this_height;
        }
        out
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 251) as u8, (y % 251) as u8, ((x + y) % 251) as u8])
        })
    }

    #[test]
    fn test_segment_count_thresholds() {
        // Below the scramble id: no scrambling.
        assert_eq!(segment_count(100_000, 220_980, "0001"), 0);
        // Between scramble id and the legacy cutoff: fixed 10.
        assert_eq!(segment_count(250_000, 220_980, "0001"), 10);
        // Above the cutoffs the count is hash-derived, even, and in range.
        for chapter in [300_000u64, 500_000] {
            let n = segment_count(chapter, 220_980, "0001");
            assert!(n >= 2 && n % 2 == 0, "derived count {n} out of contract");
            if chapter > 421_926 {
                assert!(n <= 16);
            } else {
                assert!(n <= 20);
            }
        }
    }

    #[test]
    fn test_segment_count_is_deterministic() {
        assert_eq!(
            segment_count(500_000, 220_980, "00012"),
            segment_count(500_000, 220_980, "00012")
        );
    }

    #[test]
    fn test_descramble_restores_scrambled_image() {
        // Height 103 with 4 bands exercises the residual-row path.
        let original = gradient(40, 103);
        let segments = 4;

        let scrambled = scramble_reference(&original, segments);
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(scrambled)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let restored_jpeg = descramble(&png, segments).unwrap();
        let restored = image::load_from_memory(&restored_jpeg).unwrap().to_rgb8();

        assert_eq!(restored.dimensions(), original.dimensions());
        // JPEG is lossy; compare within encoder tolerance.
        let mut max_delta = 0i32;
        for (a, b) in original.pixels().zip(restored.pixels()) {
            for channel in 0..3 {
                let delta = (i32::from(a[channel]) - i32::from(b[channel])).abs();
                max_delta = max_delta.max(delta);
            }
        }
        assert!(max_delta <= 24, "pixels drifted beyond tolerance: {max_delta}");
    }

    #[test]
    fn test_decrypt_payload_roundtrip() {
        use cipher::BlockEncrypt;

        let time = "1700000000";
        let plaintext = br#"{"name":"x","series":[]}"#;

        // PKCS7 pad + AES-128-ECB encrypt with the derived key.
        let mut padded = plaintext.to_vec();
        let pad = 16 - (padded.len() % 16);
        padded.extend(std::iter::repeat_n(pad as u8, pad));
        let key = Md5::digest(format!("{time}{DATA_SECRET}").as_bytes());
        let cipher = Aes128::new(&key);
        for block in padded.chunks_exact_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        let encoded = BASE64.encode(&padded);

        let decrypted = decrypt_payload(&encoded, time).unwrap();
        assert_eq!(decrypted, String::from_utf8_lossy(plaintext));
    }

    #[test]
    fn test_decrypt_payload_rejects_garbage() {
        assert!(decrypt_payload("not base64!!!", "1").is_err());
        let valid_b64_bad_len = BASE64.encode(b"short");
        assert!(decrypt_payload(&valid_b64_bad_len, "1").is_err());
    }

    #[test]
    fn test_token_derivation_matches_contract() {
        let token = md5_hex(&format!("{}{}", "1700000000", TOKEN_KEY));
        assert_eq!(token.len(), 32);
        assert_eq!(token, md5_hex(&format!("1700000000{TOKEN_KEY}")));
    }

    #[test]
    fn test_author_text_variants() {
        assert_eq!(author_text(&serde_json::json!("solo")), "solo");
        assert_eq!(author_text(&serde_json::json!(["a", "b"])), "a, b");
        assert_eq!(author_text(&serde_json::json!(42)), "");
    }

    #[test]
    fn test_stem_strips_extension() {
        assert_eq!(stem("00012.webp"), "00012");
        assert_eq!(stem("noext"), "noext");
    }
}
