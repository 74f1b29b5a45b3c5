//! Image re-hosting pipeline.
//!
//! Candidates are first filtered down to the images the final document body
//! actually references, then uploaded strictly one at a time. Each success
//! rewrites the body in place; each failure keeps the original URL and the
//! batch moves on. Cancellation is polled between images only.

use crate::models::ImageInfo;
use crate::outline::{Download, OutlineClient, OutlineError};
use base64::Engine;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Consecutive 401s after which the rest of the batch is skipped.
pub const AUTH_FAILURE_LIMIT: usize = 2;

// ── Policy ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt, on 429 only.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub inter_image_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            inter_image_delay: Duration::from_millis(750),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base, 2×base, 4×base...
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ImageUploadError {
    #[error("image is {0} bytes, above the 10MB limit")]
    TooLarge(usize),
    #[error("not an image (content type {0:?})")]
    NotAnImage(String),
    #[error("malformed data URL: {0}")]
    InvalidDataUrl(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("still rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("upload unauthorized: {0}")]
    Unauthorized(String),
    #[error("upload failed: {0}")]
    Remote(String),
}

impl From<OutlineError> for ImageUploadError {
    fn from(err: OutlineError) -> Self {
        match err {
            OutlineError::Auth(message) => ImageUploadError::Unauthorized(message),
            OutlineError::RateLimited { .. } => ImageUploadError::RateLimited { attempts: 1 },
            other => ImageUploadError::Remote(other.to_string()),
        }
    }
}

// ── Progress & outcome ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    /// 1-based index of the image just handled.
    pub index: usize,
    pub total: usize,
    pub image: String,
    pub uploaded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineStatus {
    Done,
    Stopped,
    AuthFailed,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub content: String,
    /// Referenced images, with `outline_url` set on the ones that were hosted.
    pub images: Vec<ImageInfo>,
    pub processed: usize,
    pub uploaded: usize,
    pub status: PipelineStatus,
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub struct ImagePipeline<'a> {
    client: &'a OutlineClient,
    policy: RetryPolicy,
}

impl<'a> ImagePipeline<'a> {
    pub fn new(client: &'a OutlineClient, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Upload every referenced image in order and rewrite `body` as each one
    /// lands. Never fails; per-image problems keep the original URL.
    pub async fn run(
        &self,
        body: String,
        candidates: Vec<ImageInfo>,
        cancel: &CancellationToken,
        progress: &mut (dyn FnMut(&UploadProgress) + Send),
    ) -> PipelineOutcome {
        let mut images = filter_referenced(&body, candidates);
        let total = images.len();
        let mut content = body;
        let mut processed = 0;
        let mut uploaded = 0;
        let mut auth_failures = 0;
        let mut status = PipelineStatus::Done;

        tracing::info!(total, "pipeline.start");

        for i in 0..total {
            if cancel.is_cancelled() {
                status = PipelineStatus::Stopped;
                break;
            }
            if auth_failures >= AUTH_FAILURE_LIMIT {
                tracing::warn!(
                    skipped = total - i,
                    "pipeline.auth_failed; keeping original URLs for the rest"
                );
                status = PipelineStatus::AuthFailed;
                break;
            }
            if i > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        status = PipelineStatus::Stopped;
                        break;
                    }
                    _ = sleep(self.policy.inter_image_delay) => {}
                }
            }

            let result = self.upload_image(&images[i], i).await;
            let ok = match result {
                Ok(hosted) => {
                    let (rewritten, replaced) =
                        rewrite_image_url(&content, &images[i], &hosted, &images);
                    tracing::info!(
                        image = %images[i].original_url,
                        hosted = %hosted,
                        replaced,
                        "pipeline.image.uploaded"
                    );
                    content = rewritten;
                    images[i].outline_url = Some(hosted);
                    uploaded += 1;
                    auth_failures = 0;
                    true
                }
                Err(err) => {
                    tracing::warn!(
                        image = %images[i].original_url,
                        error = %err,
                        "pipeline.image.kept_original"
                    );
                    if matches!(err, ImageUploadError::Unauthorized(_)) {
                        auth_failures += 1;
                    } else {
                        auth_failures = 0;
                    }
                    false
                }
            };
            processed += 1;
            progress(&UploadProgress {
                index: i + 1,
                total,
                image: images[i].original_url.clone(),
                uploaded: ok,
            });
        }

        tracing::info!(processed, uploaded, total, status = ?status, "pipeline.done");

        PipelineOutcome {
            content,
            images,
            processed,
            uploaded,
            status,
        }
    }

    /// Host a single image, retrying only the remote steps on 429.
    pub async fn upload_image(
        &self,
        image: &ImageInfo,
        index: usize,
    ) -> Result<String, ImageUploadError> {
        let download = self.fetch_image(&image.original_url).await?;
        let name = file_name_for(&image.original_url, &download.content_type, index);

        let mut retries = 0;
        loop {
            match self.send(&download, &name).await {
                Ok(hosted) => return Ok(hosted),
                Err(OutlineError::RateLimited { retry_after }) => {
                    if retries >= self.policy.max_retries {
                        return Err(ImageUploadError::RateLimited {
                            attempts: retries + 1,
                        });
                    }
                    retries += 1;
                    let delay = self.policy.delay_for(retries);
                    tracing::warn!(
                        image = %image.original_url,
                        attempt = retries,
                        backoff_ms = delay.as_millis() as u64,
                        retry_after_secs = ?retry_after,
                        "pipeline.retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Hosted URL on success, the original URL otherwise.
    pub async fn upload_or_original(&self, image: &ImageInfo) -> String {
        match self.upload_image(image, 0).await {
            Ok(hosted) => hosted,
            Err(err) => {
                tracing::warn!(image = %image.original_url, error = %err, "pipeline.image.kept_original");
                image.original_url.clone()
            }
        }
    }

    async fn fetch_image(&self, url: &str) -> Result<Download, ImageUploadError> {
        let download = if url.starts_with("data:") {
            decode_data_url(url)?
        } else {
            self.client
                .download_image(url, MAX_IMAGE_BYTES)
                .await
                .map_err(|e| match e {
                    OutlineError::TooLarge { size, .. } => ImageUploadError::TooLarge(size),
                    other => ImageUploadError::Download(other.to_string()),
                })?
        };
        validate_image(download, url)
    }

    async fn send(&self, download: &Download, name: &str) -> Result<String, OutlineError> {
        let slot = self
            .client
            .create_attachment(name, &download.content_type, download.bytes.len())
            .await?;
        self.client
            .submit_upload(&slot, download.bytes.clone(), name, &download.content_type)
            .await?;
        Ok(self.client.resolve(&slot.attachment.url))
    }
}

// ── Filtering ────────────────────────────────────────────────────────────────

static MD_IMAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"!\[([^\]]*)\]\(\s*<?([^)\s>]+)>?((?:\s+"[^"]*")?)\s*\)"#).unwrap()
});
static IMG_SRC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(<img\b[^>]*?\bsrc\s*=\s*)(["'])([^"']+)(["'])"#).unwrap()
});

/// Keep only the candidates the body references, by exact substring, by an
/// `<img src>` attribute or by a markdown image reference.
pub fn filter_referenced(body: &str, candidates: Vec<ImageInfo>) -> Vec<ImageInfo> {
    let md_refs: Vec<String> = MD_IMAGE_RE
        .captures_iter(body)
        .map(|c| normalize_ref(&c[2]))
        .collect();
    let src_refs: Vec<String> = IMG_SRC_RE
        .captures_iter(body)
        .map(|c| normalize_ref(&c[3]))
        .collect();

    candidates
        .into_iter()
        .filter(|image| {
            let keys = reference_keys(image);
            let found = keys.iter().any(|k| body.contains(k.as_str()))
                || src_refs.iter().any(|r| keys.iter().any(|k| normalize_ref(k) == *r))
                || md_refs.iter().any(|r| keys.iter().any(|k| normalize_ref(k) == *r));
            if !found {
                tracing::warn!(
                    image = %image.original_url,
                    markdown_url = %image.markdown_url,
                    "pipeline.image.unreferenced; dropped"
                );
            }
            found
        })
        .collect()
}

fn reference_keys(image: &ImageInfo) -> Vec<String> {
    let mut keys = Vec::with_capacity(2);
    for key in [&image.markdown_url, &image.original_url] {
        let key = key.trim();
        if !key.is_empty() && !keys.iter().any(|k: &String| k == key) {
            keys.push(key.to_string());
        }
    }
    keys
}

fn normalize_ref(raw: &str) -> String {
    let raw = raw.trim().replace("&amp;", "&");
    Url::parse(&raw)
        .map(|u| u.to_string())
        .unwrap_or(raw)
}

// ── Rewriting ────────────────────────────────────────────────────────────────

/// Replace every reference to `image` in `body` with `hosted`. Returns the new
/// body and the number of replacements.
///
/// Passes run in order: exact substring, markdown image reference, HTML `src`
/// attribute. The path-only pass runs only when nothing else matched and no
/// other image in `batch` shares the path.
pub fn rewrite_image_url(
    body: &str,
    image: &ImageInfo,
    hosted: &str,
    batch: &[ImageInfo],
) -> (String, usize) {
    let keys = reference_keys(image);
    let normalized: Vec<String> = keys.iter().map(|k| normalize_ref(k)).collect();
    let mut out = body.to_string();
    let mut replaced = 0;

    for key in keys.iter().filter(|k| k.as_str() != hosted) {
        let (rewritten, count) = replace_whole_refs(&out, key, hosted);
        out = rewritten;
        replaced += count;
    }

    out = MD_IMAGE_RE
        .replace_all(&out, |c: &Captures| {
            if normalized.contains(&normalize_ref(&c[2])) {
                replaced += 1;
                format!("![{}]({}{})", &c[1], hosted, &c[3])
            } else {
                c[0].to_string()
            }
        })
        .into_owned();

    out = IMG_SRC_RE
        .replace_all(&out, |c: &Captures| {
            if normalized.contains(&normalize_ref(&c[3])) {
                replaced += 1;
                format!("{}{}{}{}", &c[1], &c[2], hosted, &c[4])
            } else {
                c[0].to_string()
            }
        })
        .into_owned();

    if replaced == 0 {
        if let Some((rewritten, count)) = rewrite_by_path(&out, image, hosted, batch) {
            out = rewritten;
            replaced = count;
        }
    }

    (out, replaced)
}

/// Replace occurrences of `key` that end where a reference ends, so a URL
/// that merely starts with `key` is left alone.
fn replace_whole_refs(body: &str, key: &str, hosted: &str) -> (String, usize) {
    let mut out = String::with_capacity(body.len());
    let mut last = 0;
    let mut count = 0;
    for (start, _) in body.match_indices(key) {
        if start < last {
            continue;
        }
        let end = start + key.len();
        let bounded = body[end..]
            .chars()
            .next()
            .map_or(true, |c| matches!(c, ')' | '"' | '\'' | '>') || c.is_whitespace());
        if bounded {
            out.push_str(&body[last..start]);
            out.push_str(hosted);
            last = end;
            count += 1;
        }
    }
    out.push_str(&body[last..]);
    (out, count)
}

fn rewrite_by_path(
    body: &str,
    image: &ImageInfo,
    hosted: &str,
    batch: &[ImageInfo],
) -> Option<(String, usize)> {
    let original = Url::parse(&image.original_url).ok()?;
    let path = original.path();
    if path.len() <= 1 {
        return None;
    }
    let shared = batch.iter().any(|other| {
        other.original_url != image.original_url
            && Url::parse(&other.original_url)
                .map(|u| u.path() == path)
                .unwrap_or(false)
    });
    if shared {
        tracing::debug!(image = %image.original_url, "pipeline.rewrite.path_ambiguous");
        return None;
    }

    let re = Regex::new(&format!(
        r#"([("'])((?:https?:)?//[^/\s)"']+)?{}([)"'\s])"#,
        regex::escape(path)
    ))
    .ok()?;
    let mut count = 0;
    let out = re
        .replace_all(body, |c: &Captures| {
            count += 1;
            format!("{}{}{}", &c[1], hosted, &c[3])
        })
        .into_owned();
    (count > 0).then_some((out, count))
}

// ── Bytes ────────────────────────────────────────────────────────────────────

/// Decode a `data:` URL (base64 or percent-encoded payload).
pub fn decode_data_url(url: &str) -> Result<Download, ImageUploadError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| ImageUploadError::InvalidDataUrl("missing data: prefix".into()))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| ImageUploadError::InvalidDataUrl("missing payload".into()))?;

    let mut parts = meta.split(';');
    let content_type = parts.next().unwrap_or("").trim().to_lowercase();
    let is_base64 = parts.any(|p| p.trim().eq_ignore_ascii_case("base64"));

    let bytes = if is_base64 {
        let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        base64::engine::general_purpose::STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| ImageUploadError::InvalidDataUrl(e.to_string()))?
    } else {
        percent_decode(payload)
    };

    Ok(Download {
        bytes,
        content_type,
    })
}

fn percent_decode(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

fn validate_image(mut download: Download, url: &str) -> Result<Download, ImageUploadError> {
    if download.bytes.len() > MAX_IMAGE_BYTES {
        return Err(ImageUploadError::TooLarge(download.bytes.len()));
    }
    if !download.content_type.starts_with("image/") {
        match guess_mime(url) {
            Some(mime) if download.content_type.is_empty()
                || download.content_type == "application/octet-stream" =>
            {
                download.content_type = mime.to_string();
            }
            _ => return Err(ImageUploadError::NotAnImage(download.content_type)),
        }
    }
    Ok(download)
}

fn guess_mime(url: &str) -> Option<&'static str> {
    let path = Url::parse(url).map(|u| u.path().to_lowercase()).ok()?;
    let ext = path.rsplit_once('.')?.1;
    Some(match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "avif" => "image/avif",
        "bmp" => "image/bmp",
        _ => return None,
    })
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "image/avif" => "avif",
        "image/bmp" => "bmp",
        _ => "png",
    }
}

/// Attachment name from the URL's last path segment, falling back to
/// `image-<n>.<ext>`.
fn file_name_for(url: &str, content_type: &str, index: usize) -> String {
    let ext = extension_for(content_type);
    let segment = Url::parse(url)
        .ok()
        .filter(|u| u.scheme() != "data")
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty());

    match segment {
        Some(seg) => {
            let clean: String = seg
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
                .collect();
            if clean.contains('.') {
                clean
            } else {
                format!("{clean}.{ext}")
            }
        }
        None => format!("image-{}.{}", index + 1, ext),
    }
}
