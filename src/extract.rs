use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use url::Url;

use crate::dom::{class_id, collect_text, normalize_text};
use crate::images::{self, is_valid_image_url};
use crate::markdown::Converter;
use crate::models::{ClipperOptions, ImageInfo, PageContent, PageSource};

// ── Constants ────────────────────────────────────────────────────────────────

const USER_AGENT: &str = "outline-clipper/0.1";
const MIN_TEXT_LEN: usize = 200;
const INSECURE_ENV: &str = "OUTLINE_CLIPPER_INSECURE_SSL";

/// Class/id fragments that mark advertisement containers.
const AD_PATTERNS: &[&str] = &[
    "advert",
    "adsbygoogle",
    "ad-container",
    "ad-slot",
    "ad-wrapper",
    "ad-banner",
    "ad-unit",
    "ads-container",
    "google-ad",
    "google_ads",
    "doubleclick",
    "dfp-ad",
    "sponsored",
    "sponsor-",
    "promoted-content",
    "taboola",
    "outbrain",
];

/// Class tokens that mark advertisement containers when they appear alone.
const AD_TOKENS: &[&str] = &["ad", "ads", "advert", "sponsor"];

// ── Lazy static regexes ──────────────────────────────────────────────────────

static KEYWORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(article|content|post|entry|story|body)").unwrap());

static MULTI_NEWLINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

static ANY_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("*").unwrap());
static TITLE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static H1_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").unwrap());
static ARTICLE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("article").unwrap());
static MAIN_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("main").unwrap());
static DIV_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("div").unwrap());
static BODY_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());
static TIME_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("time[datetime]").unwrap());
static JSONLD_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script[type=\"application/ld+json\"]").unwrap());

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("{0}")]
    InvalidUrl(String),
    #[error("URL did not return HTML")]
    NotHtml,
    #[error("Upstream returned an error")]
    Upstream,
    #[error("{0}")]
    Request(String),
    #[error("No readable content found")]
    NoContent,
    #[error("No text selected")]
    EmptySelection,
}

// ── Readability ──────────────────────────────────────────────────────────────

/// Main-content isolation result.
#[derive(Debug, Clone, Default)]
pub struct ReadableArticle {
    pub title: Option<String>,
    pub content_html: String,
    pub excerpt: Option<String>,
    pub byline: Option<String>,
    pub published: Option<String>,
}

/// Pluggable main-content algorithm: DOM in, article (or nothing) out.
pub trait Readability: Send + Sync {
    fn parse(&self, html: &str, url: &Url) -> Option<ReadableArticle>;
}

/// Mozilla Readability port provided by `dom_smoothie`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmoothieReadability;

impl Readability for SmoothieReadability {
    fn parse(&self, html: &str, url: &Url) -> Option<ReadableArticle> {
        let mut reader = match dom_smoothie::Readability::new(html, Some(url.as_str()), None) {
            Ok(reader) => reader,
            Err(err) => {
                tracing::debug!(%url, error = ?err, "readability.init_failed");
                return None;
            }
        };
        let article = match reader.parse() {
            Ok(article) => article,
            Err(err) => {
                tracing::debug!(%url, error = ?err, "readability.no_article");
                return None;
            }
        };
        Some(ReadableArticle {
            title: Some(article.title).filter(|t| !t.trim().is_empty()),
            content_html: article.content.to_string(),
            excerpt: article.excerpt,
            byline: article.byline,
            published: article.published_time,
        })
    }
}

/// Container heuristic: `<article>`, then `<main>`, then the longest
/// content-named `<div>`, then `<body>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContainerHeuristic;

impl Readability for ContainerHeuristic {
    fn parse(&self, html: &str, _url: &Url) -> Option<ReadableArticle> {
        let document = Html::parse_document(html);
        let container = find_container(&document)?;
        let title = container
            .select(&H1_SEL)
            .next()
            .map(|el| normalize_text(&collect_text(el)))
            .filter(|s| !s.is_empty());
        Some(ReadableArticle {
            title,
            content_html: container.inner_html(),
            ..Default::default()
        })
    }
}

// ── Extractor ────────────────────────────────────────────────────────────────

pub struct Extractor {
    readability: Box<dyn Readability>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(Box::new(SmoothieReadability))
    }
}

impl Extractor {
    pub fn new(readability: Box<dyn Readability>) -> Self {
        Self { readability }
    }

    /// Extract title, markdown body, metadata and candidate images.
    ///
    /// The page HTML is parsed into a private tree, so the caller's copy is
    /// never modified. A selection, when present, replaces readability.
    pub fn extract(
        &self,
        page: &PageSource,
        options: &ClipperOptions,
    ) -> Result<PageContent, ExtractionError> {
        let base = Url::parse(&page.url)
            .map_err(|_| ExtractionError::InvalidUrl("Invalid URL".to_string()))?;

        let mut document = Html::parse_document(&page.html);
        let meta = PageMeta::from_document(&document, &base);

        let selection = page
            .selection_html
            .as_deref()
            .filter(|s| !s.trim().is_empty());

        let article = match selection {
            Some(fragment) => ReadableArticle {
                title: None,
                content_html: fragment.to_string(),
                ..Default::default()
            },
            None => {
                if options.remove_ads {
                    let removed = strip_ads(&mut document);
                    tracing::debug!(removed, "extract.ads_stripped");
                }
                let cleaned = document.html();
                self.readability
                    .parse(&cleaned, &base)
                    .filter(|a| has_text(&a.content_html))
                    .or_else(|| {
                        tracing::debug!(url = %base, "extract.readability_fallback");
                        ContainerHeuristic.parse(&cleaned, &base)
                    })
                    .ok_or(ExtractionError::NoContent)?
            }
        };

        if !has_text(&article.content_html) && !has_image(&article.content_html) {
            return Err(ExtractionError::NoContent);
        }

        let mut images = if options.include_images {
            images::discover_images(&article.content_html, &base)
        } else {
            Vec::new()
        };

        let converter = Converter::new(base.clone())
            .simplified(options.simplify_content)
            .include_images(options.include_images)
            .keep_formatting(options.keep_formatting)
            .inline_svg(images::has_inline_svg(&images));
        let mut markdown = converter.convert(&article.content_html);

        let title = article
            .title
            .clone()
            .filter(|_| selection.is_none())
            .or_else(|| meta.title.clone())
            .unwrap_or_else(|| base.host_str().unwrap_or("Untitled").to_string());

        // Use the page's share image when the content itself has none.
        if options.include_images && images.is_empty() && selection.is_none() {
            if let Some(url) = meta.image.clone() {
                let fallback = ImageInfo {
                    original_url: url.clone(),
                    markdown_url: url,
                    alt: Some(title.clone()),
                    ..Default::default()
                };
                markdown = insert_fallback_image(&markdown, &fallback);
                images.push(fallback);
            }
        }

        let markdown = MULTI_NEWLINE_RE
            .replace_all(&markdown, "\n\n")
            .trim()
            .to_string();

        if markdown.is_empty() {
            return Err(ExtractionError::NoContent);
        }

        tracing::info!(
            url = %base,
            title = %title,
            images = images.len(),
            chars = markdown.len(),
            selection = selection.is_some(),
            "extract.done"
        );

        Ok(PageContent {
            title,
            content: markdown,
            url: page.url.clone(),
            excerpt: article.excerpt.or(meta.description),
            author: article.byline.or(meta.author),
            published_date: article.published.or(meta.published),
            images,
            selection: selection.map(|s| normalize_text(&fragment_text(s))),
            highlights: page.highlights.clone().filter(|h| !h.is_empty()),
        })
    }
}

// ── HTTP fetch ───────────────────────────────────────────────────────────────

/// Fetch a page for extraction when the caller only supplied its URL.
pub async fn fetch_page(url: &str) -> Result<String, ExtractionError> {
    validate_url(url)?;
    let insecure = std::env::var(INSECURE_ENV).as_deref() == Ok("1");

    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
    );
    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        reqwest::header::HeaderValue::from_static("en-US,en;q=0.9"),
    );

    let mut builder = reqwest::ClientBuilder::new()
        .connect_timeout(std::time::Duration::from_secs(5))
        .timeout(std::time::Duration::from_secs(15))
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent(USER_AGENT)
        .default_headers(headers);

    if insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }

    let client = builder
        .build()
        .map_err(|e| ExtractionError::Request(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ExtractionError::Request(format!("TimeoutError: {}", e))
        } else if e.is_connect() {
            ExtractionError::Request(format!("ConnectError: {}", e))
        } else {
            ExtractionError::Request(format!("RequestError: {}", e))
        }
    })?;

    if !response.status().is_success() {
        tracing::warn!(url, status = %response.status(), "fetch.upstream_error");
        return Err(ExtractionError::Upstream);
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();

    if !content_type.contains("text/html") && !content_type.contains("application/xhtml") {
        return Err(ExtractionError::NotHtml);
    }

    response
        .text()
        .await
        .map_err(|e| ExtractionError::Request(e.to_string()))
}

fn validate_url(url: &str) -> Result<(), ExtractionError> {
    let parsed = Url::parse(url)
        .map_err(|_| ExtractionError::InvalidUrl("Invalid URL".to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ExtractionError::InvalidUrl(
            "Only http and https URLs are allowed".to_string(),
        ));
    }
    Ok(())
}

// ── Advertisement stripping ──────────────────────────────────────────────────

fn is_ad_element(el: ElementRef<'_>) -> bool {
    if el.value().name() == "ins" && el.value().classes().any(|c| c == "adsbygoogle") {
        return true;
    }
    let combined = class_id(el);
    if AD_PATTERNS.iter().any(|p| combined.contains(p)) {
        return true;
    }
    combined
        .split_whitespace()
        .any(|token| AD_TOKENS.contains(&token))
}

/// Detach advertisement subtrees in place; returns how many were removed.
pub fn strip_ads(document: &mut Html) -> usize {
    let ids: Vec<_> = document
        .select(&ANY_SEL)
        .filter(|el| !matches!(el.value().name(), "html" | "body"))
        .filter(|el| is_ad_element(*el))
        .map(|el| el.id())
        .collect();
    let count = ids.len();
    for id in ids {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }
    count
}

// ── Container selection ──────────────────────────────────────────────────────

fn find_container(document: &Html) -> Option<ElementRef<'_>> {
    // 1. Prefer <article>
    if let Some(el) = document.select(&ARTICLE_SEL).next() {
        return Some(el);
    }

    // 2. Fall back to <main>
    if let Some(el) = document.select(&MAIN_SEL).next() {
        return Some(el);
    }

    // 3. Best <div> with a content-like class/id and sufficient text.
    let mut best: Option<ElementRef<'_>> = None;
    let mut best_len: usize = 0;

    for div in document.select(&DIV_SEL) {
        if !KEYWORD_RE.is_match(&class_id(div)) {
            continue;
        }
        let text_len = collect_text(div).len();
        if text_len > best_len {
            best_len = text_len;
            best = Some(div);
        }
    }

    if best_len >= MIN_TEXT_LEN {
        return best;
    }

    // 4. Whole body.
    document.select(&BODY_SEL).next()
}

// ── Page metadata ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PageMeta {
    title: Option<String>,
    description: Option<String>,
    author: Option<String>,
    published: Option<String>,
    image: Option<String>,
}

impl PageMeta {
    fn from_document(document: &Html, base: &Url) -> Self {
        let title = meta_content(document, &[("property", "og:title"), ("name", "twitter:title")])
            .or_else(|| {
                document
                    .select(&TITLE_SEL)
                    .next()
                    .map(|el| normalize_text(&collect_text(el)))
                    .filter(|s| !s.is_empty())
            })
            .or_else(|| {
                document
                    .select(&H1_SEL)
                    .next()
                    .map(|el| normalize_text(&collect_text(el)))
                    .filter(|s| !s.is_empty())
            });

        let description = meta_content(
            document,
            &[
                ("property", "og:description"),
                ("name", "description"),
                ("name", "twitter:description"),
            ],
        );

        let author = meta_content(
            document,
            &[("name", "author"), ("property", "article:author")],
        );

        let published = meta_content(
            document,
            &[
                ("property", "article:published_time"),
                ("name", "date"),
                ("itemprop", "datePublished"),
            ],
        )
        .or_else(|| {
            document
                .select(&TIME_SEL)
                .next()
                .and_then(|el| el.value().attr("datetime"))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        });

        let image = extract_meta_image(document)
            .or_else(|| extract_jsonld_image(document))
            .and_then(|raw| base.join(&raw).ok())
            .map(|u| u.to_string())
            .filter(|u| is_valid_image_url(u));

        Self {
            title,
            description,
            author,
            published,
            image,
        }
    }
}

fn meta_content(document: &Html, checks: &[(&str, &str)]) -> Option<String> {
    for (attr, value) in checks {
        let sel_str = format!("meta[{}=\"{}\"]", attr, value);
        // Use .ok() immediately to drop SelectorErrorKind<'_> before sel_str is dropped.
        let sel = Selector::parse(&sel_str).ok();
        if let Some(sel) = sel {
            if let Some(el) = document.select(&sel).next() {
                if let Some(content) = el.value().attr("content") {
                    let trimmed = normalize_text(content);
                    if !trimmed.is_empty() {
                        return Some(trimmed);
                    }
                }
            }
        }
    }
    None
}

fn extract_meta_image(document: &Html) -> Option<String> {
    meta_content(
        document,
        &[
            ("property", "og:image"),
            ("property", "og:image:secure_url"),
            ("name", "twitter:image"),
            ("name", "twitter:image:src"),
            ("itemprop", "image"),
        ],
    )
}

fn extract_jsonld_image(document: &Html) -> Option<String> {
    for script in document.select(&JSONLD_SEL) {
        let text = collect_text(script);
        if let Ok(value) = serde_json::from_str::<Value>(&text) {
            if let Some(url) = jsonld_image_value(&value) {
                return Some(url);
            }
        }
    }
    None
}

fn jsonld_image_value(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for key in &["image", "thumbnailUrl"] {
                match map.get(*key) {
                    Some(Value::String(s)) => return Some(s.clone()),
                    Some(Value::Array(arr)) => {
                        for item in arr {
                            match item {
                                Value::String(s) => return Some(s.clone()),
                                Value::Object(obj) => {
                                    if let Some(Value::String(u)) = obj.get("url") {
                                        return Some(u.clone());
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    Some(Value::Object(obj)) => {
                        if let Some(Value::String(u)) = obj.get("url") {
                            return Some(u.clone());
                        }
                    }
                    _ => {}
                }
            }
            map.values().find_map(jsonld_image_value)
        }
        Value::Array(arr) => arr.iter().find_map(jsonld_image_value),
        _ => None,
    }
}

// ── Markdown post-processing ─────────────────────────────────────────────────

fn insert_fallback_image(markdown: &str, image: &ImageInfo) -> String {
    let alt = image.alt.as_deref().unwrap_or("").replace(['[', ']'], "");
    let image_md = format!("![{}]({})", alt, image.markdown_url);

    if markdown.trim().is_empty() {
        return image_md;
    }

    let lines: Vec<&str> = markdown.lines().collect();
    if let Some(idx) = lines.iter().position(|l| !l.trim().is_empty()) {
        if lines[idx].starts_with("# ") {
            let head = lines[..=idx].join("\n");
            let tail = lines[idx + 1..].join("\n");
            let tail = tail.trim();
            if !tail.is_empty() {
                return format!("{}\n\n{}\n\n{}", head, image_md, tail);
            }
            return format!("{}\n\n{}", head, image_md);
        }
    }
    format!("{}\n\n{}", image_md, markdown)
}

// ── Text helpers ─────────────────────────────────────────────────────────────

fn fragment_text(html: &str) -> String {
    collect_text(Html::parse_fragment(html).root_element())
}

fn has_text(html: &str) -> bool {
    !fragment_text(html).trim().is_empty()
}

fn has_image(html: &str) -> bool {
    html.contains("<img") || html.contains("<picture")
}
