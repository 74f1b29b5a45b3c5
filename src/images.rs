//! Candidate image discovery over extracted article HTML.
//!
//! Each strategy is a pure function of a [`ScanContext`] and returns the
//! candidates it found; [`discover_images`] runs them in priority order,
//! applies the URL rules, de-duplicates and moves content-sized images to
//! the front.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use url::Url;

use crate::dom::parse_dimension;
use crate::markdown::{best_src_from_srcset, resolve_img_src};
use crate::models::ImageInfo;

// ── Constants ────────────────────────────────────────────────────────────────

pub const CONTENT_MIN_WIDTH: u32 = 200;
pub const CONTENT_MIN_HEIGHT: u32 = 150;

/// Inline SVG is only considered when fewer candidates than this were found.
const SVG_FALLBACK_THRESHOLD: usize = 3;

// ── Lazy static regexes ──────────────────────────────────────────────────────

static IMG_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("img").unwrap());
static PICTURE_SOURCE_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("picture source").unwrap());
static SRCSET_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("[srcset], [data-srcset]").unwrap());
static STYLE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("[style]").unwrap());
static SVG_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("svg").unwrap());

static BACKGROUND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)background(?:-image)?\s*:[^;]*?url\(\s*['"]?([^'")]+?)['"]?\s*\)"#).unwrap()
});

static DECORATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(icon|logo|avatar|badge|spinner|loader|loading|sprite|emoji|favicon|pixel|tracking|spacer|placeholder|blank\.gif|gravatar)",
    )
    .unwrap()
});

static IMAGE_EXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(jpe?g|png|gif|webp|avif|svg|bmp|tiff?)$").unwrap());

static CONTENT_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)/(uploads?|images?|imgs?|media|photos?|pictures?|wp-content|assets|files|content|static)/")
        .unwrap()
});

// ── Scan context ─────────────────────────────────────────────────────────────

/// Immutable input shared by every discovery strategy.
pub struct ScanContext<'a> {
    pub doc: &'a Html,
    pub base: &'a Url,
}

// ── Public API ───────────────────────────────────────────────────────────────

pub fn discover_images(content_html: &str, base: &Url) -> Vec<ImageInfo> {
    let doc = Html::parse_fragment(content_html);
    let ctx = ScanContext { doc: &doc, base };

    let mut found = Vec::new();
    found.extend(scan_img_tags(&ctx));
    found.extend(scan_picture_sources(&ctx));
    found.extend(scan_srcset(&ctx));
    found.extend(scan_background_images(&ctx));

    let mut candidates = dedupe(found.into_iter().filter(|img| is_valid_image_url(&img.original_url)));

    if candidates.len() < SVG_FALLBACK_THRESHOLD {
        let svgs = scan_inline_svg(&ctx);
        candidates.extend(svgs);
        candidates = dedupe(candidates.into_iter());
    }

    prioritize(candidates)
}

/// URL rules for candidate images.
///
/// `data:` URLs are rejected (inline SVG is handled by its own strategy),
/// decoration-like paths are rejected, and what remains must look like an
/// image file or live under an upload/media path.
pub fn is_valid_image_url(url: &str) -> bool {
    if url.starts_with("data:") {
        return false;
    }
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    let path = parsed.path();
    if DECORATION_RE.is_match(path) {
        return false;
    }
    IMAGE_EXT_RE.is_match(path) || CONTENT_PATH_RE.is_match(path)
}

pub fn is_content_sized(width: Option<u32>, height: Option<u32>) -> bool {
    matches!((width, height), (Some(w), Some(h)) if w >= CONTENT_MIN_WIDTH && h >= CONTENT_MIN_HEIGHT)
}

// ── Strategies ───────────────────────────────────────────────────────────────

pub fn scan_img_tags(ctx: &ScanContext) -> Vec<ImageInfo> {
    ctx.doc
        .select(&IMG_SEL)
        .filter_map(|img| {
            let url = resolve_img_src(img, ctx.base)?;
            Some(candidate(url, img, alt_of(img)))
        })
        .collect()
}

pub fn scan_picture_sources(ctx: &ScanContext) -> Vec<ImageInfo> {
    ctx.doc
        .select(&PICTURE_SOURCE_SEL)
        .filter_map(|source| {
            let srcset = source
                .value()
                .attr("srcset")
                .or_else(|| source.value().attr("data-srcset"))?;
            let url = absolute(ctx.base, &best_src_from_srcset(srcset)?)?;
            let alt = source
                .parent()
                .and_then(ElementRef::wrap)
                .and_then(|picture| picture.select(&IMG_SEL).next())
                .and_then(alt_of);
            Some(candidate(url, source, alt))
        })
        .collect()
}

/// Largest `srcset` entry of any element except `<source>`. For an `<img>`
/// that also carries `src` this is usually a different file than the one
/// the body references.
pub fn scan_srcset(ctx: &ScanContext) -> Vec<ImageInfo> {
    ctx.doc
        .select(&SRCSET_SEL)
        .filter(|el| el.value().name() != "source")
        .filter_map(|el| {
            let srcset = el
                .value()
                .attr("srcset")
                .or_else(|| el.value().attr("data-srcset"))?;
            let url = absolute(ctx.base, &best_src_from_srcset(srcset)?)?;
            Some(candidate(url, el, alt_of(el)))
        })
        .collect()
}

pub fn scan_background_images(ctx: &ScanContext) -> Vec<ImageInfo> {
    let mut out = Vec::new();
    for el in ctx.doc.select(&STYLE_SEL) {
        let Some(style) = el.value().attr("style") else {
            continue;
        };
        for cap in BACKGROUND_RE.captures_iter(style) {
            if let Some(url) = absolute(ctx.base, cap[1].trim()) {
                out.push(candidate(url, el, None));
            }
        }
    }
    out
}

/// Inline `<svg>` elements serialized into `data:image/svg+xml` URLs.
pub fn scan_inline_svg(ctx: &ScanContext) -> Vec<ImageInfo> {
    ctx.doc
        .select(&SVG_SEL)
        .filter_map(|svg| {
            let url = inline_svg_data_url(svg)?;
            Some(candidate(url, svg, svg_label(svg)))
        })
        .collect()
}

/// `data:` URL for a sized inline `<svg>`. The converter emits the same
/// string, so body references and candidates match exactly.
pub(crate) fn inline_svg_data_url(svg: ElementRef<'_>) -> Option<String> {
    let v = svg.value();
    let sized = v.attr("viewBox").is_some() || v.attr("viewbox").is_some() || v.attr("width").is_some();
    sized.then(|| format!("data:image/svg+xml;base64,{}", BASE64.encode(svg.html())))
}

pub(crate) fn svg_label(svg: ElementRef<'_>) -> Option<String> {
    svg.value()
        .attr("aria-label")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// True when discovery kept at least one inline SVG.
pub fn has_inline_svg(images: &[ImageInfo]) -> bool {
    images
        .iter()
        .any(|img| img.original_url.starts_with("data:image/svg+xml"))
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn candidate(url: String, el: ElementRef<'_>, alt: Option<String>) -> ImageInfo {
    let width = dimension(el, "width");
    let height = dimension(el, "height");
    ImageInfo {
        original_url: url.clone(),
        markdown_url: url,
        outline_url: None,
        alt,
        width,
        height,
        is_content_image: is_content_sized(width, height),
    }
}

fn dimension(el: ElementRef<'_>, name: &str) -> Option<u32> {
    el.value()
        .attr(name)
        .or_else(|| el.value().attr(&format!("data-{}", name)))
        .and_then(parse_dimension)
}

fn alt_of(el: ElementRef<'_>) -> Option<String> {
    el.value()
        .attr("alt")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn absolute(base: &Url, raw: &str) -> Option<String> {
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }
    base.join(raw).ok().map(|u| u.to_string())
}

fn dedupe(images: impl Iterator<Item = ImageInfo>) -> Vec<ImageInfo> {
    let mut seen = HashSet::new();
    images
        .filter(|img| seen.insert(img.original_url.clone()))
        .collect()
}

/// Content-sized images first; relative order otherwise preserved.
fn prioritize(images: Vec<ImageInfo>) -> Vec<ImageInfo> {
    let (mut content, rest): (Vec<_>, Vec<_>) =
        images.into_iter().partition(|img| img.is_content_image);
    content.extend(rest);
    content
}
