use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use scraper::node::Node;
use scraper::{ElementRef, Html};
use url::Url;

use crate::dom::{child_elements, collect_text, find_first_tag, normalize_text};
use crate::embed;
use crate::images;

// ── Constants ────────────────────────────────────────────────────────────────

/// Attributes that lazy-loading libraries stash the real image address in.
const LAZY_SRC_ATTRS: &[&str] = &[
    "data-src",
    "data-lazy-src",
    "data-original",
    "data-lazy",
    "lazy-src",
    "data-url",
    "data-largest",
    "data-large",
    "data-medium",
    "data-small",
];

/// Never readable text in either mode.
const ALWAYS_SKIPPED: &[&str] = &[
    "head", "script", "style", "noscript", "template", "svg", "button", "input", "select",
    "textarea", "audio", "video", "source", "track", "canvas", "object",
];

/// Page chrome removed in simplified mode.
const SIMPLIFIED_SKIPPED: &[&str] = &["nav", "aside", "footer"];

// ── Lazy static regexes ──────────────────────────────────────────────────────

static MULTI_NEWLINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static MD_IMAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"!\[([^\]]*)\]\(\s*([^)\s]+)((?:\s+"[^"]*")?)\s*\)"#).unwrap()
});

static SCHEME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.\-]*:").unwrap());

static LANGUAGE_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:language|lang)-([A-Za-z0-9_+#.\-]+)$").unwrap());

// ── Converter ────────────────────────────────────────────────────────────────

/// HTML → Markdown converter.
///
/// Conversion is total: any input, however malformed, yields a string.
/// Elements without a dedicated rule contribute the markdown of their
/// children, which for unknown leaf elements is just their text.
#[derive(Debug, Clone)]
pub struct Converter {
    base_url: Url,
    simplified: bool,
    include_images: bool,
    keep_formatting: bool,
    inline_svg: bool,
}

struct WalkCtx<'a> {
    conv: &'a Converter,
    list_depth: usize,
}

impl Converter {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            simplified: false,
            include_images: true,
            keep_formatting: true,
            inline_svg: false,
        }
    }

    /// Simplified variant: also drops navigation, asides and footers.
    pub fn simplified(mut self, on: bool) -> Self {
        self.simplified = on;
        self
    }

    pub fn include_images(mut self, on: bool) -> Self {
        self.include_images = on;
        self
    }

    pub fn keep_formatting(mut self, on: bool) -> Self {
        self.keep_formatting = on;
        self
    }

    /// Emit sized inline `<svg>` elements as `data:` image references.
    pub fn inline_svg(mut self, on: bool) -> Self {
        self.inline_svg = on;
        self
    }

    pub fn convert(&self, html: &str) -> String {
        let fragment = Html::parse_fragment(html);
        let ctx = WalkCtx {
            conv: self,
            list_depth: 0,
        };
        let markdown = walk_children(fragment.root_element(), &ctx);

        let markdown = MULTI_NEWLINE_RE
            .replace_all(&markdown, "\n\n")
            .trim()
            .to_string();

        absolutize_image_urls(&markdown, &self.base_url)
    }

    fn skips(&self, name: &str) -> bool {
        ALWAYS_SKIPPED.contains(&name) || (self.simplified && SIMPLIFIED_SKIPPED.contains(&name))
    }
}

/// Convert with default settings.
pub fn to_markdown(html: &str, base_url: &Url) -> String {
    Converter::new(base_url.clone()).convert(html)
}

// ── Relative image URL pass ──────────────────────────────────────────────────

/// Rewrite relative image references in markdown text to absolute URLs.
///
/// References that already carry a scheme, are protocol-relative (`//`) or
/// are `data:` URLs are left untouched, so the pass is idempotent.
pub fn absolutize_image_urls(markdown: &str, base_url: &Url) -> String {
    MD_IMAGE_RE
        .replace_all(markdown, |caps: &Captures| {
            let target = &caps[2];
            if is_absolute_reference(target) {
                return caps[0].to_string();
            }
            match base_url.join(target) {
                Ok(abs) => format!("![{}]({}{})", &caps[1], abs, &caps[3]),
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn is_absolute_reference(target: &str) -> bool {
    target.starts_with("//") || SCHEME_RE.is_match(target)
}

// ── DOM tree walker → Markdown ───────────────────────────────────────────────

fn walk_element(el: ElementRef<'_>, ctx: &WalkCtx) -> String {
    let name = el.value().name();
    let conv = ctx.conv;

    if name == "svg" && conv.inline_svg && conv.include_images {
        return images::inline_svg_data_url(el)
            .map(|url| {
                let alt = images::svg_label(el)
                    .unwrap_or_default()
                    .replace(['[', ']'], "");
                format!("![{}]({})", alt, url)
            })
            .unwrap_or_default();
    }

    if conv.skips(name) {
        return String::new();
    }

    match name {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = name[1..].parse::<usize>().unwrap_or(1);
            let text = normalize_text(&walk_children(el, ctx));
            if text.is_empty() {
                return String::new();
            }
            format!("\n\n{} {}\n\n", "#".repeat(level), text)
        }

        "img" => {
            if !conv.include_images {
                return String::new();
            }
            render_image(el, &conv.base_url)
        }

        "picture" => {
            if !conv.include_images {
                return String::new();
            }
            find_first_tag(el, "img")
                .map(|img| render_image(img, &conv.base_url))
                .unwrap_or_default()
        }

        "figure" => handle_figure(el, ctx),

        "pre" => handle_pre(el),

        "table" => handle_table(el, ctx),

        "iframe" => el
            .value()
            .attr("src")
            .and_then(|src| conv.base_url.join(src).ok())
            .and_then(|src| embed::classify(src.as_str()))
            .map(|marker| format!("\n\n{}\n\n", marker))
            .unwrap_or_default(),

        "a" => {
            let content = walk_children(el, ctx);
            let text = content.trim();
            let href = el
                .value()
                .attr("href")
                .map(str::trim)
                .filter(|h| !h.is_empty() && !h.starts_with("javascript:") && !h.starts_with('#'));
            match href {
                Some(href) => {
                    let resolved = conv
                        .base_url
                        .join(href)
                        .map(|u| u.to_string())
                        .unwrap_or_else(|_| href.to_string());
                    if let Some(marker) = embed::classify(&resolved) {
                        return format!("\n\n{}\n\n", marker);
                    }
                    if text.is_empty() {
                        return String::new();
                    }
                    format!("[{}]({})", text, resolved)
                }
                None => text.to_string(),
            }
        }

        "p" => {
            let content = walk_children(el, ctx);
            let trimmed = content.trim();
            if trimmed.is_empty() {
                return String::new();
            }
            format!("\n\n{}\n\n", trimmed)
        }

        "br" => "  \n".to_string(),
        "hr" => "\n\n---\n\n".to_string(),

        "ul" => handle_list(el, ctx, false),
        "ol" => handle_list(el, ctx, true),

        "strong" | "b" => wrap_inline(el, ctx, "**"),
        "em" | "i" => wrap_inline(el, ctx, "*"),
        "del" | "s" | "strike" => wrap_inline(el, ctx, "~~"),

        "blockquote" => {
            let content = walk_children(el, ctx);
            let content = MULTI_NEWLINE_RE.replace_all(content.trim(), "\n\n");
            if content.is_empty() {
                return String::new();
            }
            let quoted = content
                .lines()
                .map(|l| if l.is_empty() { ">".to_string() } else { format!("> {}", l) })
                .collect::<Vec<_>>()
                .join("\n");
            format!("\n\n{}\n\n", quoted)
        }

        "code" => {
            let text = collect_text(el);
            if text.is_empty() {
                return String::new();
            }
            let fence = if text.contains('`') { "``" } else { "`" };
            format!("{}{}{}", fence, text, fence)
        }

        "div" | "section" | "article" | "main" | "header" | "footer" | "aside" | "nav" => {
            let content = walk_children(el, ctx);
            if content.trim().is_empty() {
                return String::new();
            }
            format!("\n\n{}\n\n", content.trim())
        }

        _ => walk_children(el, ctx),
    }
}

fn walk_children(el: ElementRef<'_>, ctx: &WalkCtx) -> String {
    let mut result = String::new();
    for child in el.children() {
        match child.value() {
            Node::Text(text) => {
                result.push_str(&WHITESPACE_RE.replace_all(&text.text, " "));
            }
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    result.push_str(&walk_element(child_el, ctx));
                }
            }
            _ => {}
        }
    }
    result
}

fn wrap_inline(el: ElementRef<'_>, ctx: &WalkCtx, marker: &str) -> String {
    let content = walk_children(el, ctx);
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if !ctx.conv.keep_formatting {
        return trimmed.to_string();
    }
    format!("{}{}{}", marker, trimmed, marker)
}

// ── Element-specific handlers ────────────────────────────────────────────────

fn render_image(img: ElementRef<'_>, base_url: &Url) -> String {
    let Some(src) = resolve_img_src(img, base_url) else {
        return String::new();
    };
    let alt = img
        .value()
        .attr("alt")
        .map(|s| normalize_text(s).replace(['[', ']'], ""))
        .unwrap_or_default();
    format!("![{}]({})", alt, src)
}

fn handle_figure(el: ElementRef<'_>, ctx: &WalkCtx) -> String {
    let conv = ctx.conv;
    let Some(img) = find_first_tag(el, "img") else {
        return walk_children(el, ctx);
    };
    if !conv.include_images {
        return find_first_tag(el, "figcaption")
            .map(|fc| normalize_text(&collect_text(fc)))
            .filter(|s| !s.is_empty())
            .map(|cap| format!("\n\n*{}*\n\n", cap))
            .unwrap_or_default();
    }

    let image = render_image(img, &conv.base_url);
    if image.is_empty() {
        return String::new();
    }

    let caption = find_first_tag(el, "figcaption")
        .map(|fc| normalize_text(&collect_text(fc)))
        .filter(|s| !s.is_empty());

    let mut result = format!("\n\n{}\n\n", image);
    if let Some(cap) = caption {
        result.push_str(&format!("*{}*\n\n", cap));
    }
    result
}

fn handle_pre(el: ElementRef<'_>) -> String {
    let code = find_first_tag(el, "code");
    let language = code
        .and_then(language_of)
        .or_else(|| language_of(el))
        .unwrap_or_default();

    let text = collect_text(code.unwrap_or(el));
    let text = text.trim_end_matches('\n');
    let fence = if text.contains("```") { "~~~~" } else { "```" };
    format!("\n\n{}{}\n{}\n{}\n\n", fence, language, text, fence)
}

fn language_of(el: ElementRef<'_>) -> Option<String> {
    el.value()
        .classes()
        .find_map(|c| LANGUAGE_CLASS_RE.captures(c).map(|cap| cap[1].to_string()))
}

/// GFM pipe table. The first row is the header; every emitted line carries
/// exactly as many cells as the header. Pipe characters inside cells are not
/// escaped.
fn handle_table(el: ElementRef<'_>, ctx: &WalkCtx) -> String {
    let rows: Vec<Vec<String>> = table_rows(el)
        .into_iter()
        .map(|row| {
            child_elements(row)
                .filter(|c| matches!(c.value().name(), "th" | "td"))
                .map(|cell| normalize_text(&walk_children(cell, ctx)))
                .collect::<Vec<_>>()
        })
        .collect();

    let Some((header, body)) = rows.split_first() else {
        return String::new();
    };
    let columns = header.len();
    if columns == 0 {
        return String::new();
    }

    let render_row = |cells: &[String]| {
        let padded: Vec<&str> = (0..columns)
            .map(|i| cells.get(i).map(String::as_str).unwrap_or(""))
            .collect();
        format!("| {} |", padded.join(" | "))
    };

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(render_row(header.as_slice()));
    lines.push(format!("|{}", " --- |".repeat(columns)));
    for row in body {
        lines.push(render_row(row.as_slice()));
    }
    format!("\n\n{}\n\n", lines.join("\n"))
}

/// Rows of this table only; rows of nested tables are not included.
fn table_rows(table: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    let mut rows = Vec::new();
    for child in child_elements(table) {
        match child.value().name() {
            "tr" => rows.push(child),
            "thead" | "tbody" | "tfoot" => {
                rows.extend(child_elements(child).filter(|c| c.value().name() == "tr"))
            }
            _ => {}
        }
    }
    rows
}

fn handle_list(el: ElementRef<'_>, ctx: &WalkCtx, ordered: bool) -> String {
    let inner = WalkCtx {
        conv: ctx.conv,
        list_depth: ctx.list_depth + 1,
    };
    let mut result = String::new();
    let mut idx = 1usize;

    for child in child_elements(el) {
        if child.value().name() != "li" {
            continue;
        }
        let content = walk_children(child, &inner);
        let content = MULTI_NEWLINE_RE.replace_all(content.trim(), "\n\n");
        if content.is_empty() {
            continue;
        }
        let marker = if ordered {
            let m = format!("{}. ", idx);
            idx += 1;
            m
        } else {
            "- ".to_string()
        };
        let indent = " ".repeat(marker.len());
        for (n, line) in content.lines().enumerate() {
            if n == 0 {
                result.push_str(&marker);
                result.push_str(line);
            } else if line.trim().is_empty() {
                continue;
            } else {
                result.push_str(&indent);
                result.push_str(line);
            }
            result.push('\n');
        }
    }

    if result.is_empty() {
        return String::new();
    }
    if ctx.list_depth > 0 {
        format!("\n{}", result)
    } else {
        format!("\n\n{}\n", result)
    }
}

// ── Image source resolution ──────────────────────────────────────────────────

/// Resolve an `<img>` to the absolute URL the converter emits for it.
///
/// Priority: canonical source, `src`, lazy-loading attributes, then the
/// largest `srcset` candidate. A `data:` placeholder in `src` yields to a
/// lazy attribute when one is present.
pub(crate) fn resolve_img_src(el: ElementRef<'_>, base_url: &Url) -> Option<String> {
    let v = el.value();
    let non_empty = move |name: &str| v.attr(name).map(str::trim).filter(|s| !s.is_empty());

    let lazy = || LAZY_SRC_ATTRS.iter().find_map(|a| non_empty(*a));
    let src = non_empty("data-canonical-src")
        .or_else(|| match non_empty("src") {
            Some(src) if src.starts_with("data:") => lazy().or(Some(src)),
            other => other,
        })
        .or_else(|| lazy())
        .map(str::to_string)
        .or_else(|| {
            non_empty("srcset")
                .or_else(|| non_empty("data-srcset"))
                .and_then(best_src_from_srcset)
        })?;

    if src.starts_with("data:") {
        return Some(src);
    }
    Some(
        base_url
            .join(&src)
            .map(|u| u.to_string())
            .unwrap_or(src),
    )
}

pub(crate) fn best_src_from_srcset(srcset: &str) -> Option<String> {
    let mut candidates: Vec<(f64, usize, String)> = Vec::new();

    for (index, part) in srcset.split(',').enumerate() {
        let mut pieces = part.split_whitespace();
        let Some(url) = pieces.next() else {
            continue;
        };
        let score: f64 = pieces
            .next()
            .and_then(|desc| {
                desc.strip_suffix('w')
                    .or_else(|| desc.strip_suffix('x'))
                    .and_then(|n| n.parse().ok())
            })
            .unwrap_or(0.0);
        candidates.push((score, index, url.to_string()));
    }

    candidates.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });
    candidates.last().map(|(_, _, url)| url.clone())
}
