use scraper::node::Node;
use scraper::ElementRef;

/// Recursively collect all text from an element and its descendants.
pub(crate) fn collect_text(el: ElementRef<'_>) -> String {
    let mut parts = Vec::new();
    for child in el.children() {
        match child.value() {
            Node::Text(text) => parts.push((&*text.text).to_string()),
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    parts.push(collect_text(child_el));
                }
            }
            _ => {}
        }
    }
    parts.join("")
}

/// Collapse whitespace runs to a single space and trim.
pub(crate) fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercased `id` and `class` attributes joined by a space.
pub(crate) fn class_id(el: ElementRef<'_>) -> String {
    let id = el.value().id().unwrap_or("");
    let classes = el.value().classes().collect::<Vec<_>>().join(" ");
    format!("{} {}", id, classes).to_lowercase()
}

/// Depth-first search for the first element with the given tag name.
pub(crate) fn find_first_tag<'a>(el: ElementRef<'a>, tag: &str) -> Option<ElementRef<'a>> {
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            if child_el.value().name() == tag {
                return Some(child_el);
            }
            if let Some(found) = find_first_tag(child_el, tag) {
                return Some(found);
            }
        }
    }
    None
}

/// Element children only, skipping text and comments.
pub(crate) fn child_elements<'a>(el: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    el.children().filter_map(ElementRef::wrap)
}

/// Parse a dimension attribute such as `640`, `640px` or `640.5`.
pub(crate) fn parse_dimension(raw: &str) -> Option<u32> {
    let digits: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::{Html, Selector};

    #[test]
    fn collects_nested_text() {
        let doc = Html::parse_fragment("<div>Hello <b>big</b> <i>world</i></div>");
        let sel = Selector::parse("div").unwrap();
        let div = doc.select(&sel).next().unwrap();
        assert_eq!(collect_text(div), "Hello big world");
    }

    #[test]
    fn normalizes_whitespace() {
        assert_eq!(normalize_text("  a \n\t b  "), "a b");
    }

    #[test]
    fn parses_dimensions() {
        assert_eq!(parse_dimension("640"), Some(640));
        assert_eq!(parse_dimension("320px"), Some(320));
        assert_eq!(parse_dimension("99.7"), Some(99));
        assert_eq!(parse_dimension("auto"), None);
    }
}
