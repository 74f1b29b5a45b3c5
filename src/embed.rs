use url::Url;

// ── Provider table ───────────────────────────────────────────────────────────

/// How a provider turns a matched URL into the value inside its marker.
#[derive(Clone, Copy)]
enum IdRule {
    YouTube,
    TweetStatus,
    CodePen,
    Gist,
    FullUrl,
    VimeoNumeric,
}

struct Provider {
    marker: &'static str,
    hosts: &'static [&'static str],
    /// Extra path requirement for hosts that serve more than one product.
    path_contains: Option<&'static str>,
    rule: IdRule,
}

const PROVIDERS: &[Provider] = &[
    Provider {
        marker: "youtube",
        hosts: &["youtube.com", "youtu.be", "youtube-nocookie.com"],
        path_contains: None,
        rule: IdRule::YouTube,
    },
    Provider {
        marker: "tweet",
        hosts: &["twitter.com", "x.com"],
        path_contains: None,
        rule: IdRule::TweetStatus,
    },
    Provider {
        marker: "codepen",
        hosts: &["codepen.io"],
        path_contains: None,
        rule: IdRule::CodePen,
    },
    Provider {
        marker: "gist",
        hosts: &["gist.github.com"],
        path_contains: None,
        rule: IdRule::Gist,
    },
    Provider {
        marker: "figma",
        hosts: &["figma.com"],
        path_contains: None,
        rule: IdRule::FullUrl,
    },
    Provider {
        marker: "miro",
        hosts: &["miro.com"],
        path_contains: None,
        rule: IdRule::FullUrl,
    },
    Provider {
        marker: "googlemaps",
        hosts: &["maps.google.com"],
        path_contains: None,
        rule: IdRule::FullUrl,
    },
    Provider {
        marker: "googlemaps",
        hosts: &["google.com"],
        path_contains: Some("/maps"),
        rule: IdRule::FullUrl,
    },
    Provider {
        marker: "vimeo",
        hosts: &["vimeo.com"],
        path_contains: None,
        rule: IdRule::VimeoNumeric,
    },
];

// ── Public API ───────────────────────────────────────────────────────────────

/// Classify a hyperlink target as an embeddable provider link.
///
/// Returns the embed marker (e.g. `@[youtube](abc123)`) or `None` when the
/// target is a plain link. Unparseable targets are plain links.
pub fn classify(href: &str) -> Option<String> {
    let url = match Url::parse(href.trim()) {
        Ok(url) => url,
        Err(err) => {
            tracing::debug!(href, %err, "embed.classify.unparseable");
            return None;
        }
    };
    let host = url.host_str()?.to_lowercase();

    for provider in PROVIDERS {
        if !provider.hosts.iter().any(|h| host_matches(&host, h)) {
            continue;
        }
        if let Some(needle) = provider.path_contains {
            if !url.path().contains(needle) {
                continue;
            }
        }
        if let Some(id) = extract_id(provider.rule, &url, &host) {
            return Some(format!("@[{}]({})", provider.marker, id));
        }
    }
    None
}

// ── ID extraction ────────────────────────────────────────────────────────────

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .map(|prefix| prefix.ends_with('.'))
            .unwrap_or(false)
}

fn extract_id(rule: IdRule, url: &Url, host: &str) -> Option<String> {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    let id = match rule {
        IdRule::YouTube => {
            if host_matches(host, "youtu.be") {
                segments.first().map(|s| s.to_string())
            } else {
                url.query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned())
                    .or_else(|| segment_after(&segments, "embed"))
                    .or_else(|| segment_after(&segments, "v"))
            }
        }
        IdRule::TweetStatus => segment_after(&segments, "status"),
        IdRule::CodePen => segment_after(&segments, "pen"),
        IdRule::Gist => segments
            .get(1)
            .filter(|s| s.chars().all(|c| c.is_ascii_hexdigit()))
            .map(|s| s.to_string()),
        IdRule::FullUrl => Some(url.to_string()),
        IdRule::VimeoNumeric => segments
            .first()
            .filter(|s| s.chars().all(|c| c.is_ascii_digit()))
            .map(|s| s.to_string()),
    };

    id.filter(|s| !s.is_empty() && is_marker_safe(s))
}

fn segment_after(segments: &[&str], key: &str) -> Option<String> {
    segments
        .iter()
        .position(|s| *s == key)
        .and_then(|idx| segments.get(idx + 1))
        .map(|s| s.to_string())
}

/// Parentheses and whitespace would terminate the marker early.
fn is_marker_safe(id: &str) -> bool {
    !id.chars().any(|c| c == '(' || c == ')' || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn youtube_short_link() {
        assert_eq!(
            classify("https://youtu.be/abc123").as_deref(),
            Some("@[youtube](abc123)")
        );
    }

    #[test]
    fn youtube_watch_and_embed_paths() {
        assert_eq!(
            classify("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=10").as_deref(),
            Some("@[youtube](dQw4w9WgXcQ)")
        );
        assert_eq!(
            classify("https://www.youtube.com/embed/xyz").as_deref(),
            Some("@[youtube](xyz)")
        );
        assert_eq!(
            classify("https://youtube.com/v/old1").as_deref(),
            Some("@[youtube](old1)")
        );
    }

    #[test]
    fn youtube_without_id_is_plain() {
        assert_eq!(classify("https://www.youtube.com/feed/trending"), None);
    }

    #[test]
    fn vimeo_numeric_only() {
        assert_eq!(
            classify("https://vimeo.com/55500").as_deref(),
            Some("@[vimeo](55500)")
        );
        assert_eq!(classify("https://vimeo.com/channels/staffpicks"), None);
    }

    #[test]
    fn social_and_code_providers() {
        assert_eq!(
            classify("https://x.com/someone/status/1234567890").as_deref(),
            Some("@[tweet](1234567890)")
        );
        assert_eq!(
            classify("https://twitter.com/someone/status/42?s=20").as_deref(),
            Some("@[tweet](42)")
        );
        assert_eq!(
            classify("https://codepen.io/team/pen/abcDEF").as_deref(),
            Some("@[codepen](abcDEF)")
        );
        assert_eq!(
            classify("https://gist.github.com/octocat/6cad326836d38bd3a7ae").as_deref(),
            Some("@[gist](6cad326836d38bd3a7ae)")
        );
        assert_eq!(classify("https://gist.github.com/octocat"), None);
    }

    #[test]
    fn full_url_providers() {
        assert_eq!(
            classify("https://www.figma.com/file/abc/Design").as_deref(),
            Some("@[figma](https://www.figma.com/file/abc/Design)")
        );
        assert_eq!(
            classify("https://miro.com/app/board/xyz=/").as_deref(),
            Some("@[miro](https://miro.com/app/board/xyz=/)")
        );
        assert_eq!(
            classify("https://www.google.com/maps/place/Somewhere").as_deref(),
            Some("@[googlemaps](https://www.google.com/maps/place/Somewhere)")
        );
        assert_eq!(classify("https://www.google.com/search?q=maps"), None);
    }

    #[test]
    fn lookalike_hosts_are_not_providers() {
        assert_eq!(classify("https://notyoutube.com/watch?v=abc"), None);
        assert_eq!(classify("https://github.com/octocat/6cad3268"), None);
    }

    #[test]
    fn unparseable_and_plain_links() {
        assert_eq!(classify("not a url"), None);
        assert_eq!(classify("/relative/path"), None);
        assert_eq!(classify("https://example.com/not-a-provider"), None);
    }
}
