//! Anchor extraction into edge records.

use scraper::{ElementRef, Html};
use std::collections::HashSet;
use url::Url;

use super::{collapse_ws, sel, selector_hint};
use crate::records::{EdgeRecord, LinkLocation, RenderMode};
use crate::url_norm::{is_same_origin, safe_join};

/// Extract every anchor as an edge, deduped on (source, target, hint).
///
/// Semantic location comes from walking ancestors to the nearest landmark
/// element; in static-fetch mode the DOM was never laid out, so location is
/// reported as unknown.
pub fn extract_links(
    doc: &Html,
    base: &Url,
    page_url: &str,
    mode: RenderMode,
) -> Vec<EdgeRecord> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut edges = Vec::new();

    for anchor in doc.select(&sel("a[href]")) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(target) = safe_join(base, href) else {
            continue;
        };

        let hint = selector_hint(&anchor);
        let target_str = target.to_string();
        if !seen.insert((target_str.clone(), hint.clone())) {
            continue;
        }

        let rel_tokens: HashSet<String> = anchor
            .value()
            .attr("rel")
            .map(|rel| {
                rel.split_whitespace()
                    .map(|t| t.to_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        let location = if mode == RenderMode::Raw {
            LinkLocation::Unknown
        } else {
            landmark_location(&anchor)
        };

        let text = collapse_ws(&anchor.text().collect::<String>());
        edges.push(EdgeRecord {
            source_url: page_url.to_string(),
            target_url: target_str,
            selector_hint: hint,
            anchor_text: (!text.is_empty()).then_some(text),
            external: !is_same_origin(base, &target),
            nofollow: rel_tokens.contains("nofollow"),
            sponsored: rel_tokens.contains("sponsored"),
            ugc: rel_tokens.contains("ugc"),
            location,
        });
    }

    edges
}

fn landmark_location(anchor: &ElementRef<'_>) -> LinkLocation {
    for ancestor in anchor.ancestors() {
        let Some(el) = ElementRef::wrap(ancestor) else {
            continue;
        };
        match el.value().name() {
            "nav" => return LinkLocation::Nav,
            "header" => return LinkLocation::Header,
            "footer" => return LinkLocation::Footer,
            "aside" => return LinkLocation::Aside,
            "main" => return LinkLocation::Main,
            "body" => return LinkLocation::Body,
            _ => {}
        }
    }
    LinkLocation::Unknown
}
