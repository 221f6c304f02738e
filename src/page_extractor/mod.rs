//! Pure extractors turning one page's DOM into typed records.
//!
//! Every function here is a total function of the (rendered or raw) HTML
//! plus the base URL: no I/O, no panics on malformed input. Broken markup
//! degrades to empty-but-well-typed results; the scheduler decides
//! severity.

mod accessibility;
mod assets;
mod links;
mod page_facts;
mod structured_data;
mod tech_stack;

pub use accessibility::extract_accessibility;
pub use assets::{extract_assets, ASSET_CAP};
pub use links::extract_links;
pub use page_facts::{extract_page_facts, PageFacts};
pub use structured_data::extract_structured_data;
pub use tech_stack::detect_tech_stack;

use scraper::Html;
use std::collections::BTreeMap;
use url::Url;

use crate::records::{AccessibilityRecord, AssetRecord, EdgeRecord, RenderMode, StructuredDataItem};
use crate::renderer::RawTextNodeStyle;

/// Everything the extractors need for one page.
pub struct ExtractionInput<'a> {
    pub dom: &'a str,
    /// Base for resolving relative references; normally the final URL.
    pub base: &'a Url,
    /// The page URL as stored on records.
    pub page_url: &'a str,
    pub mode: RenderMode,
    pub robots_header: Option<&'a str>,
    /// Response headers of the final hop, keys lowercased.
    pub headers: &'a BTreeMap<String, String>,
    pub accessibility_enabled: bool,
    /// Full-mode computed styles from the renderer; empty otherwise.
    pub computed_styles: &'a [RawTextNodeStyle],
}

/// The combined extractor output.
pub struct Extracted {
    pub facts: PageFacts,
    pub edges: Vec<EdgeRecord>,
    pub assets: Vec<AssetRecord>,
    pub assets_truncated: bool,
    pub accessibility: Option<AccessibilityRecord>,
    pub structured_data: Vec<StructuredDataItem>,
    pub tech_stack: Vec<String>,
}

/// Run the full extractor suite over one page.
pub fn run_extractors(input: &ExtractionInput<'_>) -> Extracted {
    let doc = Html::parse_document(input.dom);

    let facts = extract_page_facts(&doc, input.base, input.robots_header);
    let edges = extract_links(&doc, input.base, input.page_url, input.mode);
    let (assets, assets_truncated) = extract_assets(&doc, input.base, input.page_url);
    let accessibility = input.accessibility_enabled.then(|| {
        extract_accessibility(
            &doc,
            input.page_url,
            input.mode,
            input.computed_styles,
            &facts,
        )
    });
    let structured_data = extract_structured_data(&doc);
    let tech_stack = detect_tech_stack(&doc, input.dom, input.headers);

    Extracted {
        facts,
        edges,
        assets,
        assets_truncated,
        accessibility,
        structured_data,
        tech_stack,
    }
}

/// Parse a selector known at compile time.
///
/// Selectors in this module are literals; a parse failure is a programmer
/// error caught by the test suite, never a data-dependent condition.
pub(crate) fn sel(selector: &str) -> scraper::Selector {
    scraper::Selector::parse(selector).expect("static selector")
}

/// Collapse runs of whitespace into single spaces.
pub(crate) fn collapse_ws(text: &str) -> String {
    let mut out = String::with_capacity(text.len().min(2048));
    let mut last_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// A short CSS-ish hint locating an element: tag, `#id` or first class,
/// prefixed with the nearest landmark ancestor when one exists.
pub(crate) fn selector_hint(el: &scraper::ElementRef<'_>) -> String {
    let mut own = el.value().name().to_string();
    if let Some(id) = el.value().id() {
        own.push('#');
        own.push_str(id);
    } else if let Some(class) = el.value().classes().next() {
        own.push('.');
        own.push_str(class);
    }

    for ancestor in el.ancestors() {
        if let Some(parent) = scraper::ElementRef::wrap(ancestor) {
            let name = parent.value().name();
            if matches!(name, "nav" | "header" | "footer" | "aside" | "main") {
                return format!("{name} > {own}");
            }
        }
    }
    own
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapse_ws_flattens_runs() {
        assert_eq!(collapse_ws("  a \n\t b  c "), "a b c");
        assert_eq!(collapse_ws(""), "");
    }

    #[test]
    fn run_extractors_total_on_garbage() {
        let base = Url::parse("https://a.test/").unwrap();
        let headers = BTreeMap::new();
        let input = ExtractionInput {
            dom: "<<<<not html at all >><p",
            base: &base,
            page_url: "https://a.test/",
            mode: RenderMode::Raw,
            robots_header: None,
            headers: &headers,
            accessibility_enabled: true,
            computed_styles: &[],
        };
        let out = run_extractors(&input);
        assert!(out.edges.is_empty());
        assert!(out.assets.is_empty());
        assert!(out.accessibility.is_some());
    }
}
