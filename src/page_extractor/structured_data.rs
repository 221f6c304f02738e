//! Structured data detection: JSON-LD, microdata, Open Graph, Twitter Card.

use scraper::Html;
use std::collections::BTreeMap;

use super::sel;
use crate::records::StructuredDataItem;

/// Per-block parse cap for JSON-LD payloads.
const JSON_LD_MAX_BYTES: usize = 50 * 1024;

pub fn extract_structured_data(doc: &Html) -> Vec<StructuredDataItem> {
    let mut items = Vec::new();

    for script in doc.select(&sel(r#"script[type="application/ld+json"]"#)) {
        let raw: String = script.text().collect();
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > JSON_LD_MAX_BYTES {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(data) => items.push(StructuredDataItem::JsonLd { data }),
            Err(_) => continue,
        }
    }

    let mut seen_item_types = std::collections::HashSet::new();
    for el in doc.select(&sel("[itemtype]")) {
        if let Some(item_type) = el.value().attr("itemtype") {
            let item_type = item_type.trim().to_string();
            if !item_type.is_empty() && seen_item_types.insert(item_type.clone()) {
                items.push(StructuredDataItem::Microdata { item_type });
            }
        }
    }

    let og = collect_meta(doc, "property", "og:");
    if !og.is_empty() {
        items.push(StructuredDataItem::OpenGraph { properties: og });
    }

    let twitter = collect_meta(doc, "name", "twitter:");
    if !twitter.is_empty() {
        items.push(StructuredDataItem::TwitterCard { properties: twitter });
    }

    items
}

fn collect_meta(doc: &Html, attr: &str, prefix: &str) -> BTreeMap<String, String> {
    let selector = sel(&format!(r#"meta[{attr}^="{prefix}"]"#));
    doc.select(&selector)
        .filter_map(|el| {
            let key = el.value().attr(attr)?.to_string();
            let content = el.value().attr("content")?.to_string();
            Some((key, content))
        })
        .collect()
}
