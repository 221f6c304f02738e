//! Media asset inventory.

use scraper::{ElementRef, Html};
use url::Url;

use super::sel;
use crate::records::{AssetKind, AssetRecord};
use crate::url_norm::safe_join;

/// Assets stored per page before truncation.
pub const ASSET_CAP: usize = 1000;

/// Collect `<img>`, `<video>` and `<source>` assets, capped at
/// [`ASSET_CAP`]; the boolean reports whether truncation happened.
///
/// Without layout information every asset is reported visible and outside
/// the viewport.
pub fn extract_assets(doc: &Html, base: &Url, page_url: &str) -> (Vec<AssetRecord>, bool) {
    let mut assets = Vec::new();
    let mut truncated = false;

    for el in doc.select(&sel("img, video, source")) {
        let name = el.value().name();
        let (kind, url_attr) = match name {
            "img" => (AssetKind::Image, "src"),
            "video" => (AssetKind::Video, "src"),
            // A <source> inherits its kind from the enclosing element.
            "source" => (source_kind(&el), "src"),
            _ => continue,
        };

        let Some(raw_src) = el.value().attr(url_attr).or_else(|| el.value().attr("srcset"))
        else {
            continue;
        };
        // srcset: take the first candidate URL.
        let raw_src = raw_src.split_whitespace().next().unwrap_or(raw_src);
        let Some(asset_url) = safe_join(base, raw_src) else {
            continue;
        };

        if assets.len() >= ASSET_CAP {
            truncated = true;
            break;
        }

        let has_alt = el
            .value()
            .attr("alt")
            .is_some_and(|alt| !alt.trim().is_empty());

        assets.push(AssetRecord {
            page_url: page_url.to_string(),
            asset_url: asset_url.to_string(),
            kind,
            has_alt,
            natural_width: parse_dim(el.value().attr("width")),
            natural_height: parse_dim(el.value().attr("height")),
            display_width: parse_dim(el.value().attr("width")),
            display_height: parse_dim(el.value().attr("height")),
            loading: el.value().attr("loading").map(str::to_string),
            visible: true,
            in_viewport: false,
        });
    }

    (assets, truncated)
}

fn source_kind(el: &ElementRef<'_>) -> AssetKind {
    for ancestor in el.ancestors() {
        if let Some(parent) = ElementRef::wrap(ancestor) {
            match parent.value().name() {
                "video" => return AssetKind::Video,
                "picture" => return AssetKind::Image,
                _ => {}
            }
        }
    }
    AssetKind::Image
}

fn parse_dim(attr: Option<&str>) -> Option<u32> {
    attr.and_then(|v| v.trim().trim_end_matches("px").parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://a.test/").unwrap()
    }

    #[test]
    fn images_videos_and_sources() {
        let d = Html::parse_document(
            r#"<body>
                <img src="/a.png" alt="a" width="100" height="50" loading="lazy">
                <img src="/b.png">
                <video src="/v.mp4"></video>
                <video><source src="/v2.webm"></video>
                <picture><source srcset="/p.webp 2x"><img src="/p.png" alt="p"></picture>
            </body>"#,
        );
        let (assets, truncated) = extract_assets(&d, &base(), "https://a.test/");
        assert!(!truncated);
        assert_eq!(assets.len(), 6);

        assert_eq!(assets[0].kind, AssetKind::Image);
        assert!(assets[0].has_alt);
        assert_eq!(assets[0].natural_width, Some(100));
        assert_eq!(assets[0].loading.as_deref(), Some("lazy"));
        assert!(!assets[1].has_alt);
        assert_eq!(assets[2].kind, AssetKind::Video);
        assert_eq!(assets[3].kind, AssetKind::Video);
        assert_eq!(assets[4].kind, AssetKind::Image);
        assert_eq!(assets[4].asset_url, "https://a.test/p.webp");
        assert!(assets.iter().all(|a| a.visible && !a.in_viewport));
    }

    #[test]
    fn cap_at_exactly_one_thousand() {
        let imgs: String = (0..1000).map(|i| format!(r#"<img src="/i{i}.png">"#)).collect();
        let d = Html::parse_document(&format!("<body>{imgs}</body>"));
        let (assets, truncated) = extract_assets(&d, &base(), "https://a.test/");
        assert_eq!(assets.len(), 1000);
        assert!(!truncated);
    }

    #[test]
    fn one_over_the_cap_truncates() {
        let imgs: String = (0..1001).map(|i| format!(r#"<img src="/i{i}.png">"#)).collect();
        let d = Html::parse_document(&format!("<body>{imgs}</body>"));
        let (assets, truncated) = extract_assets(&d, &base(), "https://a.test/");
        assert_eq!(assets.len(), 1000);
        assert!(truncated);
    }
}
