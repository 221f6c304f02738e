//! Head-and-body facts for the page record.

use scraper::{ElementRef, Html};
use url::Url;

use super::{collapse_ws, sel};
use crate::records::{Canonical, Heading, Hreflang, NoindexSurface};
use crate::url_norm::safe_join;

/// Visible-text sample size in bytes.
const TEXT_SAMPLE_BYTES: usize = 1500;

/// Everything the page-facts extractor produces.
#[derive(Debug, Clone, Default)]
pub struct PageFacts {
    pub title: Option<String>,
    pub meta_description: Option<String>,
    pub h1: Option<String>,
    pub headings: Vec<Heading>,
    pub canonical: Option<Canonical>,
    pub meta_robots: Option<String>,
    pub robots_header: Option<String>,
    pub noindex_surface: NoindexSurface,
    pub hreflang: Vec<Hreflang>,
    pub language: Option<String>,
    pub favicon_url: Option<String>,
    pub text_sample: Option<String>,
    pub link_out_count: u32,
    pub media_count: u32,
    pub missing_alt_count: u32,
}

pub fn extract_page_facts(doc: &Html, base: &Url, robots_header: Option<&str>) -> PageFacts {
    let title = first_text(doc, "title");
    let meta_description = meta_content(doc, "description");
    let meta_robots = meta_content(doc, "robots");

    let mut headings = Vec::new();
    for el in doc.select(&sel("h1, h2, h3, h4, h5, h6")) {
        let name = el.value().name();
        let level = name.as_bytes().get(1).map(|b| b - b'0').unwrap_or(6);
        let text = collapse_ws(&el.text().collect::<String>());
        if !text.is_empty() {
            headings.push(Heading { level, text });
        }
    }
    let h1 = headings.iter().find(|h| h.level == 1).map(|h| h.text.clone());

    let canonical = doc
        .select(&sel(r#"link[rel="canonical"]"#))
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(|raw| Canonical {
            raw: raw.to_string(),
            resolved: safe_join(base, raw).map(|u| u.to_string()),
        });

    let hreflang = doc
        .select(&sel(r#"link[rel="alternate"][hreflang]"#))
        .filter_map(|el| {
            let lang = el.value().attr("hreflang")?.to_string();
            let href = el.value().attr("href")?;
            let href = safe_join(base, href)?.to_string();
            Some(Hreflang { lang, href })
        })
        .collect();

    let language = doc
        .select(&sel("html"))
        .next()
        .and_then(|el| el.value().attr("lang"))
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());

    let favicon_url = doc
        .select(&sel(r#"link[rel~="icon"], link[rel="apple-touch-icon"]"#))
        .find_map(|el| el.value().attr("href"))
        .and_then(|href| safe_join(base, href))
        .map(|u| u.to_string())
        .or_else(|| safe_join(base, "/favicon.ico").map(|u| u.to_string()));

    let link_out_count = doc.select(&sel("a[href]")).count() as u32;
    let media_count = doc.select(&sel("img, video")).count() as u32;
    let missing_alt_count = doc
        .select(&sel("img"))
        .filter(|img| {
            img.value()
                .attr("alt")
                .map_or(true, |alt| alt.trim().is_empty())
        })
        .count() as u32;

    let meta_noindex = meta_robots
        .as_deref()
        .is_some_and(|v| v.to_lowercase().contains("noindex"));
    let header_noindex =
        robots_header.is_some_and(|v| v.to_lowercase().contains("noindex"));
    let noindex_surface = match (meta_noindex, header_noindex) {
        (true, true) => NoindexSurface::Both,
        (true, false) => NoindexSurface::Meta,
        (false, true) => NoindexSurface::Header,
        (false, false) => NoindexSurface::None,
    };

    PageFacts {
        title,
        meta_description,
        h1,
        headings,
        canonical,
        meta_robots,
        robots_header: robots_header.map(str::to_string),
        noindex_surface,
        hreflang,
        language,
        favicon_url,
        text_sample: text_sample(doc),
        link_out_count,
        media_count,
        missing_alt_count,
    }
}

fn first_text(doc: &Html, selector: &str) -> Option<String> {
    doc.select(&sel(selector))
        .next()
        .map(|el| collapse_ws(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

fn meta_content(doc: &Html, name: &str) -> Option<String> {
    doc.select(&sel("meta[name]"))
        .find(|el| {
            el.value()
                .attr("name")
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
        .and_then(|el| el.value().attr("content"))
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
}

/// First 1500 bytes of visible body text with whitespace collapsed,
/// truncated on a char boundary.
fn text_sample(doc: &Html) -> Option<String> {
    let body = doc.select(&sel("body")).next()?;
    let mut collected = String::new();
    visible_text(&body, &mut collected);
    let collapsed = collapse_ws(&collected);
    if collapsed.is_empty() {
        return None;
    }
    if collapsed.len() <= TEXT_SAMPLE_BYTES {
        return Some(collapsed);
    }
    let mut cut = TEXT_SAMPLE_BYTES;
    while !collapsed.is_char_boundary(cut) {
        cut -= 1;
    }
    Some(collapsed[..cut].to_string())
}

fn visible_text(el: &ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        } else if let Some(child_el) = ElementRef::wrap(child) {
            let name = child_el.value().name();
            if matches!(name, "script" | "style" | "noscript" | "template") {
                continue;
            }
            visible_text(&child_el, out);
        }
        if out.len() > TEXT_SAMPLE_BYTES * 4 {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(html: &str) -> Html {
        Html::parse_document(html)
    }

    fn base() -> Url {
        Url::parse("https://a.test/dir/page").unwrap()
    }

    #[test]
    fn full_head_extraction() {
        let d = doc(r#"<html lang="en-GB"><head>
            <title> The  Title </title>
            <meta name="description" content="A description">
            <meta name="robots" content="noindex, nofollow">
            <link rel="canonical" href="/canonical">
            <link rel="alternate" hreflang="de" href="/de">
            <link rel="icon" href="/fav.png">
        </head><body><h1>Welcome</h1><h2>Sub</h2></body></html>"#);

        let facts = extract_page_facts(&d, &base(), Some("noindex"));
        assert_eq!(facts.title.as_deref(), Some("The Title"));
        assert_eq!(facts.meta_description.as_deref(), Some("A description"));
        assert_eq!(facts.h1.as_deref(), Some("Welcome"));
        assert_eq!(facts.headings.len(), 2);
        assert_eq!(facts.headings[1].level, 2);
        let canonical = facts.canonical.unwrap();
        assert_eq!(canonical.raw, "/canonical");
        assert_eq!(canonical.resolved.as_deref(), Some("https://a.test/canonical"));
        assert_eq!(facts.hreflang.len(), 1);
        assert_eq!(facts.hreflang[0].lang, "de");
        assert_eq!(facts.language.as_deref(), Some("en-GB"));
        assert_eq!(facts.favicon_url.as_deref(), Some("https://a.test/fav.png"));
        assert_eq!(facts.noindex_surface, NoindexSurface::Both);
    }

    #[test]
    fn noindex_surface_variants() {
        let plain = doc("<html><body></body></html>");
        assert_eq!(
            extract_page_facts(&plain, &base(), None).noindex_surface,
            NoindexSurface::None
        );
        assert_eq!(
            extract_page_facts(&plain, &base(), Some("noindex")).noindex_surface,
            NoindexSurface::Header
        );
        let meta = doc(r#"<head><meta name="robots" content="NOINDEX"></head>"#);
        assert_eq!(
            extract_page_facts(&meta, &base(), None).noindex_surface,
            NoindexSurface::Meta
        );
    }

    #[test]
    fn favicon_falls_back_to_well_known_path() {
        let d = doc("<html><head></head><body></body></html>");
        let facts = extract_page_facts(&d, &base(), None);
        assert_eq!(facts.favicon_url.as_deref(), Some("https://a.test/favicon.ico"));
    }

    #[test]
    fn counts_and_missing_alt() {
        let d = doc(
            r#"<body>
                <a href="/1">one</a><a href="/2">two</a>
                <img src="a.png" alt="ok"><img src="b.png"><img src="c.png" alt="  ">
                <video src="v.mp4"></video>
            </body>"#,
        );
        let facts = extract_page_facts(&d, &base(), None);
        assert_eq!(facts.link_out_count, 2);
        assert_eq!(facts.media_count, 4);
        assert_eq!(facts.missing_alt_count, 2);
    }

    #[test]
    fn text_sample_skips_scripts_and_collapses() {
        let d = doc(
            "<body><p>Hello   world</p><script>var x = 'invisible';</script><p>again</p></body>",
        );
        let facts = extract_page_facts(&d, &base(), None);
        assert_eq!(facts.text_sample.as_deref(), Some("Hello world again"));
    }

    #[test]
    fn text_sample_truncates_at_1500_bytes() {
        let long = format!("<body><p>{}</p></body>", "word ".repeat(1000));
        let d = doc(&long);
        let facts = extract_page_facts(&d, &base(), None);
        assert!(facts.text_sample.unwrap().len() <= 1500);
    }
}
