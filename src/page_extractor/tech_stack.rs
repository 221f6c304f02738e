//! Technology fingerprinting from markup, script sources, meta tags and
//! response headers.

use once_cell::sync::Lazy;
use scraper::Html;
use std::collections::BTreeMap;

use super::sel;

struct Fingerprint {
    name: &'static str,
    /// Substrings matched against the raw HTML.
    html: &'static [&'static str],
    /// Substrings matched against `script[src]` URLs.
    script_src: &'static [&'static str],
    /// (meta name, content substring) pairs.
    meta: &'static [(&'static str, &'static str)],
    /// (header name, value substring) pairs; header names lowercase.
    headers: &'static [(&'static str, &'static str)],
}

static FINGERPRINTS: Lazy<Vec<Fingerprint>> = Lazy::new(|| {
    vec![
        Fingerprint {
            name: "WordPress",
            html: &["/wp-content/", "/wp-includes/"],
            script_src: &["/wp-content/", "/wp-includes/"],
            meta: &[("generator", "wordpress")],
            headers: &[],
        },
        Fingerprint {
            name: "Drupal",
            html: &["/sites/default/files/"],
            script_src: &["/core/misc/drupal"],
            meta: &[("generator", "drupal")],
            headers: &[("x-generator", "drupal")],
        },
        Fingerprint {
            name: "Joomla",
            html: &["/media/jui/"],
            script_src: &["/media/system/js/"],
            meta: &[("generator", "joomla")],
            headers: &[],
        },
        Fingerprint {
            name: "Shopify",
            html: &["cdn.shopify.com"],
            script_src: &["cdn.shopify.com"],
            meta: &[],
            headers: &[("x-shopify-stage", "")],
        },
        Fingerprint {
            name: "Magento",
            html: &["/static/frontend/", "mage/"],
            script_src: &["mage/requirejs"],
            meta: &[],
            headers: &[("x-magento-cache-debug", "")],
        },
        Fingerprint {
            name: "Wix",
            html: &["wix.com", "wixstatic.com"],
            script_src: &["static.parastorage.com"],
            meta: &[("generator", "wix")],
            headers: &[],
        },
        Fingerprint {
            name: "Squarespace",
            html: &["squarespace.com"],
            script_src: &["squarespace-cdn.com"],
            meta: &[("generator", "squarespace")],
            headers: &[],
        },
        Fingerprint {
            name: "Ghost",
            html: &[],
            script_src: &["/public/ghost-sdk"],
            meta: &[("generator", "ghost")],
            headers: &[],
        },
        Fingerprint {
            name: "React",
            html: &["data-reactroot", "__NEXT_DATA__", "react-dom"],
            script_src: &["react.production.min.js", "react-dom"],
            meta: &[],
            headers: &[],
        },
        Fingerprint {
            name: "Next.js",
            html: &["__NEXT_DATA__", "/_next/static/"],
            script_src: &["/_next/static/"],
            meta: &[("generator", "next.js")],
            headers: &[("x-powered-by", "next.js")],
        },
        Fingerprint {
            name: "Vue.js",
            html: &["data-v-app", "__vue__"],
            script_src: &["vue.runtime", "vue.global"],
            meta: &[],
            headers: &[],
        },
        Fingerprint {
            name: "Nuxt",
            html: &["__NUXT__", "/_nuxt/"],
            script_src: &["/_nuxt/"],
            meta: &[],
            headers: &[],
        },
        Fingerprint {
            name: "Angular",
            html: &["ng-version="],
            script_src: &[],
            meta: &[],
            headers: &[],
        },
        Fingerprint {
            name: "Svelte",
            html: &["svelte-"],
            script_src: &["/_app/immutable/"],
            meta: &[],
            headers: &[],
        },
        Fingerprint {
            name: "jQuery",
            html: &[],
            script_src: &["jquery.min.js", "jquery-"],
            meta: &[],
            headers: &[],
        },
        Fingerprint {
            name: "Bootstrap",
            html: &[],
            script_src: &["bootstrap.min.js", "bootstrap.bundle"],
            meta: &[],
            headers: &[],
        },
        Fingerprint {
            name: "Google Analytics",
            html: &["gtag('config'", "ga('create'"],
            script_src: &["google-analytics.com/analytics.js", "googletagmanager.com/gtag/js"],
            meta: &[],
            headers: &[],
        },
        Fingerprint {
            name: "Google Tag Manager",
            html: &["googletagmanager.com/ns.html"],
            script_src: &["googletagmanager.com/gtm.js"],
            meta: &[],
            headers: &[],
        },
        Fingerprint {
            name: "Cloudflare",
            html: &[],
            script_src: &["cdn-cgi/"],
            meta: &[],
            headers: &[("server", "cloudflare"), ("cf-ray", "")],
        },
        Fingerprint {
            name: "Nginx",
            html: &[],
            script_src: &[],
            meta: &[],
            headers: &[("server", "nginx")],
        },
        Fingerprint {
            name: "Apache",
            html: &[],
            script_src: &[],
            meta: &[],
            headers: &[("server", "apache")],
        },
        Fingerprint {
            name: "Varnish",
            html: &[],
            script_src: &[],
            meta: &[],
            headers: &[("via", "varnish"), ("x-varnish", "")],
        },
        Fingerprint {
            name: "PHP",
            html: &[],
            script_src: &[],
            meta: &[],
            headers: &[("x-powered-by", "php")],
        },
        Fingerprint {
            name: "ASP.NET",
            html: &["__VIEWSTATE"],
            script_src: &[],
            meta: &[],
            headers: &[("x-aspnet-version", ""), ("x-powered-by", "asp.net")],
        },
        Fingerprint {
            name: "Express",
            html: &[],
            script_src: &[],
            meta: &[],
            headers: &[("x-powered-by", "express")],
        },
        Fingerprint {
            name: "Laravel",
            html: &[],
            script_src: &[],
            meta: &[("csrf-token", "")],
            headers: &[("set-cookie", "laravel_session")],
        },
    ]
});

/// Match the fingerprint table; returns a sorted, de-duplicated list.
pub fn detect_tech_stack(
    doc: &Html,
    raw_html: &str,
    headers: &BTreeMap<String, String>,
) -> Vec<String> {
    let script_srcs: Vec<String> = doc
        .select(&sel("script[src]"))
        .filter_map(|el| el.value().attr("src").map(str::to_lowercase))
        .collect();
    let metas: Vec<(String, String)> = doc
        .select(&sel("meta[name]"))
        .filter_map(|el| {
            Some((
                el.value().attr("name")?.to_lowercase(),
                el.value().attr("content").unwrap_or("").to_lowercase(),
            ))
        })
        .collect();
    let html_lower = raw_html.to_lowercase();

    let mut found: Vec<String> = FINGERPRINTS
        .iter()
        .filter(|fp| {
            fp.html.iter().any(|pat| html_lower.contains(&pat.to_lowercase()))
                || fp
                    .script_src
                    .iter()
                    .any(|pat| script_srcs.iter().any(|src| src.contains(pat)))
                || fp.meta.iter().any(|(name, value)| {
                    metas
                        .iter()
                        .any(|(n, c)| n == name && (value.is_empty() || c.contains(value)))
                })
                || fp.headers.iter().any(|(name, value)| {
                    headers
                        .get(*name)
                        .is_some_and(|v| value.is_empty() || v.to_lowercase().contains(value))
                })
        })
        .map(|fp| fp.name.to_string())
        .collect();

    found.sort();
    found.dedup();
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(html: &str, headers: &[(&str, &str)]) -> Vec<String> {
        let doc = Html::parse_document(html);
        let headers: BTreeMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        detect_tech_stack(&doc, html, &headers)
    }

    #[test]
    fn wordpress_from_content_path() {
        let found = detect(
            r#"<html><head><link href="/wp-content/themes/x/style.css"></head></html>"#,
            &[],
        );
        assert_eq!(found, vec!["WordPress"]);
    }

    #[test]
    fn nextjs_implies_react_marker_too() {
        let found = detect(
            r#"<html><body><script id="__NEXT_DATA__">{}</script>
               <script src="/_next/static/chunks/main.js"></script></body></html>"#,
            &[],
        );
        assert!(found.contains(&"Next.js".to_string()));
        assert!(found.contains(&"React".to_string()));
    }

    #[test]
    fn headers_only_detection() {
        let found = detect("<html></html>", &[("server", "cloudflare"), ("x-powered-by", "Express")]);
        assert_eq!(found, vec!["Cloudflare", "Express"]);
    }

    #[test]
    fn generator_meta_detection() {
        let found = detect(
            r#"<head><meta name="generator" content="WordPress 6.4"></head>"#,
            &[],
        );
        assert_eq!(found, vec!["WordPress"]);
    }

    #[test]
    fn output_is_sorted_and_unique() {
        let found = detect(
            r#"<head><meta name="generator" content="WordPress">
               <script src="/wp-includes/js/jquery/jquery.min.js"></script></head>"#,
            &[("server", "nginx")],
        );
        assert_eq!(found, vec!["Nginx", "WordPress", "jQuery"]);
    }

    #[test]
    fn empty_page_detects_nothing() {
        assert!(detect("<html></html>", &[]).is_empty());
    }
}
