//! End-to-end raw-mode crawls over local HTTP fixtures.

mod common;

use cartographer::records::{ErrorRecord, NavEndReason, PageRecord, RenderMode};
use cartographer::url_norm::ParamPolicy;
use cartographer::{Cartographer, EventKind};
use common::{fast_config, read_dataset, read_manifest, read_summary};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

async fn run_to_completion(cfg: cartographer::CrawlConfig) -> std::path::PathBuf {
    let engine = Cartographer::new();
    engine.start(cfg).await.unwrap();
    engine.join().await.unwrap()
}

#[tokio::test]
async fn handlers_registered_before_start_receive_events() {
    let mut server = mockito::Server::new_async().await;
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;
    let _page = server
        .mock("GET", "/")
        .with_header("Content-Type", "text/html")
        .with_body("<html><body>hi</body></html>")
        .create_async()
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let cfg = fast_config(&format!("{}/", server.url()), tmp.path())
        .max_pages(1)
        .build()
        .unwrap();

    // The façade owns its bus for its whole lifetime: subscribing before
    // any crawl starts is valid and the handler sees the crawl's events.
    let engine = Cartographer::new();
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let started_clone = Arc::clone(&started);
    let finished_clone = Arc::clone(&finished);
    let _on_started = engine.on(Some(EventKind::Started), move |_| {
        started_clone.fetch_add(1, Ordering::SeqCst);
    });
    let _on_finished = engine.on(Some(EventKind::Finished), move |_| {
        finished_clone.fetch_add(1, Ordering::SeqCst);
    });
    // Give the handler tasks a beat to attach their receivers.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    engine.start(cfg).await.unwrap();
    engine.join().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn single_page_static_crawl() {
    let mut server = mockito::Server::new_async().await;
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_body("User-agent: *\nDisallow:\n")
        .create_async()
        .await;
    let _page = server
        .mock("GET", "/")
        .with_header("Content-Type", "text/html")
        .with_body("<html><head><title>Home</title></head><body><h1>Hi</h1></body></html>")
        .create_async()
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let cfg = fast_config(&format!("{}/", server.url()), tmp.path())
        .max_pages(1)
        .build()
        .unwrap();
    let staging = cfg.effective_staging_dir();
    let archive = run_to_completion(cfg).await;
    assert!(archive.exists());

    let pages: Vec<PageRecord> = read_dataset(&staging, "pages");
    assert_eq!(pages.len(), 1);
    let page = &pages[0];
    assert_eq!(page.render_mode, RenderMode::Raw);
    assert_eq!(page.nav_end_reason, NavEndReason::Fetch);
    assert_eq!(page.dom_hash, page.raw_html_hash);
    assert!(page.render_ms < 100);
    assert_eq!(page.title.as_deref(), Some("Home"));
    assert_eq!(page.depth, 0);

    let errors: Vec<ErrorRecord> = read_dataset(&staging, "errors");
    assert!(errors.is_empty());

    let manifest = read_manifest(&staging);
    assert_eq!(manifest.capabilities.spec_level, 1);
    assert_eq!(manifest.capabilities.modes_used, vec![RenderMode::Raw]);
    for dataset in ["pages", "edges", "assets", "errors", "accessibility"] {
        assert!(
            manifest.datasets.contains_key(dataset),
            "missing dataset {dataset}"
        );
    }
}

#[tokio::test]
async fn link_discovery_respects_max_depth() {
    let mut server = mockito::Server::new_async().await;
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;
    let _home = server
        .mock("GET", "/")
        .with_header("Content-Type", "text/html")
        .with_body(r#"<html><body><a href="/a">a</a><a href="/b">b</a></body></html>"#)
        .create_async()
        .await;
    for path in ["/a", "/b"] {
        let _ = server
            .mock("GET", path)
            .with_header("Content-Type", "text/html")
            .with_body(r#"<html><body><a href="/c">c</a></body></html>"#)
            .create_async()
            .await;
    }
    let _c = server
        .mock("GET", "/c")
        .with_header("Content-Type", "text/html")
        .with_body("<html><body>leaf</body></html>")
        .create_async()
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let cfg = fast_config(&format!("{}/", server.url()), tmp.path())
        .max_depth(1)
        .build()
        .unwrap();
    let staging = cfg.effective_staging_dir();
    run_to_completion(cfg).await;

    let pages: Vec<PageRecord> = read_dataset(&staging, "pages");
    // Depth 1 admits /a and /b but never /c.
    assert_eq!(pages.len(), 3);
    assert!(pages.iter().all(|p| p.depth <= 1));
    let urls: Vec<&str> = pages.iter().map(|p| p.url.as_str()).collect();
    assert!(!urls.iter().any(|u| u.ends_with("/c")));

    let summary = read_summary(&staging);
    assert_eq!(summary.totals.pages, 3);
    assert_eq!(summary.max_depth_reached, 1);
}

#[tokio::test]
async fn max_pages_caps_admission_and_reports_capped() {
    let mut server = mockito::Server::new_async().await;
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;
    let links: String = (1..=10).map(|i| format!(r#"<a href="/p{i}">p</a>"#)).collect();
    let _home = server
        .mock("GET", "/")
        .with_header("Content-Type", "text/html")
        .with_body(format!("<html><body>{links}</body></html>"))
        .create_async()
        .await;
    for i in 1..=10 {
        let _ = server
            .mock("GET", format!("/p{i}").as_str())
            .with_header("Content-Type", "text/html")
            .with_body("<html><body>x</body></html>")
            .create_async()
            .await;
    }

    let tmp = tempfile::tempdir().unwrap();
    let cfg = fast_config(&format!("{}/", server.url()), tmp.path())
        .max_pages(3)
        .build()
        .unwrap();
    let staging = cfg.effective_staging_dir();
    run_to_completion(cfg).await;

    let pages: Vec<PageRecord> = read_dataset(&staging, "pages");
    assert!(pages.len() <= 3);
    let manifest = read_manifest(&staging);
    assert_eq!(
        manifest.completion_reason,
        cartographer::CompletionReason::Capped
    );
    // A capped crawl still completed everything its config allowed.
    assert!(!manifest.incomplete);
}

#[tokio::test]
async fn robots_blocked_pages_produce_error_records_only() {
    let mut server = mockito::Server::new_async().await;
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_body("User-agent: *\nDisallow: /private/\n")
        .create_async()
        .await;
    let _home = server
        .mock("GET", "/")
        .with_header("Content-Type", "text/html")
        .with_body(r#"<html><body><a href="/private/x">secret</a></body></html>"#)
        .create_async()
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let cfg = fast_config(&format!("{}/", server.url()), tmp.path())
        .build()
        .unwrap();
    let staging = cfg.effective_staging_dir();
    run_to_completion(cfg).await;

    let pages: Vec<PageRecord> = read_dataset(&staging, "pages");
    assert_eq!(pages.len(), 1);

    let errors: Vec<ErrorRecord> = read_dataset(&staging, "errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, "ROBOTS_BLOCKED");
    assert!(errors[0].url.ends_with("/private/x"));

    // Invariant: an admitted key yields a page xor at least one error.
    let page_keys: std::collections::HashSet<_> =
        pages.iter().map(|p| p.url_key.clone()).collect();
    let error_keys: std::collections::HashSet<_> = errors
        .iter()
        .map(|e| {
            let normalized = cartographer::url_norm::normalize(&e.url).unwrap();
            cartographer::url_norm::url_key(&normalized)
        })
        .collect();
    assert!(page_keys.is_disjoint(&error_keys));
}

#[tokio::test]
async fn sample_param_policy_crawls_distinct_ids() {
    let mut server = mockito::Server::new_async().await;
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;
    let links: String = (1..=20)
        .map(|i| format!(r#"<a href="/item?id={i}&utm_source=x">item {i}</a>"#))
        .collect();
    let _home = server
        .mock("GET", "/")
        .with_header("Content-Type", "text/html")
        .with_body(format!("<html><body>{links}</body></html>"))
        .create_async()
        .await;
    for i in 1..=20 {
        let _ = server
            .mock("GET", mockito::Matcher::Exact(format!("/item?id={i}")))
            .with_header("Content-Type", "text/html")
            .with_body("<html><body>item</body></html>")
            .create_async()
            .await;
    }

    let tmp = tempfile::tempdir().unwrap();
    let cfg = fast_config(&format!("{}/", server.url()), tmp.path())
        .param_policy(ParamPolicy::Sample)
        .block_list(["utm_*"])
        .build()
        .unwrap();
    let staging = cfg.effective_staging_dir();
    run_to_completion(cfg).await;

    let pages: Vec<PageRecord> = read_dataset(&staging, "pages");
    let items: Vec<&PageRecord> = pages.iter().filter(|p| p.url.contains("/item")).collect();
    assert_eq!(items.len(), 20, "all distinct id values crawl");
    for page in &items {
        assert!(!page.url.contains("utm_source"));
        assert!(!page.normalized_url.contains("utm_source"));
    }
}
