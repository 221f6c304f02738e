//! Cancel-and-resume parity: an interrupted crawl resumed from its staging
//! directory ends with the same page set as an uninterrupted control run.

mod common;

use cartographer::records::PageRecord;
use cartographer::{Cartographer, EventKind};
use common::{fast_config, read_dataset, read_manifest};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SITE_PAGES: usize = 12;

async fn fixture_server() -> mockito::ServerGuard {
    let mut server = mockito::Server::new_async().await;
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;
    let links: String = (1..=SITE_PAGES - 1)
        .map(|i| format!(r#"<a href="/p{i}">p{i}</a>"#))
        .collect();
    let _home = server
        .mock("GET", "/")
        .with_header("Content-Type", "text/html")
        .with_body(format!("<html><body>{links}</body></html>"))
        .create_async()
        .await;
    for i in 1..=SITE_PAGES - 1 {
        let _ = server
            .mock("GET", format!("/p{i}").as_str())
            .with_header("Content-Type", "text/html")
            .with_body(format!("<html><body>page {i}</body></html>"))
            .create_async()
            .await;
    }
    server
}

fn page_keys(staging: &std::path::Path) -> BTreeSet<String> {
    read_dataset::<PageRecord>(staging, "pages")
        .into_iter()
        .map(|p| p.url_key)
        .collect()
}

#[tokio::test]
async fn cancelled_crawl_resumes_to_full_parity() {
    let server = fixture_server().await;
    let seed = format!("{}/", server.url());

    // Control: uninterrupted crawl of the whole fixture.
    let control_tmp = tempfile::tempdir().unwrap();
    let control_cfg = fast_config(&seed, control_tmp.path()).build().unwrap();
    let control_staging = control_cfg.effective_staging_dir();
    {
        let engine = Cartographer::new();
        engine.start(control_cfg).await.unwrap();
        engine.join().await.unwrap();
    }
    let control_keys = page_keys(&control_staging);
    assert_eq!(control_keys.len(), SITE_PAGES);

    // Interrupted run: pace the crawl down so the cancel lands mid-crawl,
    // checkpointing every page so the cancel point is always durable.
    let tmp = tempfile::tempdir().unwrap();
    let cfg = fast_config(&seed, tmp.path())
        .per_host_rps(20.0)
        .burst(2.0)
        .concurrency(1)
        .checkpoint_interval(1)
        .build()
        .unwrap();
    let staging = cfg.effective_staging_dir();

    let engine = Cartographer::new();
    engine.start(cfg).await.unwrap();

    let parsed = Arc::new(AtomicUsize::new(0));
    let parsed_clone = Arc::clone(&parsed);
    let bus = engine.bus();
    let _sub = bus.on(Some(EventKind::PageParsed), move |_| {
        parsed_clone.fetch_add(1, Ordering::SeqCst);
    });

    // Wait until some pages landed, then cancel mid-crawl.
    for _ in 0..400 {
        if parsed.load(Ordering::SeqCst) >= 4 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    engine.cancel().await.unwrap();
    engine.join().await.unwrap();

    // Drop the handler subscription before its bus goes away.
    drop(_sub);

    let interrupted_keys = page_keys(&staging);
    assert!(interrupted_keys.len() < SITE_PAGES, "cancel landed mid-crawl");
    let manifest = read_manifest(&staging);
    assert!(manifest.incomplete);
    assert_eq!(
        manifest.completion_reason,
        cartographer::CompletionReason::Manual
    );

    // Resume from the staging directory and run to completion.
    let resume_cfg = fast_config(&seed, tmp.path())
        .resume_from(&staging)
        .build()
        .unwrap();
    {
        let engine = Cartographer::new();
        engine.start(resume_cfg).await.unwrap();
        engine.join().await.unwrap();
    }

    let final_keys = page_keys(&staging);
    assert_eq!(final_keys, control_keys, "resumed set equals control set");

    let manifest = read_manifest(&staging);
    assert!(!manifest.incomplete);
    assert!(
        manifest.notes.iter().any(|n| n.contains("Resumed from crawl")),
        "manifest records resume lineage: {:?}",
        manifest.notes
    );
}

#[tokio::test]
async fn resume_never_refetches_visited_pages() {
    let mut server = mockito::Server::new_async().await;
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;
    // The seed page allows exactly one fetch; a resumed crawl that
    // re-admitted it would trip the expectation.
    let home = server
        .mock("GET", "/")
        .with_header("Content-Type", "text/html")
        .with_body(r#"<html><body><a href="/only">x</a></body></html>"#)
        .expect(1)
        .create_async()
        .await;
    let _only = server
        .mock("GET", "/only")
        .with_header("Content-Type", "text/html")
        .with_body("<html><body>leaf</body></html>")
        .create_async()
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let seed = format!("{}/", server.url());
    let cfg = fast_config(&seed, tmp.path())
        .concurrency(1)
        .checkpoint_interval(1)
        .build()
        .unwrap();
    let staging = cfg.effective_staging_dir();
    {
        let engine = Cartographer::new();
        engine.start(cfg).await.unwrap();

        // Cancel as soon as the seed page has been parsed; the leaf may or
        // may not have landed, but the seed is durably visited either way.
        let parsed = Arc::new(AtomicUsize::new(0));
        let parsed_clone = Arc::clone(&parsed);
        let bus = engine.bus();
        let _sub = bus.on(Some(EventKind::PageParsed), move |_| {
            parsed_clone.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..400 {
            if parsed.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        // The tiny fixture may have finished already; that is fine, the
        // resume below is then a no-op over a complete frontier.
        let _ = engine.cancel().await;
        engine.join().await.unwrap();
    }
    assert!(!page_keys(&staging).is_empty());

    // Resume: only URLs still in the frontier are fetched.
    let resume_cfg = fast_config(&seed, tmp.path())
        .resume_from(&staging)
        .build()
        .unwrap();
    {
        let engine = Cartographer::new();
        engine.start(resume_cfg).await.unwrap();
        engine.join().await.unwrap();
    }

    home.assert_async().await;
    assert_eq!(page_keys(&staging).len(), 2);
}
