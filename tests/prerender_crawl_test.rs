//! Prerender-mode crawls against the scripted browser engine.

mod common;

use cartographer::records::{EdgeRecord, ErrorRecord, LinkLocation, PageRecord, RenderMode};
use cartographer::{Cartographer, EventKind};
use common::{fast_config, read_dataset, read_manifest, scripted, ScriptedEngine, ScriptedPage};

#[tokio::test]
async fn prerendered_link_location_is_resolved() {
    let mut server = mockito::Server::new_async().await;
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;
    // The raw fetch body is minimal; the rendered DOM carries the link.
    let _home = server
        .mock("GET", "/")
        .with_header("Content-Type", "text/html")
        .with_body("<html><body>unrendered</body></html>")
        .create_async()
        .await;
    let _about = server
        .mock("GET", "/about")
        .with_header("Content-Type", "text/html")
        .with_body("<html><body>about</body></html>")
        .create_async()
        .await;

    let base = server.url();
    let engine = ScriptedEngine::new()
        .serve(
            &format!("{base}/"),
            "Home",
            &format!(
                r#"<html><head><title>Home</title></head>
                   <body><nav><a href="{base}/about">About</a></nav></body></html>"#
            ),
        )
        .serve(
            &format!("{base}/about"),
            "About",
            "<html><head><title>About</title></head><body><main>About us</main></body></html>",
        );

    let tmp = tempfile::tempdir().unwrap();
    let cfg = fast_config(&format!("{base}/"), tmp.path())
        .render_mode(RenderMode::Prerender)
        .max_pages(2)
        .build()
        .unwrap();
    let staging = cfg.effective_staging_dir();

    let cartographer = Cartographer::new();
    cartographer
        .start_with_engine(cfg, Some(scripted(engine)))
        .await
        .unwrap();
    cartographer.join().await.unwrap();

    let pages: Vec<PageRecord> = read_dataset(&staging, "pages");
    assert_eq!(pages.len(), 2);
    assert!(pages.iter().all(|p| p.render_mode == RenderMode::Prerender));
    // Rendered DOM differs from the fetched body, so the hashes differ.
    assert!(pages.iter().all(|p| p.dom_hash != p.raw_html_hash));

    let edges: Vec<EdgeRecord> = read_dataset(&staging, "edges");
    let internal: Vec<&EdgeRecord> = edges.iter().filter(|e| !e.external).collect();
    assert_eq!(internal.len(), 1);
    assert_eq!(internal[0].location, LinkLocation::Nav);

    let manifest = read_manifest(&staging);
    assert_eq!(manifest.capabilities.spec_level, 2);
}

#[tokio::test]
async fn unresolved_challenge_writes_error_record_only() {
    let mut server = mockito::Server::new_async().await;
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;
    let _page = server
        .mock("GET", "/")
        .with_header("Content-Type", "text/html")
        .with_body("<html><head><title>Just a moment...</title></head><body></body></html>")
        .create_async()
        .await;

    let base = server.url();
    // The scripted DOM never changes, so the challenge never clears.
    let engine = ScriptedEngine::new().serve(
        &format!("{base}/"),
        "Just a moment...",
        r#"<html><head><title>Just a moment...</title></head>
           <body><form id="challenge-form"></form></body></html>"#,
    );

    let tmp = tempfile::tempdir().unwrap();
    let cfg = fast_config(&format!("{base}/"), tmp.path())
        .render_mode(RenderMode::Prerender)
        .max_pages(1)
        .build()
        .unwrap();
    let staging = cfg.effective_staging_dir();

    let cartographer = Cartographer::new();
    cartographer
        .start_with_engine(cfg, Some(scripted(engine)))
        .await
        .unwrap();

    let bus = cartographer.bus();
    let mut events = bus.subscribe();
    cartographer.join().await.unwrap();

    let pages: Vec<PageRecord> = read_dataset(&staging, "pages");
    assert!(pages.is_empty());

    let errors: Vec<ErrorRecord> = read_dataset(&staging, "errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, "CHALLENGE_DETECTED");
    assert!(matches!(
        errors[0].phase,
        cartographer::records::ErrorPhase::Render
    ));

    // crawl.finished fires with incomplete=false: the challenge is a
    // recoverable error, not an interruption.
    let mut finished_incomplete = None;
    while let Ok(envelope) = events.try_recv() {
        if envelope.kind() == EventKind::Finished {
            if let cartographer::CrawlEvent::Finished { incomplete, .. } = envelope.event {
                finished_incomplete = Some(incomplete);
            }
        }
    }
    assert_eq!(finished_incomplete, Some(false));
}

#[tokio::test]
async fn clearing_challenge_recovers_and_stores_page() {
    let mut server = mockito::Server::new_async().await;
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;
    let _page = server
        .mock("GET", "/")
        .with_header("Content-Type", "text/html")
        .with_body("<html><body>raw</body></html>")
        .create_async()
        .await;

    let base = server.url();
    let engine = ScriptedEngine::new().serve_sequence(
        &format!("{base}/"),
        vec![
            ScriptedPage::new(
                "Just a moment...",
                "<html><head><title>Just a moment...</title></head><body></body></html>",
            ),
            ScriptedPage::new(
                "Welcome",
                "<html><head><title>Welcome</title></head><body><h1>Real page</h1></body></html>",
            ),
        ],
    );

    let tmp = tempfile::tempdir().unwrap();
    let cfg = fast_config(&format!("{base}/"), tmp.path())
        .render_mode(RenderMode::Prerender)
        .max_pages(1)
        .build()
        .unwrap();
    let staging = cfg.effective_staging_dir();

    let cartographer = Cartographer::new();
    cartographer
        .start_with_engine(cfg, Some(scripted(engine)))
        .await
        .unwrap();
    cartographer.join().await.unwrap();

    let pages: Vec<PageRecord> = read_dataset(&staging, "pages");
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].title.as_deref(), Some("Welcome"));
    assert_eq!(pages[0].challenge_captured, Some(false));

    let errors: Vec<ErrorRecord> = read_dataset(&staging, "errors");
    assert!(errors.is_empty());
}
