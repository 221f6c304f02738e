//! Sealed-container contract: counts, integrity hashes, validation.

mod common;

use cartographer::records::PageRecord;
use cartographer::{validate_archive, Cartographer};
use common::{fast_config, read_dataset, read_manifest, read_zip_entry};
use sha2::{Digest, Sha256};

async fn crawl_small_site(tmp: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let mut server = mockito::Server::new_async().await;
    let _robots = server
        .mock("GET", "/robots.txt")
        .with_status(404)
        .create_async()
        .await;
    let links: String = (1..=5).map(|i| format!(r#"<a href="/p{i}">p{i}</a>"#)).collect();
    let _home = server
        .mock("GET", "/")
        .with_header("Content-Type", "text/html")
        .with_body(format!(
            r#"<html><head><title>Home</title></head>
               <body><img src="/a.png">{links}</body></html>"#
        ))
        .create_async()
        .await;
    for i in 1..=5 {
        let _ = server
            .mock("GET", format!("/p{i}").as_str())
            .with_header("Content-Type", "text/html")
            .with_body(format!(
                "<html><head><title>P{i}</title></head><body><p>page {i}</p></body></html>"
            ))
            .create_async()
            .await;
    }

    let cfg = fast_config(&format!("{}/", server.url()), tmp)
        .build()
        .unwrap();
    let staging = cfg.effective_staging_dir();

    let engine = Cartographer::new();
    engine.start(cfg).await.unwrap();
    let archive = engine.join().await.unwrap();
    (archive, staging)
}

#[tokio::test]
async fn manifest_counts_match_actual_part_contents() {
    let tmp = tempfile::tempdir().unwrap();
    let (_archive, staging) = crawl_small_site(tmp.path()).await;
    let manifest = read_manifest(&staging);

    for (dataset, stats) in &manifest.datasets {
        let lines: Vec<serde_json::Value> = read_dataset(&staging, dataset);
        assert_eq!(
            stats.record_count,
            lines.len() as u64,
            "record count of {dataset}"
        );

        let on_disk: u64 = manifest.parts[dataset]
            .iter()
            .map(|p| std::fs::metadata(staging.join(dataset).join(p)).unwrap().len())
            .sum();
        assert_eq!(stats.bytes, on_disk, "byte size of {dataset}");
        assert_eq!(stats.part_count as usize, manifest.parts[dataset].len());
    }
}

#[tokio::test]
async fn integrity_map_covers_every_non_manifest_file() {
    let tmp = tempfile::tempdir().unwrap();
    let (_archive, staging) = crawl_small_site(tmp.path()).await;
    let manifest = read_manifest(&staging);

    // Walk the staging tree and compare against the map both ways.
    fn walk(root: &std::path::Path, dir: &std::path::Path, out: &mut Vec<String>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/");
                if rel != "manifest.json" {
                    out.push(rel);
                }
            }
        }
    }
    let mut files = Vec::new();
    walk(&staging, &staging, &mut files);
    files.sort();

    let mut mapped: Vec<String> = manifest.integrity.files.keys().cloned().collect();
    mapped.sort();
    assert_eq!(files, mapped);

    for (rel, expected) in &manifest.integrity.files {
        let bytes = std::fs::read(staging.join(rel)).unwrap();
        assert_eq!(&hex::encode(Sha256::digest(&bytes)), expected, "hash of {rel}");
    }
}

#[tokio::test]
async fn sealed_archive_revalidates_and_contains_expected_entries() {
    let tmp = tempfile::tempdir().unwrap();
    let (archive, staging) = crawl_small_site(tmp.path()).await;

    validate_archive(&archive, 16).unwrap();

    // The sealed container and the staging tree agree byte-for-byte.
    let sealed_summary = read_zip_entry(&archive, "summary.json");
    let staged_summary = std::fs::read(staging.join("summary.json")).unwrap();
    assert_eq!(sealed_summary, staged_summary);

    let sealed_pages = read_zip_entry(&archive, "pages/part-001.jsonl.zst");
    let staged_pages = std::fs::read(staging.join("pages/part-001.jsonl.zst")).unwrap();
    assert_eq!(sealed_pages, staged_pages);

    let schema = read_zip_entry(&archive, "schemas/pages.schema.json");
    let schema: serde_json::Value = serde_json::from_slice(&schema).unwrap();
    assert_eq!(schema["title"], "PageRecord");
}

#[tokio::test]
async fn every_admitted_key_has_exactly_one_page() {
    let tmp = tempfile::tempdir().unwrap();
    let (_archive, staging) = crawl_small_site(tmp.path()).await;

    let pages: Vec<PageRecord> = read_dataset(&staging, "pages");
    assert_eq!(pages.len(), 6);
    let mut keys: Vec<&str> = pages.iter().map(|p| p.url_key.as_str()).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), pages.len(), "no key yields two page records");
}
