//! Shared fixtures: archive readers and a scripted browser engine.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use cartographer::records::NavEndReason;
use cartographer::renderer::{BrowserEngine, BrowserPage, NavLimits, NavOutcome};
use cartographer::{CrawlConfig, Manifest, Summary};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

/// Build a fast-running config against a local fixture server.
pub fn fast_config(
    seed: &str,
    dir: &Path,
) -> cartographer::config::CrawlConfigBuilder<cartographer::config::WithOutPath> {
    CrawlConfig::builder()
        .seeds([seed])
        .out_atls(dir.join("site.atls"))
        .staging_dir(dir.join("staging"))
        .per_host_rps(500.0)
        .global_rps(1000.0)
        .burst(100.0)
        .favicons(false)
}

/// Decompress and parse every record of one dataset in a staging tree.
pub fn read_dataset<T: serde::de::DeserializeOwned>(staging: &Path, dataset: &str) -> Vec<T> {
    let dir = staging.join(dataset);
    let mut names: Vec<_> = match std::fs::read_dir(&dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect(),
        Err(_) => return Vec::new(),
    };
    names.sort();

    let mut records = Vec::new();
    for name in names {
        let file = std::fs::File::open(dir.join(name)).unwrap();
        let decoder = zstd::stream::read::Decoder::new(file).unwrap();
        for line in BufReader::new(decoder).lines() {
            let line = line.unwrap();
            if !line.is_empty() {
                records.push(serde_json::from_str(&line).unwrap());
            }
        }
    }
    records
}

pub fn read_manifest(staging: &Path) -> Manifest {
    serde_json::from_str(&std::fs::read_to_string(staging.join("manifest.json")).unwrap()).unwrap()
}

pub fn read_summary(staging: &Path) -> Summary {
    serde_json::from_str(&std::fs::read_to_string(staging.join("summary.json")).unwrap()).unwrap()
}

/// Read one entry out of a sealed archive.
pub fn read_zip_entry(archive: &Path, name: &str) -> Vec<u8> {
    let file = std::fs::File::open(archive).unwrap();
    let mut zip = zip::ZipArchive::new(file).unwrap();
    let mut entry = zip.by_name(name).unwrap();
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes).unwrap();
    bytes
}

/// One rendered state of a fixture page.
#[derive(Clone)]
pub struct ScriptedPage {
    pub dom: String,
    pub title: String,
}

impl ScriptedPage {
    pub fn new(title: &str, dom: &str) -> Self {
        Self {
            dom: dom.to_string(),
            title: title.to_string(),
        }
    }

    fn blank() -> Self {
        Self::new("", "<html><head><title></title></head><body></body></html>")
    }
}

/// A browser test double serving canned DOMs keyed by URL.
///
/// `serve_sequence` registers successive states: each `outer_html` read
/// advances to the next state (sticking at the last one), which lets
/// challenge fixtures either stay stuck or clear mid-wait.
pub struct ScriptedEngine {
    pages: HashMap<String, Vec<ScriptedPage>>,
    pub recycles: Mutex<usize>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            recycles: Mutex::new(0),
        }
    }

    /// Serve a single stable state for `url`.
    pub fn serve(self, url: &str, title: &str, dom: &str) -> Self {
        self.serve_sequence(url, vec![ScriptedPage::new(title, dom)])
    }

    pub fn serve_sequence(mut self, url: &str, states: Vec<ScriptedPage>) -> Self {
        assert!(!states.is_empty());
        self.pages.insert(url.to_string(), states);
        self
    }
}

#[async_trait]
impl BrowserEngine for ScriptedEngine {
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>> {
        Ok(Box::new(ScriptedBrowserPage {
            pages: self.pages.clone(),
            states: vec![ScriptedPage::blank()],
            reads: Mutex::new(0),
        }))
    }

    async fn recycle_context(&self) -> Result<()> {
        *self.recycles.lock() += 1;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct ScriptedBrowserPage {
    pages: HashMap<String, Vec<ScriptedPage>>,
    states: Vec<ScriptedPage>,
    reads: Mutex<usize>,
}

impl ScriptedBrowserPage {
    fn current(&self) -> ScriptedPage {
        let reads = *self.reads.lock();
        let index = reads.min(self.states.len() - 1);
        self.states[index].clone()
    }
}

#[async_trait]
impl BrowserPage for ScriptedBrowserPage {
    async fn navigate(&mut self, url: &str, _limits: &NavLimits) -> Result<NavOutcome> {
        self.states = self
            .pages
            .get(url)
            .cloned()
            .unwrap_or_else(|| vec![ScriptedPage::blank()]);
        *self.reads.lock() = 0;
        Ok(NavOutcome::ok(NavEndReason::NetworkIdle))
    }

    async fn title(&self) -> Result<String> {
        // Report the state most recently served by `outer_html`.
        let reads = *self.reads.lock();
        let index = reads.saturating_sub(1).min(self.states.len() - 1);
        Ok(self.states[index].title.clone())
    }

    async fn outer_html(&self) -> Result<String> {
        let dom = self.current().dom;
        *self.reads.lock() += 1;
        Ok(dom)
    }

    async fn evaluate_json(&self, _script: &str) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn console_messages(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    async fn screenshot_jpeg(
        &mut self,
        _width: u32,
        _height: u32,
        _mobile: bool,
        _quality: u8,
    ) -> Result<Vec<u8>> {
        Ok(vec![0xFF, 0xD8, 0xFF, 0xE0])
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

pub fn scripted(engine: ScriptedEngine) -> Arc<dyn BrowserEngine> {
    Arc::new(engine)
}
