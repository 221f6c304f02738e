//! The streaming archive writer.
//!
//! Owns the staging directory, one rotating part lane per dataset, and the
//! final sealing of the `.atls` container. Lanes are independently locked,
//! so concurrent writers to different datasets never contend; per-dataset
//! writes serialize onto that dataset's single part stream.
//!
//! `finalize` runs in strict order: close part streams, write
//! `summary.json`, build the manifest by walking and hashing the staging
//! tree, write the manifest, seal the zip, then optionally validate the
//! sealed container. The summary must exist before the manifest is built
//! so the manifest's integrity map can cover it.

mod part_stream;
mod schemas;
mod seal;

pub use part_stream::{part_file_name, PartLane, ROTATE_AT_BYTES};
pub use seal::validate_archive;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::CrawlConfig;
use crate::records::{
    AccessibilityRecord, AssetRecord, CompletionReason, ComputedTextNodeRecord, ConsoleRecord,
    DatasetStats, EdgeRecord, ErrorRecord, Manifest, ManifestCapabilities, ManifestHashing,
    ManifestIntegrity, ManifestOwner, PageRecord, PartPointer, RenderMode, RobotsCapability,
    Summary, SummaryConfig, SummaryTotals,
};

/// Datasets the archive may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dataset {
    Pages,
    Edges,
    Assets,
    Errors,
    Accessibility,
    Console,
    Styles,
}

impl Dataset {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pages => "pages",
            Self::Edges => "edges",
            Self::Assets => "assets",
            Self::Errors => "errors",
            Self::Accessibility => "accessibility",
            Self::Console => "console",
            Self::Styles => "styles",
        }
    }

    /// Datasets enabled under a given configuration.
    #[must_use]
    pub fn enabled_for(cfg: &CrawlConfig) -> Vec<Self> {
        let mut datasets = vec![Self::Pages, Self::Edges, Self::Assets, Self::Errors];
        if cfg.accessibility.enabled {
            datasets.push(Self::Accessibility);
        }
        if cfg.render.mode == RenderMode::Full {
            datasets.push(Self::Console);
            datasets.push(Self::Styles);
        }
        datasets
    }
}

/// Screenshot viewport class, which doubles as the media subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Viewport {
    Desktop,
    Mobile,
}

impl Viewport {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
        }
    }
}

/// Crawl-level facts the scheduler hands over at finalize time.
#[derive(Debug, Clone)]
pub struct SummaryInput {
    pub seeds: Vec<String>,
    pub primary_origin: String,
    pub domain: String,
    pub config: SummaryConfig,
    pub status_histogram: BTreeMap<String, u64>,
    pub mode_histogram: BTreeMap<String, u64>,
    pub modes_used: Vec<RenderMode>,
    pub avg_render_ms: f64,
    pub max_depth_reached: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completion_reason: CompletionReason,
    pub incomplete: bool,
}

pub struct ArchiveWriter {
    staging: PathBuf,
    out_atls: PathBuf,
    crawl_id: String,
    lanes: BTreeMap<Dataset, tokio::sync::Mutex<PartLane>>,
    favicons_written: DashMap<String, ()>,
    notes: Mutex<Vec<String>>,
    completion_override: Mutex<Option<CompletionReason>>,
    owner_name: String,
    consumers: Vec<String>,
    render_mode_configured: RenderMode,
    robots: RobotsCapability,
    validate_on_seal: bool,
    strict_validation: bool,
}

impl ArchiveWriter {
    /// Start a fresh archive in the configured staging directory.
    pub fn init(cfg: &CrawlConfig, crawl_id: &str) -> Result<Self> {
        Self::build(cfg, crawl_id, None)
    }

    /// Reopen a staging directory, appending at the recorded pointers.
    pub fn resume(
        cfg: &CrawlConfig,
        crawl_id: &str,
        pointers: &BTreeMap<String, PartPointer>,
    ) -> Result<Self> {
        Self::build(cfg, crawl_id, Some(pointers))
    }

    fn build(
        cfg: &CrawlConfig,
        crawl_id: &str,
        pointers: Option<&BTreeMap<String, PartPointer>>,
    ) -> Result<Self> {
        let staging = cfg.effective_staging_dir();
        std::fs::create_dir_all(&staging)
            .with_context(|| format!("failed to create staging dir {}", staging.display()))?;

        let mut lanes = BTreeMap::new();
        for dataset in Dataset::enabled_for(cfg) {
            let dir = staging.join(dataset.as_str());
            let lane = match pointers.and_then(|p| p.get(dataset.as_str())) {
                Some(pointer) => PartLane::resume(&dir, *pointer)?,
                None => PartLane::create(&dir)?,
            };
            lanes.insert(dataset, tokio::sync::Mutex::new(lane));
        }

        // A resumed writer re-learns which origins already have favicons.
        let favicons_written = DashMap::new();
        if let Ok(entries) = std::fs::read_dir(staging.join("media").join("favicons")) {
            for entry in entries.flatten() {
                if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                    favicons_written.insert(stem.to_string(), ());
                }
            }
        }

        let mut notes = Vec::new();
        if !cfg.robots.respect {
            notes.push(
                "WARNING: robots.txt override was active; exclusion rules were not honored."
                    .to_string(),
            );
        }

        Ok(Self {
            staging,
            out_atls: cfg.out_atls.clone(),
            crawl_id: crawl_id.to_string(),
            lanes,
            favicons_written,
            notes: Mutex::new(notes),
            completion_override: Mutex::new(None),
            owner_name: cfg.owner_name.clone(),
            consumers: cfg.consumers.clone(),
            render_mode_configured: cfg.render.mode,
            robots: RobotsCapability {
                respects_robots_txt: cfg.robots.respect,
                override_used: !cfg.robots.respect,
            },
            validate_on_seal: true,
            strict_validation: false,
        })
    }

    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Record a provenance note for the manifest (resume lineage, overrides).
    pub fn add_note(&self, note: impl Into<String>) {
        self.notes.lock().push(note.into());
    }

    /// Pin the completion reason ahead of finalize; overrides whatever the
    /// summary input carries.
    pub fn set_completion_reason(&self, reason: CompletionReason) {
        *self.completion_override.lock() = Some(reason);
    }

    /// Raise post-seal validation from a warning to a fatal error.
    #[must_use]
    pub fn with_strict_validation(mut self, strict: bool) -> Self {
        self.strict_validation = strict;
        self
    }

    /// Skip the post-seal validation pass entirely.
    #[must_use]
    pub fn without_validation(mut self) -> Self {
        self.validate_on_seal = false;
        self
    }

    pub async fn write_page(&self, record: &PageRecord) -> Result<()> {
        self.write_record(Dataset::Pages, record).await
    }

    pub async fn write_edges(&self, records: &[EdgeRecord]) -> Result<()> {
        for record in records {
            self.write_record(Dataset::Edges, record).await?;
        }
        Ok(())
    }

    pub async fn write_assets(&self, records: &[AssetRecord]) -> Result<()> {
        for record in records {
            self.write_record(Dataset::Assets, record).await?;
        }
        Ok(())
    }

    pub async fn write_error(&self, record: &ErrorRecord) -> Result<()> {
        self.write_record(Dataset::Errors, record).await
    }

    pub async fn write_accessibility(&self, record: &AccessibilityRecord) -> Result<()> {
        self.write_record(Dataset::Accessibility, record).await
    }

    pub async fn write_console(&self, records: &[ConsoleRecord]) -> Result<()> {
        for record in records {
            self.write_record(Dataset::Console, record).await?;
        }
        Ok(())
    }

    pub async fn write_styles(&self, records: &[ComputedTextNodeRecord]) -> Result<()> {
        for record in records {
            self.write_record(Dataset::Styles, record).await?;
        }
        Ok(())
    }

    async fn write_record<T: Serialize>(&self, dataset: Dataset, record: &T) -> Result<()> {
        let lane = self
            .lanes
            .get(&dataset)
            .ok_or_else(|| anyhow!("dataset {} is not enabled", dataset.as_str()))?;
        let line = serde_json::to_vec(record).context("record serialization failed")?;
        lane.lock().await.write_line(&line)
    }

    /// Store an above-the-fold screenshot; returns the archive-relative path.
    pub async fn write_screenshot(
        &self,
        url_key: &str,
        viewport: Viewport,
        bytes: &[u8],
    ) -> Result<String> {
        let rel = format!("media/screenshots/{}/{url_key}.jpg", viewport.as_str());
        self.write_media_file(&rel, bytes).await?;
        Ok(rel)
    }

    /// Whether a favicon for this origin key is already stored.
    #[must_use]
    pub fn has_favicon(&self, origin_key: &str) -> bool {
        self.favicons_written.contains_key(origin_key)
    }

    /// Store a favicon once per origin; `None` when already present.
    pub async fn write_favicon(
        &self,
        origin_key: &str,
        ext: &str,
        bytes: &[u8],
    ) -> Result<Option<String>> {
        if self.favicons_written.contains_key(origin_key) {
            return Ok(None);
        }
        let ext = match ext {
            "ico" | "png" | "svg" | "gif" | "jpg" => ext,
            _ => "ico",
        };
        let rel = format!("media/favicons/{origin_key}.{ext}");
        self.write_media_file(&rel, bytes).await?;
        self.favicons_written.insert(origin_key.to_string(), ());
        Ok(Some(rel))
    }

    async fn write_media_file(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        let path = self.staging.join(rel);
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("media path has no parent"))?;
        tokio::fs::create_dir_all(parent)
            .await
            .context("failed to create media dir")?;
        // Write-temp-then-rename keeps the staging tree free of torn files.
        let bytes = bytes.to_vec();
        let path_clone = path.clone();
        let parent = parent.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
            tmp.write_all(&bytes)?;
            tmp.persist(&path_clone)?;
            Ok(())
        })
        .await
        .context("media write task panicked")??;
        Ok(())
    }

    /// Finish open frames and fsync every lane.
    pub async fn flush_and_sync(&self) -> Result<()> {
        for lane in self.lanes.values() {
            lane.lock().await.flush_sync()?;
        }
        Ok(())
    }

    /// Durable (dataset → pointer) map; call after `flush_and_sync`.
    pub async fn part_pointers(&self) -> BTreeMap<String, PartPointer> {
        let mut pointers = BTreeMap::new();
        for (dataset, lane) in &self.lanes {
            pointers.insert(dataset.as_str().to_string(), lane.lock().await.pointer());
        }
        pointers
    }

    /// Seal the archive. Consumes the writer; nothing may be written after.
    pub async fn finalize(self, input: SummaryInput) -> Result<PathBuf> {
        // (1) Close and flush all part streams.
        self.flush_and_sync().await?;

        let mut parts: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut record_counts: BTreeMap<String, u64> = BTreeMap::new();
        for (dataset, lane) in &self.lanes {
            let lane = lane.lock().await;
            parts.insert(dataset.as_str().to_string(), lane.part_names());
            record_counts.insert(dataset.as_str().to_string(), lane.record_count());
        }

        let staging = self.staging.clone();
        let out_atls = self.out_atls.clone();
        let notes = self.notes.lock().clone();
        let completion_reason =
            (*self.completion_override.lock()).unwrap_or(input.completion_reason);
        let strict = self.strict_validation;
        let validate = self.validate_on_seal;
        let crawl_id = self.crawl_id.clone();
        let owner_name = self.owner_name.clone();
        let consumers = self.consumers.clone();
        let render_mode_configured = self.render_mode_configured;
        let robots = self.robots.clone();
        drop(self);

        let archive_path = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            write_schemas(&staging, &parts)?;

            // (2) Summary before manifest, so the manifest can embed
            // accurate counts and hash the summary file itself.
            let totals = SummaryTotals {
                pages: record_counts.get("pages").copied().unwrap_or(0),
                edges: record_counts.get("edges").copied().unwrap_or(0),
                assets: record_counts.get("assets").copied().unwrap_or(0),
                errors: record_counts.get("errors").copied().unwrap_or(0),
                bytes_written: dir_size(&staging)?,
            };
            let completed_at = Utc::now();
            let spec_level = input
                .modes_used
                .iter()
                .map(|m| m.spec_level())
                .max()
                .unwrap_or(render_mode_configured.spec_level());
            let summary = Summary {
                crawl_id: crawl_id.clone(),
                seeds: input.seeds.clone(),
                primary_origin: input.primary_origin.clone(),
                domain: input.domain.clone(),
                spec_level,
                completion_reason,
                config: input.config.clone(),
                totals,
                status_histogram: input.status_histogram.clone(),
                mode_histogram: input.mode_histogram.clone(),
                avg_render_ms: input.avg_render_ms,
                max_depth_reached: input.max_depth_reached,
                started_at: input.started_at,
                completed_at,
                duration_ms: (completed_at - input.started_at).num_milliseconds().max(0)
                    as u64,
            };
            write_json(&staging.join("summary.json"), &summary)?;

            // (3) Walk the staging tree: sizes and integrity hashes for
            // every non-manifest file, then dataset byte totals.
            let files = walk_files(&staging)?;
            let mut integrity = BTreeMap::new();
            let mut dataset_bytes: BTreeMap<String, u64> = BTreeMap::new();
            for rel in &files {
                let path = staging.join(rel);
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                integrity.insert(rel.clone(), hex::encode(Sha256::digest(&bytes)));
                if let Some((dataset, _)) = rel.split_once('/') {
                    if record_counts.contains_key(dataset) {
                        *dataset_bytes.entry(dataset.to_string()).or_default() +=
                            bytes.len() as u64;
                    }
                }
            }

            let mut datasets = BTreeMap::new();
            let mut schema_refs = BTreeMap::new();
            for (name, part_list) in &parts {
                datasets.insert(
                    name.clone(),
                    DatasetStats {
                        part_count: part_list.len() as u32,
                        record_count: record_counts.get(name).copied().unwrap_or(0),
                        bytes: dataset_bytes.get(name).copied().unwrap_or(0),
                    },
                );
                schema_refs.insert(name.clone(), format!("schemas/{name}.schema.json"));
            }

            let mut modes_used = input.modes_used.clone();
            modes_used.sort();
            modes_used.dedup();

            // (4) Manifest last among the staging files.
            let manifest = Manifest {
                atlas_version: "1.0".to_string(),
                crawl_id,
                owner: ManifestOwner { name: owner_name },
                consumers,
                hashing: ManifestHashing {
                    algorithm: "sha256".to_string(),
                    url_key_algo: "sha1".to_string(),
                },
                parts,
                schemas: schema_refs,
                datasets,
                capabilities: ManifestCapabilities {
                    render_modes: vec![render_mode_configured],
                    modes_used,
                    spec_level,
                    data_sets: record_counts.keys().cloned().collect(),
                    robots,
                },
                notes,
                integrity: ManifestIntegrity { files: integrity },
                incomplete: input.incomplete,
                completion_reason,
                created_at: Utc::now(),
                generator: format!("cartographer/{}", env!("CARGO_PKG_VERSION")),
            };
            write_json(&staging.join("manifest.json"), &manifest)?;

            // (5) Pack the staging tree into the sealed container.
            seal::seal_archive(&staging, &out_atls)?;

            // (6) Optional validation of the sealed container.
            if validate {
                if let Err(e) = seal::validate_archive(&out_atls, 16) {
                    if strict {
                        return Err(e.context("post-seal validation failed"));
                    }
                    tracing::warn!("post-seal validation warning: {e:#}");
                }
            }

            Ok(out_atls)
        })
        .await
        .context("finalize task panicked")??;

        info!("archive sealed at {}", archive_path.display());
        Ok(archive_path)
    }
}

fn write_schemas(staging: &Path, parts: &BTreeMap<String, Vec<String>>) -> Result<()> {
    let dir = staging.join("schemas");
    std::fs::create_dir_all(&dir).context("failed to create schemas dir")?;
    for dataset in parts.keys() {
        if let Some(schema) = schemas::schema_for(dataset) {
            write_json(&dir.join(format!("{dataset}.schema.json")), &schema)?;
        }
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().ok_or_else(|| anyhow!("path has no parent"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut tmp, value).context("JSON serialization failed")?;
    tmp.write_all(b"\n")?;
    tmp.persist(path)
        .with_context(|| format!("failed to persist {}", path.display()))?;
    Ok(())
}

/// Relative paths (forward slashes) of every file under `root`, sorted.
fn walk_files(root: &Path) -> Result<Vec<String>> {
    fn visit(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                visit(root, &path, out)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                let rel = rel.to_string_lossy().replace('\\', "/");
                if rel != "manifest.json" {
                    out.push(rel);
                }
            }
        }
        Ok(())
    }
    let mut files = Vec::new();
    visit(root, root, &mut files)?;
    files.sort();
    Ok(files)
}

fn dir_size(root: &Path) -> Result<u64> {
    let mut total = 0;
    for rel in walk_files(root)? {
        total += std::fs::metadata(root.join(rel))?.len();
    }
    Ok(total)
}
