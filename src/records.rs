//! The archive data model.
//!
//! Every struct here is serialized as one JSON line into a dataset part file,
//! or (for [`Manifest`] and [`Summary`]) as a standalone JSON document.
//! Field names use camelCase on the wire; that is the contract downstream
//! readers depend on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a page's stored DOM was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Static fetch, no browser; the stored DOM is the raw response body.
    Raw,
    /// Headless-browser navigation, serialized DOM after render.
    Prerender,
    /// Prerender plus performance, console, computed styles and screenshots.
    Full,
}

impl RenderMode {
    /// Spec level declared in the manifest: 1 raw, 2 prerender, 3 full.
    #[must_use]
    pub fn spec_level(self) -> u8 {
        match self {
            Self::Raw => 1,
            Self::Prerender => 2,
            Self::Full => 3,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Prerender => "prerender",
            Self::Full => "full",
        }
    }
}

/// Why navigation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavEndReason {
    /// Static fetch mode: no navigation happened.
    Fetch,
    /// The load event fired.
    Load,
    /// Network settled after load.
    NetworkIdle,
    /// The per-page timeout elapsed with a usable DOM.
    Timeout,
    /// Navigation failed, a cap tripped, or a challenge went unresolved.
    Error,
}

/// Which robots surface asked for exclusion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoindexSurface {
    #[default]
    None,
    Meta,
    Header,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heading {
    pub level: u8,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Canonical {
    /// Verbatim `href` attribute.
    pub raw: String,
    /// Resolved against the page base, when resolution succeeds.
    pub resolved: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hreflang {
    pub lang: String,
    pub href: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityHeaders {
    pub content_security_policy: Option<String>,
    pub strict_transport_security: Option<String>,
    pub x_frame_options: Option<String>,
    pub referrer_policy: Option<String>,
    pub permissions_policy: Option<String>,
}

/// Browser performance metrics, full mode only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub ttfb_ms: Option<f64>,
    pub fcp_ms: Option<f64>,
    pub lcp_ms: Option<f64>,
    pub cls: Option<f64>,
    pub tbt_ms: Option<f64>,
}

/// Archive-relative screenshot paths stored on the owning page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotPaths {
    pub desktop: Option<String>,
    pub mobile: Option<String>,
}

/// One crawled page. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord {
    /// SHA-1 of the lowercased normalized URL; the dedup key.
    pub url_key: String,
    /// URL as admitted to the crawl (post param policy).
    pub url: String,
    /// Normalized form; path case preserved.
    pub normalized_url: String,
    /// URL after following redirects.
    pub final_url: String,
    pub status_code: u16,
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub render_mode: RenderMode,
    pub nav_end_reason: NavEndReason,
    /// SHA-256 of the raw response body.
    pub raw_html_hash: String,
    /// SHA-256 of the stored DOM; equals `raw_html_hash` iff mode is raw.
    pub dom_hash: String,
    pub redirect_chain: Vec<String>,

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
    /// First 1500 bytes of visible body text, whitespace collapsed.
    pub text_sample: Option<String>,

    pub internal_links_count: u32,
    pub external_links_count: u32,
    pub media_count: u32,
    pub missing_alt_count: u32,
    pub media_assets_count: u32,
    pub media_assets_truncated: bool,

    /// Leading path segment, e.g. `/docs/`.
    pub section: String,
    pub discovered_from: Option<String>,
    pub depth: u32,
    pub fetch_ms: u64,
    pub render_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_headers: Option<SecurityHeaders>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_paths: Option<ScreenshotPaths>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_data: Option<Vec<StructuredDataItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tech_stack: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_captured: Option<bool>,
}

/// Where a link sat in the document's landmark structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkLocation {
    Nav,
    Header,
    Footer,
    Aside,
    Main,
    Body,
    /// Static-fetch mode where ancestry was not walked, or no landmark found.
    Unknown,
}

/// One outgoing link. Unique on (source, target, selector hint).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeRecord {
    pub source_url: String,
    pub target_url: String,
    pub selector_hint: String,
    pub anchor_text: Option<String>,
    pub external: bool,
    pub nofollow: bool,
    pub sponsored: bool,
    pub ugc: bool,
    pub location: LinkLocation,
}

impl EdgeRecord {
    /// The dedup identity.
    #[must_use]
    pub fn dedup_key(&self) -> (&str, &str, &str) {
        (&self.source_url, &self.target_url, &self.selector_hint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Image,
    Video,
}

/// One media asset on a page. Capped at 1000 per page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub page_url: String,
    pub asset_url: String,
    pub kind: AssetKind,
    pub has_alt: bool,
    pub natural_width: Option<u32>,
    pub natural_height: Option<u32>,
    pub display_width: Option<u32>,
    pub display_height: Option<u32>,
    pub loading: Option<String>,
    pub visible: bool,
    pub in_viewport: bool,
}

/// Which pipeline phase a recoverable failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPhase {
    Fetch,
    Render,
    Extract,
    Write,
}

/// A recoverable failure; may exist for URLs that never produced a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub url: String,
    pub origin: String,
    pub host: String,
    pub occurred_at: DateTime<Utc>,
    pub phase: ErrorPhase,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Landmarks {
    pub header: bool,
    pub nav: bool,
    pub main: bool,
    pub footer: bool,
    pub aside: bool,
}

/// Prerender+ form-control label audit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormLabelSummary {
    pub controls: u32,
    pub labelled: u32,
    pub unlabelled_selectors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusOrderEntry {
    pub selector: String,
    pub tabindex: i32,
}

/// Full-mode contrast failure against WCAG AA.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContrastViolation {
    pub selector: String,
    pub foreground: String,
    pub background: String,
    pub ratio: f64,
    pub required_ratio: f64,
}

/// Accessibility signals for one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessibilityRecord {
    pub page_url: String,
    pub language: Option<String>,
    pub missing_alt_count: u32,
    /// First 50 sources of images lacking alt text.
    pub missing_alt_sources: Vec<String>,
    pub heading_sequence: Vec<u8>,
    pub landmarks: Landmarks,
    pub role_histogram: BTreeMap<String, u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_labels: Option<FormLabelSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus_order: Option<Vec<FocusOrderEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contrast_violations: Option<Vec<ContrastViolation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wcag_data: Option<serde_json::Value>,
}

/// One console message captured during full-mode rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleRecord {
    pub page_url: String,
    pub level: String,
    pub text: String,
    pub occurred_at: DateTime<Utc>,
}

/// Computed style of one text node, full mode only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedTextNodeRecord {
    pub page_url: String,
    pub selector: String,
    pub text: String,
    pub font_size: Option<f64>,
    pub font_weight: Option<u32>,
    pub color: Option<String>,
    pub background_color: Option<String>,
    pub line_height: Option<String>,
}

/// Structured data found on a page; a tagged sum over the supported formats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "camelCase")]
pub enum StructuredDataItem {
    #[serde(rename_all = "camelCase")]
    JsonLd { data: serde_json::Value },
    #[serde(rename_all = "camelCase")]
    Microdata { item_type: String },
    #[serde(rename_all = "camelCase")]
    OpenGraph { properties: BTreeMap<String, String> },
    #[serde(rename_all = "camelCase")]
    TwitterCard { properties: BTreeMap<String, String> },
}

/// Why the crawl stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Finished,
    Capped,
    ErrorBudget,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestOwner {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestHashing {
    /// Always "sha256".
    pub algorithm: String,
    /// Always "sha1".
    pub url_key_algo: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetStats {
    pub part_count: u32,
    /// JSON-line count across decompressed parts.
    pub record_count: u64,
    /// Sum of compressed on-disk part sizes.
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotsCapability {
    pub respects_robots_txt: bool,
    pub override_used: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestCapabilities {
    /// Modes the configuration allowed.
    pub render_modes: Vec<RenderMode>,
    /// Modes actually used by at least one page.
    pub modes_used: Vec<RenderMode>,
    /// Max spec level over `modes_used`.
    pub spec_level: u8,
    pub data_sets: Vec<String>,
    pub robots: RobotsCapability,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestIntegrity {
    /// Archive entry path → SHA-256 hex, for every non-manifest entry.
    pub files: BTreeMap<String, String>,
}

/// The archive's self-description; written last.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub atlas_version: String,
    pub crawl_id: String,
    pub owner: ManifestOwner,
    pub consumers: Vec<String>,
    pub hashing: ManifestHashing,
    /// Ordered part filenames per dataset.
    pub parts: BTreeMap<String, Vec<String>>,
    /// Schema reference per dataset.
    pub schemas: BTreeMap<String, String>,
    pub datasets: BTreeMap<String, DatasetStats>,
    pub capabilities: ManifestCapabilities,
    pub notes: Vec<String>,
    pub integrity: ManifestIntegrity,
    pub incomplete: bool,
    pub completion_reason: CompletionReason,
    pub created_at: DateTime<Utc>,
    pub generator: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryTotals {
    pub pages: u64,
    pub edges: u64,
    pub assets: u64,
    pub errors: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryConfig {
    pub render_mode: RenderMode,
    pub concurrency: usize,
    pub max_pages: usize,
    pub max_depth: i32,
    pub param_policy: String,
    pub follow_external: bool,
}

/// Crawl-level roll-up; written before the manifest so the manifest can
/// embed accurate counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub crawl_id: String,
    pub seeds: Vec<String>,
    pub primary_origin: String,
    pub domain: String,
    pub spec_level: u8,
    pub completion_reason: CompletionReason,
    pub config: SummaryConfig,
    pub totals: SummaryTotals,
    pub status_histogram: BTreeMap<String, u64>,
    pub mode_histogram: BTreeMap<String, u64>,
    pub avg_render_ms: f64,
    pub max_depth_reached: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Durable position of one dataset's current part, for resumed appends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartPointer {
    pub part_index: u32,
    /// Compressed bytes durably written to the current part.
    pub byte_offset: u64,
    /// Records written to this dataset across all parts.
    pub record_count: u64,
}

/// Persisted scheduler counters and writer pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointState {
    pub crawl_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_of: Option<String>,
    pub visited_count: u64,
    pub enqueued_count: u64,
    pub queue_depth: u64,
    pub visited_index_path: String,
    pub frontier_path: String,
    pub part_pointers: BTreeMap<String, PartPointer>,
    pub rss_bytes: u64,
    pub graceful_shutdown: bool,
    pub captured_at: DateTime<Utc>,
}

/// One pending URL in the persisted frontier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontierEntry {
    pub url: String,
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovered_from: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_level_is_mode_maximum() {
        assert_eq!(RenderMode::Raw.spec_level(), 1);
        assert_eq!(RenderMode::Prerender.spec_level(), 2);
        assert_eq!(RenderMode::Full.spec_level(), 3);
    }

    #[test]
    fn completion_reason_wire_format() {
        let s = serde_json::to_string(&CompletionReason::ErrorBudget).unwrap();
        assert_eq!(s, "\"error_budget\"");
    }

    #[test]
    fn structured_data_is_tagged() {
        let item = StructuredDataItem::Microdata {
            item_type: "https://schema.org/Product".into(),
        };
        let v: serde_json::Value = serde_json::to_value(&item).unwrap();
        assert_eq!(v["format"], "microdata");
        assert_eq!(v["itemType"], "https://schema.org/Product");
    }

    #[test]
    fn edge_dedup_key_is_the_triple() {
        let e = EdgeRecord {
            source_url: "https://a.test/".into(),
            target_url: "https://a.test/b".into(),
            selector_hint: "nav > a".into(),
            anchor_text: None,
            external: false,
            nofollow: false,
            sponsored: false,
            ugc: false,
            location: LinkLocation::Nav,
        };
        assert_eq!(e.dedup_key(), ("https://a.test/", "https://a.test/b", "nav > a"));
    }
}
