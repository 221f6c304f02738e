//! Configuration types recognized by the engine.

use crate::records::RenderMode;
use crate::url_norm::ParamPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Render pipeline selection and per-page hard caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    pub mode: RenderMode,
    /// Bounded pool size: at most this many page tasks advance at once.
    pub concurrency: usize,
    /// Per-page navigation timeout.
    pub timeout_ms: u64,
    /// Requests a single page may issue before further ones are aborted.
    pub max_requests_per_page: usize,
    /// Response-body budget per page; exceeding it fails the page.
    pub max_bytes_per_page: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            mode: RenderMode::Raw,
            // Sized to the machine; browser contexts are memory-heavy.
            concurrency: num_cpus::get().clamp(2, 8),
            timeout_ms: 30_000,
            max_requests_per_page: 200,
            max_bytes_per_page: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Global requests-per-second ceiling across all hosts.
    pub rps: f64,
    /// Per-host requests per second.
    pub per_host_rps: f64,
    /// Token bucket burst per host.
    pub burst: f64,
    pub user_agent: String,
    /// Redirects followed per fetch before giving up.
    pub max_redirects: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            rps: 8.0,
            per_host_rps: 2.0,
            burst: 4.0,
            user_agent: format!("cartographer/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub follow_external: bool,
    pub param_policy: ParamPolicy,
    /// Wildcard-enabled parameter kill list, applied before the policy.
    pub block_list: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            follow_external: false,
            param_policy: ParamPolicy::Keep,
            block_list: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotsConfig {
    /// When false, `should_fetch` allows everything and the override is
    /// recorded prominently in the manifest notes.
    pub respect: bool,
}

impl Default for RobotsConfig {
    fn default() -> Self {
        Self { respect: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Pause high-water reference for the RSS monitor.
    pub max_rss_mb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { max_rss_mb: 2048 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessibilityConfig {
    pub enabled: bool,
}

impl Default for AccessibilityConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// Fire every N pages.
    pub interval: usize,
    /// Optionally also fire every T seconds.
    pub every_seconds: Option<u64>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 500,
            every_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Bound for draining in-flight work after the first termination signal.
    pub graceful_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeConfig {
    pub crawl_id: Option<String>,
    /// Staging directory of the interrupted crawl.
    pub staging_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotConfig {
    pub enabled: bool,
    pub desktop: bool,
    pub mobile: bool,
    pub quality: u8,
    pub format: String,
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            desktop: true,
            mobile: true,
            quality: 80,
            format: "jpeg".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaviconConfig {
    pub enabled: bool,
}

impl Default for FaviconConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaConfig {
    pub screenshots: ScreenshotConfig,
    pub favicons: FaviconConfig,
}

/// Complete crawl configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Depth-0 URLs.
    pub seeds: Vec<String>,
    /// Destination archive path.
    pub out_atls: PathBuf,
    /// Working directory for part files before sealing. Defaults to a
    /// sibling of `out_atls` named after it.
    pub staging_dir: Option<PathBuf>,
    /// Caps visited + enqueued; 0 means unlimited.
    pub max_pages: usize,
    /// BFS cutoff; -1 means unlimited.
    pub max_depth: i32,
    pub render: RenderConfig,
    pub http: HttpConfig,
    pub discovery: DiscoveryConfig,
    pub robots: RobotsConfig,
    pub memory: MemoryConfig,
    pub accessibility: AccessibilityConfig,
    pub checkpoint: CheckpointConfig,
    pub shutdown: ShutdownConfig,
    pub resume: Option<ResumeConfig>,
    pub media: MediaConfig,
    /// Recoverable errors tolerated before the crawl stops.
    pub error_budget: usize,
    /// Owner identity stamped into the manifest.
    pub owner_name: String,
    /// Declared downstream consumers, recorded in the manifest.
    pub consumers: Vec<String>,
}

impl CrawlConfig {
    /// The staging directory actually used, derived when not set.
    #[must_use]
    pub fn effective_staging_dir(&self) -> PathBuf {
        if let Some(resume) = &self.resume {
            return resume.staging_dir.clone();
        }
        if let Some(dir) = &self.staging_dir {
            return dir.clone();
        }
        let stem = self
            .out_atls
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "atlas".to_string());
        self.out_atls
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join(format!(".{stem}.staging"))
    }

    /// Whether depth `d` is still admissible.
    #[must_use]
    pub fn depth_allowed(&self, depth: u32) -> bool {
        self.max_depth < 0 || depth <= self.max_depth as u32
    }

    /// Whether admitting one more URL would exceed `max_pages`.
    #[must_use]
    pub fn page_cap_reached(&self, admitted: usize) -> bool {
        self.max_pages != 0 && admitted >= self.max_pages
    }
}
