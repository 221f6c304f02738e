//! The three-mode render pipeline.
//!
//! Static fetch never touches a browser: the stored DOM is the raw response
//! body and the DOM hash equals the raw-bytes hash by construction.
//! Prerender navigates a headless browser and serializes the rendered DOM.
//! Full audit adds performance metrics, console capture, computed text
//! styles and screenshots.

pub mod challenge;
mod chromium;
mod engine;
mod js;

pub use chromium::ChromiumEngine;
pub use engine::{BrowserEngine, BrowserPage, NavLimits, NavOutcome};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::CrawlConfig;
use crate::crawl_engine::memory::current_rss_bytes;
use crate::error::codes;
use crate::fetcher::FetchResult;
use crate::records::{NavEndReason, PerformanceMetrics, RenderMode};

/// Pages rendered in one context before it is recycled.
const CONTEXT_RECYCLE_PAGES: usize = 50;
/// RSS fraction of the configured max that also forces a recycle.
const CONTEXT_RECYCLE_RSS_FRACTION: f64 = 0.70;
/// Bound on waiting for a challenge interstitial to clear.
const CHALLENGE_WAIT: Duration = Duration::from_secs(15);
const CHALLENGE_POLL: Duration = Duration::from_millis(500);

const DESKTOP_VIEWPORT: (u32, u32) = (1366, 900);
const MOBILE_VIEWPORT: (u32, u32) = (390, 844);

/// Computed style of one text node as returned by the in-page script.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTextNodeStyle {
    pub selector: String,
    pub text: String,
    pub font_size: Option<f64>,
    pub font_weight: Option<u32>,
    pub color: Option<String>,
    pub background_color: Option<String>,
    pub line_height: Option<String>,
}

/// JPEG screenshots captured in full mode.
#[derive(Debug, Clone, Default)]
pub struct CapturedScreenshots {
    pub desktop: Option<Vec<u8>>,
    pub mobile: Option<Vec<u8>>,
}

/// Everything the renderer produced for one page.
#[derive(Debug, Clone)]
pub struct RenderResult {
    pub mode_used: RenderMode,
    pub nav_end_reason: NavEndReason,
    pub dom: String,
    /// SHA-256 of `dom`; equals the raw-bytes hash iff mode is raw.
    pub dom_hash: String,
    pub render_ms: u64,
    pub performance: Option<PerformanceMetrics>,
    /// (level, text) pairs from the page console, full mode only.
    pub console: Vec<(String, String)>,
    pub computed_styles: Vec<RawTextNodeStyle>,
    pub screenshots: Option<CapturedScreenshots>,
    pub challenge_detected: bool,
    /// A challenge was present at first capture but cleared within the
    /// wait budget; the stored DOM is the post-challenge document.
    pub challenge_cleared: bool,
}

/// Mode dispatcher owning the browser engine handle.
pub struct Renderer {
    mode: RenderMode,
    engine: Option<Arc<dyn BrowserEngine>>,
    limits: NavLimits,
    screenshots_enabled: bool,
    shoot_desktop: bool,
    shoot_mobile: bool,
    screenshot_quality: u8,
    pages_since_recycle: AtomicUsize,
    max_rss_bytes: u64,
}

impl Renderer {
    /// Initialize for the configured mode, launching a browser when needed.
    pub async fn init(cfg: &CrawlConfig) -> Result<Self> {
        let engine: Option<Arc<dyn BrowserEngine>> = match cfg.render.mode {
            RenderMode::Raw => None,
            RenderMode::Prerender | RenderMode::Full => Some(Arc::new(
                ChromiumEngine::launch_new(&cfg.http.user_agent).await?,
            )),
        };
        Ok(Self::assemble(cfg, engine))
    }

    /// Build with an injected engine; used by tests and embedders that
    /// manage their own browser.
    #[must_use]
    pub fn with_engine(cfg: &CrawlConfig, engine: Arc<dyn BrowserEngine>) -> Self {
        Self::assemble(cfg, Some(engine))
    }

    fn assemble(cfg: &CrawlConfig, engine: Option<Arc<dyn BrowserEngine>>) -> Self {
        Self {
            mode: cfg.render.mode,
            engine,
            limits: NavLimits {
                timeout: Duration::from_millis(cfg.render.timeout_ms),
                max_requests: cfg.render.max_requests_per_page,
                max_bytes: cfg.render.max_bytes_per_page,
            },
            screenshots_enabled: cfg.media.screenshots.enabled,
            shoot_desktop: cfg.media.screenshots.desktop,
            shoot_mobile: cfg.media.screenshots.mobile,
            screenshot_quality: cfg.media.screenshots.quality,
            pages_since_recycle: AtomicUsize::new(0),
            max_rss_bytes: cfg.memory.max_rss_mb * 1024 * 1024,
        }
    }

    /// Render one fetched page according to the configured mode.
    pub async fn render_page(&self, final_url: &str, raw: &FetchResult) -> Result<RenderResult> {
        match self.mode {
            RenderMode::Raw => Ok(self.render_static(raw)),
            RenderMode::Prerender | RenderMode::Full => {
                let result = self.render_in_browser(final_url, raw).await;
                self.maybe_recycle().await;
                result
            }
        }
    }

    /// Tear down and replace the browser context on demand.
    pub async fn force_context_recycle(&self) -> Result<()> {
        if let Some(engine) = &self.engine {
            engine.recycle_context().await?;
            self.pages_since_recycle.store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        if let Some(engine) = &self.engine {
            engine.close().await?;
        }
        Ok(())
    }

    fn render_static(&self, raw: &FetchResult) -> RenderResult {
        let started = Instant::now();
        let dom = String::from_utf8_lossy(&raw.body).into_owned();
        let render_ms = started.elapsed().as_millis() as u64;

        let title = quick_title(&dom);
        let challenge_detected =
            challenge::detect_challenge(raw.status_code, &title, &dom);

        RenderResult {
            mode_used: RenderMode::Raw,
            nav_end_reason: NavEndReason::Fetch,
            dom_hash: raw.raw_html_hash.clone(),
            dom,
            render_ms,
            performance: None,
            console: Vec::new(),
            computed_styles: Vec::new(),
            screenshots: None,
            challenge_detected,
            challenge_cleared: false,
        }
    }

    async fn render_in_browser(&self, url: &str, raw: &FetchResult) -> Result<RenderResult> {
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| anyhow!("browser engine not initialized"))?;
        let started = Instant::now();

        let mut page = engine.new_page().await.context("page creation failed")?;
        let result = self.drive_page(&mut *page, url, raw, started).await;
        if let Err(e) = page.close().await {
            debug!("page close after render failed: {e}");
        }
        result
    }

    async fn drive_page(
        &self,
        page: &mut dyn BrowserPage,
        url: &str,
        raw: &FetchResult,
        started: Instant,
    ) -> Result<RenderResult> {
        let outcome = page.navigate(url, &self.limits).await?;
        if let Some(code) = outcome.failure_code {
            bail!("{code}: navigation failed for {url}");
        }

        let mut dom = page.outer_html().await?;
        let mut title = page.title().await.unwrap_or_default();
        let mut nav_end_reason = outcome.reason;
        let mut challenge_detected = false;
        let mut challenge_cleared = false;

        if challenge::detect_challenge(raw.status_code, &title, &dom) {
            info!("challenge interstitial suspected at {url}, waiting for it to clear");
            let deadline = Instant::now() + CHALLENGE_WAIT;
            challenge_detected = true;
            while Instant::now() < deadline {
                tokio::time::sleep(CHALLENGE_POLL).await;
                dom = page.outer_html().await?;
                title = page.title().await.unwrap_or_default();
                if !challenge::detect_challenge(raw.status_code, &title, &dom) {
                    challenge_detected = false;
                    challenge_cleared = true;
                    break;
                }
            }
            if challenge_detected {
                nav_end_reason = NavEndReason::Error;
            }
        }

        let dom_hash = hex::encode(Sha256::digest(dom.as_bytes()));

        let (performance, console, computed_styles, screenshots) =
            if self.mode == RenderMode::Full && !challenge_detected {
                (
                    self.collect_performance(page).await,
                    page.console_messages().await,
                    self.collect_computed_styles(page).await,
                    self.collect_screenshots(page).await,
                )
            } else {
                (None, Vec::new(), Vec::new(), None)
            };

        Ok(RenderResult {
            mode_used: self.mode,
            nav_end_reason,
            dom,
            dom_hash,
            render_ms: started.elapsed().as_millis() as u64,
            performance,
            console,
            computed_styles,
            screenshots,
            challenge_detected,
            challenge_cleared,
        })
    }

    async fn collect_performance(&self, page: &dyn BrowserPage) -> Option<PerformanceMetrics> {
        match page.evaluate_json(js::PERFORMANCE_SCRIPT).await {
            Ok(value) => serde_json::from_value(value)
                .map_err(|e| debug!("unparseable performance payload: {e}"))
                .ok(),
            Err(e) => {
                debug!("performance collection failed: {e}");
                None
            }
        }
    }

    async fn collect_computed_styles(&self, page: &dyn BrowserPage) -> Vec<RawTextNodeStyle> {
        match page.evaluate_json(js::COMPUTED_STYLES_SCRIPT).await {
            Ok(value) => serde_json::from_value(value).unwrap_or_default(),
            Err(e) => {
                debug!("computed style collection failed: {e}");
                Vec::new()
            }
        }
    }

    async fn collect_screenshots(&self, page: &mut dyn BrowserPage) -> Option<CapturedScreenshots> {
        if !self.screenshots_enabled {
            return None;
        }
        let mut shots = CapturedScreenshots::default();
        if self.shoot_desktop {
            match page
                .screenshot_jpeg(
                    DESKTOP_VIEWPORT.0,
                    DESKTOP_VIEWPORT.1,
                    false,
                    self.screenshot_quality,
                )
                .await
            {
                Ok(bytes) => shots.desktop = Some(bytes),
                Err(e) => warn!("desktop screenshot failed: {e}"),
            }
        }
        if self.shoot_mobile {
            match page
                .screenshot_jpeg(
                    MOBILE_VIEWPORT.0,
                    MOBILE_VIEWPORT.1,
                    true,
                    self.screenshot_quality,
                )
                .await
            {
                Ok(bytes) => shots.mobile = Some(bytes),
                Err(e) => warn!("mobile screenshot failed: {e}"),
            }
        }
        (shots.desktop.is_some() || shots.mobile.is_some()).then_some(shots)
    }

    async fn maybe_recycle(&self) {
        let pages = self.pages_since_recycle.fetch_add(1, Ordering::Relaxed) + 1;
        let rss = current_rss_bytes();
        let rss_trip =
            self.max_rss_bytes > 0 && rss as f64 > self.max_rss_bytes as f64 * CONTEXT_RECYCLE_RSS_FRACTION;
        if pages >= CONTEXT_RECYCLE_PAGES || rss_trip {
            debug!(pages, rss, "context recycle triggered");
            if let Err(e) = self.force_context_recycle().await {
                warn!("context recycle failed: {e}");
            }
        }
    }
}

/// Title extraction cheap enough for the static path's challenge check.
fn quick_title(dom: &str) -> String {
    let doc = scraper::Html::parse_document(dom);
    let selector = scraper::Selector::parse("title").expect("static selector");
    doc.select(&selector)
        .next()
        .map(|t| t.text().collect::<String>())
        .unwrap_or_default()
}

/// Classify a render-phase failure into a symbolic error code.
#[must_use]
pub fn classify_render_error(err: &anyhow::Error) -> &'static str {
    let msg = format!("{err:#}");
    for code in [
        codes::NAV_TIMEOUT,
        codes::REQUEST_CAP_EXCEEDED,
        codes::BYTE_CAP_EXCEEDED,
    ] {
        if msg.contains(code) {
            return code;
        }
    }
    let lower = msg.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        codes::NAV_TIMEOUT
    } else if lower.contains("browser") || lower.contains("page creation") || lower.contains("cdp")
    {
        codes::BROWSER_CRASHED
    } else {
        codes::BROWSER_CRASHED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlConfig;

    fn raw_fetch(body: &str, status: u16) -> FetchResult {
        FetchResult {
            final_url: "https://a.test/".into(),
            status_code: status,
            content_type: Some("text/html".into()),
            headers: Default::default(),
            body: body.as_bytes().to_vec(),
            redirect_chain: Vec::new(),
            raw_html_hash: hex::encode(Sha256::digest(body.as_bytes())),
            robots_header: None,
            fetch_ms: 1,
        }
    }

    fn raw_config() -> CrawlConfig {
        CrawlConfig::builder()
            .seeds(["https://a.test/"])
            .out_atls("/tmp/r.atls")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn static_mode_reuses_raw_hash() {
        let renderer = Renderer::assemble(&raw_config(), None);
        let fetch = raw_fetch("<html><head><title>Hi</title></head><body>x</body></html>", 200);
        let out = renderer.render_page("https://a.test/", &fetch).await.unwrap();

        assert_eq!(out.mode_used, RenderMode::Raw);
        assert_eq!(out.nav_end_reason, NavEndReason::Fetch);
        assert_eq!(out.dom_hash, fetch.raw_html_hash);
        assert!(!out.challenge_detected);
        assert!(out.performance.is_none());
        assert!(out.render_ms < 100);
    }

    #[tokio::test]
    async fn static_mode_flags_challenge_title() {
        let renderer = Renderer::assemble(&raw_config(), None);
        let fetch = raw_fetch(
            "<html><head><title>Just a moment...</title></head><body></body></html>",
            503,
        );
        let out = renderer.render_page("https://a.test/", &fetch).await.unwrap();
        assert!(out.challenge_detected);
    }

    #[test]
    fn render_error_classification() {
        let err = anyhow::anyhow!("NAV_TIMEOUT: navigation failed for x");
        assert_eq!(classify_render_error(&err), codes::NAV_TIMEOUT);
        let err = anyhow::anyhow!("BYTE_CAP_EXCEEDED: navigation failed for x");
        assert_eq!(classify_render_error(&err), codes::BYTE_CAP_EXCEEDED);
        let err = anyhow::anyhow!("page creation failed");
        assert_eq!(classify_render_error(&err), codes::BROWSER_CRASHED);
    }
}
