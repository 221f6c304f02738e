//! chromiumoxide-backed implementation of the browser capability traits.
//!
//! One long-lived browser process with a rolling context: the whole browser
//! is torn down and relaunched on recycle, which drops every cache, service
//! worker and stray listener accumulated by rendered pages.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::emulation::{
    ClearDeviceMetricsOverrideParams, SetDeviceMetricsOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::EventResponseReceived;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::EventConsoleApiCalled;
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::engine::{BrowserEngine, BrowserPage, NavLimits, NavOutcome};
use crate::error::codes;
use crate::records::NavEndReason;

/// Locate a Chrome/Chromium executable, preferring `CHROMIUM_PATH`.
async fn find_browser_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("using browser from CHROMIUM_PATH: {}", path.display());
            return Ok(path);
        }
        warn!("CHROMIUM_PATH points to a missing file: {}", path.display());
    }

    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };
    for candidate in candidates {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Ok(path);
        }
    }

    for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
        if let Ok(output) = Command::new("which").arg(cmd).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Ok(PathBuf::from(path));
                }
            }
        }
    }

    Err(anyhow!("no Chrome/Chromium executable found"))
}

/// Download a managed Chromium into the user cache when none is installed.
async fn download_managed_browser() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cartographer")
        .join("chromium");
    std::fs::create_dir_all(&cache_dir).context("failed to create browser cache directory")?;

    info!("downloading managed Chromium to {}", cache_dir.display());
    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("failed to build browser fetcher options")?,
    );
    let revision = fetcher.fetch().await.context("browser download failed")?;
    Ok(revision.executable_path)
}

async fn launch(user_agent: &str) -> Result<(Browser, JoinHandle<()>, PathBuf)> {
    let executable = match find_browser_executable().await {
        Ok(path) => path,
        Err(_) => download_managed_browser().await?,
    };

    let user_data_dir =
        std::env::temp_dir().join(format!("cartographer_chrome_{}", std::process::id()));
    std::fs::create_dir_all(&user_data_dir).context("failed to create user data directory")?;

    let config = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(1366, 900)
        .user_data_dir(user_data_dir.clone())
        .chrome_executable(executable)
        .headless_mode(HeadlessMode::default())
        .arg(format!("--user-agent={user_agent}"))
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-notifications")
        .arg("--disable-background-networking")
        .arg("--disable-background-timer-throttling")
        .arg("--disable-breakpad")
        .arg("--disable-hang-monitor")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--no-sandbox")
        .arg("--metrics-recording-only")
        .arg("--hide-scrollbars")
        .arg("--mute-audio")
        .build()
        .map_err(|e| anyhow!("failed to build browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .context("failed to launch browser")?;

    let handler_task = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                let msg = e.to_string();
                // Chrome emits CDP events chromiumoxide does not model;
                // those deserialization misses are not actionable.
                if msg.contains("data did not match any variant") {
                    trace!("suppressed CDP deserialization noise: {msg}");
                } else {
                    warn!("browser handler error: {msg}");
                }
            }
        }
        debug!("browser handler task finished");
    });

    Ok((browser, handler_task, user_data_dir))
}

struct EngineState {
    browser: Browser,
    handler_task: JoinHandle<()>,
    user_data_dir: PathBuf,
}

/// The production [`BrowserEngine`].
pub struct ChromiumEngine {
    user_agent: String,
    state: tokio::sync::Mutex<Option<EngineState>>,
}

impl ChromiumEngine {
    pub async fn launch_new(user_agent: &str) -> Result<Self> {
        let (browser, handler_task, user_data_dir) = launch(user_agent).await?;
        Ok(Self {
            user_agent: user_agent.to_string(),
            state: tokio::sync::Mutex::new(Some(EngineState {
                browser,
                handler_task,
                user_data_dir,
            })),
        })
    }

    async fn teardown(state: EngineState) {
        let EngineState {
            mut browser,
            handler_task,
            user_data_dir,
        } = state;
        if let Err(e) = browser.close().await {
            warn!("browser close failed: {e}");
        }
        handler_task.abort();
        if let Err(e) = tokio::fs::remove_dir_all(&user_data_dir).await {
            debug!("could not remove user data dir {}: {e}", user_data_dir.display());
        }
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>> {
        let guard = self.state.lock().await;
        let state = guard
            .as_ref()
            .ok_or_else(|| anyhow!("browser engine is closed"))?;
        let page = state
            .browser
            .new_page("about:blank")
            .await
            .context("failed to create page")?;
        Ok(Box::new(ChromiumPage::new(page)))
    }

    async fn recycle_context(&self) -> Result<()> {
        info!("recycling browser context");
        let mut guard = self.state.lock().await;
        if let Some(old) = guard.take() {
            Self::teardown(old).await;
        }
        let (browser, handler_task, user_data_dir) = launch(&self.user_agent).await?;
        *guard = Some(EngineState {
            browser,
            handler_task,
            user_data_dir,
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.take() {
            Self::teardown(state).await;
        }
        Ok(())
    }
}

/// One live page plus the listener tasks tracking its network activity.
pub struct ChromiumPage {
    page: Page,
    request_count: Arc<AtomicUsize>,
    bytes_seen: Arc<AtomicU64>,
    console: Arc<Mutex<Vec<(String, String)>>>,
    listener_tasks: Vec<JoinHandle<()>>,
}

impl ChromiumPage {
    fn new(page: Page) -> Self {
        Self {
            page,
            request_count: Arc::new(AtomicUsize::new(0)),
            bytes_seen: Arc::new(AtomicU64::new(0)),
            console: Arc::new(Mutex::new(Vec::new())),
            listener_tasks: Vec::new(),
        }
    }

    /// Attach network and console listeners ahead of navigation so the very
    /// first request is counted.
    async fn attach_listeners(&mut self) -> Result<()> {
        let mut responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .context("failed to attach network listener")?;
        let request_count = Arc::clone(&self.request_count);
        let bytes_seen = Arc::clone(&self.bytes_seen);
        self.listener_tasks.push(tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                request_count.fetch_add(1, Ordering::Relaxed);
                let encoded = event.response.encoded_data_length.max(0.0) as u64;
                bytes_seen.fetch_add(encoded, Ordering::Relaxed);
            }
        }));

        let mut console_events = self
            .page
            .event_listener::<EventConsoleApiCalled>()
            .await
            .context("failed to attach console listener")?;
        let console = Arc::clone(&self.console);
        self.listener_tasks.push(tokio::spawn(async move {
            while let Some(event) = console_events.next().await {
                let level = format!("{:?}", event.r#type).to_lowercase();
                let text = event
                    .args
                    .iter()
                    .filter_map(|arg| arg.value.as_ref())
                    .map(|v| match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                if !text.is_empty() {
                    console.lock().push((level, text));
                }
            }
        }));

        Ok(())
    }
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn navigate(&mut self, url: &str, limits: &NavLimits) -> Result<NavOutcome> {
        self.attach_listeners().await?;

        let goto = tokio::time::timeout(limits.timeout, self.page.goto(url)).await;
        match goto {
            Err(_) => return Ok(NavOutcome::failed(codes::NAV_TIMEOUT)),
            Ok(Err(e)) => return Err(anyhow!("navigation failed: {e}")),
            Ok(Ok(_)) => {}
        }

        // Load-event wait; a timeout here still leaves a usable DOM.
        let reason = match tokio::time::timeout(limits.timeout, self.page.wait_for_navigation())
            .await
        {
            Err(_) => NavEndReason::Timeout,
            Ok(Err(e)) => {
                debug!("wait_for_navigation failed for {url}: {e}");
                NavEndReason::Load
            }
            Ok(Ok(_)) => NavEndReason::NetworkIdle,
        };

        // Let straggler subresources settle before reading the counters.
        tokio::time::sleep(Duration::from_millis(300)).await;

        if self.request_count.load(Ordering::Relaxed) > limits.max_requests {
            return Ok(NavOutcome::failed(codes::REQUEST_CAP_EXCEEDED));
        }
        if self.bytes_seen.load(Ordering::Relaxed) > limits.max_bytes as u64 {
            return Ok(NavOutcome::failed(codes::BYTE_CAP_EXCEEDED));
        }

        Ok(NavOutcome::ok(reason))
    }

    async fn title(&self) -> Result<String> {
        let value = self
            .page
            .evaluate("document.title")
            .await
            .context("failed to evaluate document.title")?
            .into_value::<serde_json::Value>()
            .map_err(|e| anyhow!("failed to read page title: {e}"))?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn outer_html(&self) -> Result<String> {
        self.page
            .content()
            .await
            .map_err(|e| anyhow!("failed to serialize DOM: {e}"))
    }

    async fn evaluate_json(&self, script: &str) -> Result<serde_json::Value> {
        self.page
            .evaluate(script)
            .await
            .context("script evaluation failed")?
            .into_value::<serde_json::Value>()
            .map_err(|e| anyhow!("script returned non-JSON value: {e}"))
    }

    async fn console_messages(&self) -> Vec<(String, String)> {
        self.console.lock().clone()
    }

    async fn screenshot_jpeg(
        &mut self,
        width: u32,
        height: u32,
        mobile: bool,
        quality: u8,
    ) -> Result<Vec<u8>> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(width))
            .height(i64::from(height))
            .device_scale_factor(1.0)
            .mobile(mobile)
            .build()
            .map_err(|e| anyhow!("invalid device metrics: {e}"))?;
        self.page
            .execute(metrics)
            .await
            .context("failed to set viewport")?;

        let shot = self
            .page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Jpeg)
                    .quality(i64::from(quality))
                    .full_page(false)
                    .build(),
            )
            .await
            .context("screenshot capture failed")?;

        self.page
            .execute(ClearDeviceMetricsOverrideParams::default())
            .await
            .context("failed to clear viewport override")?;

        Ok(shot)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        for task in &self.listener_tasks {
            task.abort();
        }
        self.page
            .close()
            .await
            .map_err(|e| anyhow!("page close failed: {e}"))
    }
}
