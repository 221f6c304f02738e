//! The renderer's capability boundary.
//!
//! Everything the pipeline needs from a headless browser is expressed by
//! these two traits: launch pages, navigate with caps, serialize the DOM,
//! evaluate scripts, screenshot. Test doubles implement them without any
//! browser; static-fetch mode bypasses them entirely.

use crate::records::NavEndReason;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Hard caps applied to a single page navigation.
#[derive(Debug, Clone)]
pub struct NavLimits {
    pub timeout: Duration,
    /// Requests the page may issue before the navigation is failed.
    pub max_requests: usize,
    /// Response-body budget for the whole page.
    pub max_bytes: usize,
}

/// How one navigation concluded.
#[derive(Debug, Clone)]
pub struct NavOutcome {
    pub reason: NavEndReason,
    /// Symbolic code when a cap or timeout failed the page.
    pub failure_code: Option<&'static str>,
}

impl NavOutcome {
    #[must_use]
    pub fn ok(reason: NavEndReason) -> Self {
        Self {
            reason,
            failure_code: None,
        }
    }

    #[must_use]
    pub fn failed(code: &'static str) -> Self {
        Self {
            reason: NavEndReason::Error,
            failure_code: Some(code),
        }
    }
}

/// A single page within the browser, single-use per navigation.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn navigate(&mut self, url: &str, limits: &NavLimits) -> Result<NavOutcome>;

    async fn title(&self) -> Result<String>;

    /// `document.documentElement.outerHTML` after rendering.
    async fn outer_html(&self) -> Result<String>;

    /// Evaluate a script and deserialize its JSON result.
    async fn evaluate_json(&self, script: &str) -> Result<serde_json::Value>;

    /// Console messages captured so far as (level, text) pairs, filtered to
    /// page-originated output.
    async fn console_messages(&self) -> Vec<(String, String)>;

    /// Above-the-fold JPEG at the given viewport.
    async fn screenshot_jpeg(
        &mut self,
        width: u32,
        height: u32,
        mobile: bool,
        quality: u8,
    ) -> Result<Vec<u8>>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// A long-lived browser with a rolling context.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>>;

    /// Tear down and replace the browsing context, dropping accumulated
    /// renderer state (caches, service workers, leaked listeners).
    async fn recycle_context(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
