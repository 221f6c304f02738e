//! Typestate builder for [`CrawlConfig`].
//!
//! Seeds and the archive out-path are required; the builder only exposes
//! `build()` once both have been provided, so a config missing either does
//! not compile.

use super::types::*;
use crate::records::RenderMode;
use crate::url_norm::{ParamBlockList, ParamPolicy};
use anyhow::{anyhow, Result};
use std::marker::PhantomData;
use std::path::PathBuf;

pub struct WithSeeds;
pub struct WithOutPath;

pub struct CrawlConfigBuilder<State = ()> {
    cfg: CrawlConfig,
    _state: PhantomData<State>,
}

impl CrawlConfig {
    #[must_use]
    pub fn builder() -> CrawlConfigBuilder<()> {
        CrawlConfigBuilder {
            cfg: CrawlConfig {
                seeds: Vec::new(),
                out_atls: PathBuf::new(),
                staging_dir: None,
                max_pages: 0,
                max_depth: -1,
                render: RenderConfig::default(),
                http: HttpConfig::default(),
                discovery: DiscoveryConfig::default(),
                robots: RobotsConfig::default(),
                memory: MemoryConfig::default(),
                accessibility: AccessibilityConfig::default(),
                checkpoint: CheckpointConfig::default(),
                shutdown: ShutdownConfig::default(),
                resume: None,
                media: MediaConfig::default(),
                error_budget: 100,
                owner_name: "cartographer".to_string(),
                consumers: Vec::new(),
            },
            _state: PhantomData,
        }
    }
}

impl CrawlConfigBuilder<()> {
    /// Depth-0 URLs. Bare hostnames get an `https://` scheme prepended.
    pub fn seeds<I, S>(mut self, seeds: I) -> CrawlConfigBuilder<WithSeeds>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cfg.seeds = seeds
            .into_iter()
            .map(|s| {
                let s = s.into();
                if s.starts_with("http://") || s.starts_with("https://") {
                    s
                } else {
                    format!("https://{s}")
                }
            })
            .collect();
        CrawlConfigBuilder {
            cfg: self.cfg,
            _state: PhantomData,
        }
    }
}

impl CrawlConfigBuilder<WithSeeds> {
    pub fn out_atls(mut self, path: impl Into<PathBuf>) -> CrawlConfigBuilder<WithOutPath> {
        self.cfg.out_atls = path.into();
        CrawlConfigBuilder {
            cfg: self.cfg,
            _state: PhantomData,
        }
    }
}

impl CrawlConfigBuilder<WithOutPath> {
    /// Validate and produce the final configuration.
    pub fn build(self) -> Result<CrawlConfig> {
        let cfg = self.cfg;
        if cfg.seeds.is_empty() {
            return Err(anyhow!("at least one seed URL is required"));
        }
        for seed in &cfg.seeds {
            if crate::url_norm::normalize(seed).is_none() {
                return Err(anyhow!("seed is not a valid http(s) URL: {seed}"));
            }
        }
        if cfg.render.concurrency == 0 {
            return Err(anyhow!("render.concurrency must be at least 1"));
        }
        if cfg.http.per_host_rps <= 0.0 || cfg.http.rps <= 0.0 {
            return Err(anyhow!("http rates must be positive"));
        }
        if !(1..=100).contains(&cfg.media.screenshots.quality) {
            return Err(anyhow!("screenshot quality must be in 1..=100"));
        }
        // Surface bad block patterns now rather than mid-crawl.
        ParamBlockList::compile(&cfg.discovery.block_list)?;
        Ok(cfg)
    }
}

// Optional settings, available in any state.
impl<State> CrawlConfigBuilder<State> {
    #[must_use]
    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cfg.staging_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn max_pages(mut self, n: usize) -> Self {
        self.cfg.max_pages = n;
        self
    }

    #[must_use]
    pub fn max_depth(mut self, d: i32) -> Self {
        self.cfg.max_depth = d;
        self
    }

    #[must_use]
    pub fn render_mode(mut self, mode: RenderMode) -> Self {
        self.cfg.render.mode = mode;
        self
    }

    #[must_use]
    pub fn concurrency(mut self, n: usize) -> Self {
        self.cfg.render.concurrency = n;
        self
    }

    #[must_use]
    pub fn render_timeout_ms(mut self, ms: u64) -> Self {
        self.cfg.render.timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn max_requests_per_page(mut self, n: usize) -> Self {
        self.cfg.render.max_requests_per_page = n;
        self
    }

    #[must_use]
    pub fn max_bytes_per_page(mut self, n: usize) -> Self {
        self.cfg.render.max_bytes_per_page = n;
        self
    }

    #[must_use]
    pub fn global_rps(mut self, rps: f64) -> Self {
        self.cfg.http.rps = rps;
        self
    }

    #[must_use]
    pub fn per_host_rps(mut self, rps: f64) -> Self {
        self.cfg.http.per_host_rps = rps;
        self
    }

    #[must_use]
    pub fn burst(mut self, tokens: f64) -> Self {
        self.cfg.http.burst = tokens;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.cfg.http.user_agent = ua.into();
        self
    }

    #[must_use]
    pub fn follow_external(mut self, yes: bool) -> Self {
        self.cfg.discovery.follow_external = yes;
        self
    }

    #[must_use]
    pub fn param_policy(mut self, policy: ParamPolicy) -> Self {
        self.cfg.discovery.param_policy = policy;
        self
    }

    #[must_use]
    pub fn block_list<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cfg.discovery.block_list = patterns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn respect_robots(mut self, yes: bool) -> Self {
        self.cfg.robots.respect = yes;
        self
    }

    #[must_use]
    pub fn max_rss_mb(mut self, mb: u64) -> Self {
        self.cfg.memory.max_rss_mb = mb;
        self
    }

    #[must_use]
    pub fn accessibility(mut self, enabled: bool) -> Self {
        self.cfg.accessibility.enabled = enabled;
        self
    }

    #[must_use]
    pub fn checkpoint_interval(mut self, every_pages: usize) -> Self {
        self.cfg.checkpoint.interval = every_pages;
        self
    }

    #[must_use]
    pub fn checkpoint_every_seconds(mut self, secs: u64) -> Self {
        self.cfg.checkpoint.every_seconds = Some(secs);
        self
    }

    #[must_use]
    pub fn checkpoints_enabled(mut self, enabled: bool) -> Self {
        self.cfg.checkpoint.enabled = enabled;
        self
    }

    #[must_use]
    pub fn graceful_timeout_ms(mut self, ms: u64) -> Self {
        self.cfg.shutdown.graceful_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn resume_from(mut self, staging_dir: impl Into<PathBuf>) -> Self {
        self.cfg.resume = Some(ResumeConfig {
            crawl_id: None,
            staging_dir: staging_dir.into(),
        });
        self
    }

    #[must_use]
    pub fn screenshots(mut self, enabled: bool) -> Self {
        self.cfg.media.screenshots.enabled = enabled;
        self
    }

    #[must_use]
    pub fn favicons(mut self, enabled: bool) -> Self {
        self.cfg.media.favicons.enabled = enabled;
        self
    }

    #[must_use]
    pub fn error_budget(mut self, n: usize) -> Self {
        self.cfg.error_budget = n;
        self
    }

    #[must_use]
    pub fn owner_name(mut self, name: impl Into<String>) -> Self {
        self.cfg.owner_name = name.into();
        self
    }
}
