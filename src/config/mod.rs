//! Crawl configuration.
//!
//! `CrawlConfig` is the single shared configuration handed to every
//! component. It is constructed through a typestate builder so the two
//! required inputs (seed URLs and the archive out-path) are enforced at
//! compile time.

mod builder;
mod types;

pub use builder::{CrawlConfigBuilder, WithOutPath, WithSeeds};
pub use types::{
    AccessibilityConfig, CheckpointConfig, CrawlConfig, DiscoveryConfig, FaviconConfig,
    HttpConfig, MediaConfig, MemoryConfig, RenderConfig, ResumeConfig, RobotsConfig,
    ScreenshotConfig, ShutdownConfig,
};
