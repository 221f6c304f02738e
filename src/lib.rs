//! Cartographer: a headless web-crawling engine producing self-describing,
//! content-addressed `.atls` archives of a site's structure, content, link
//! graph, asset inventory and accessibility signals.
//!
//! The crate is organized around four tightly-coupled parts: a
//! breadth-first per-host-rate-limited scheduler with checkpoint/resume
//! ([`crawl_engine`]), a three-mode render pipeline ([`renderer`]), pure
//! extractors turning page bytes into typed records ([`page_extractor`]),
//! and a streaming archive writer sealing an integrity-hashed container
//! ([`archive_writer`]). They communicate through an in-process event bus
//! ([`crawl_events`]) and share one [`config::CrawlConfig`].
//!
//! ```no_run
//! use cartographer::{Cartographer, CrawlConfig};
//!
//! # async fn run() -> Result<(), cartographer::CrawlError> {
//! let config = CrawlConfig::builder()
//!     .seeds(["https://example.com/"])
//!     .out_atls("./example.atls")
//!     .max_pages(100)
//!     .build()
//!     .map_err(|e| cartographer::CrawlError::Config(e.to_string()))?;
//!
//! let engine = Cartographer::new();
//! engine.start(config).await?;
//! let archive = engine.join().await?;
//! println!("sealed archive at {}", archive.display());
//! # Ok(())
//! # }
//! ```

pub mod archive_writer;
pub mod checkpoint;
pub mod config;
pub mod crawl_engine;
pub mod crawl_events;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod page_extractor;
pub mod records;
pub mod renderer;
pub mod robots;
pub mod url_norm;

pub use archive_writer::{validate_archive, ArchiveWriter};
pub use config::CrawlConfig;
pub use crawl_engine::{CrawlState, SharedProgress};
pub use crawl_events::{CrawlEvent, CrawlEventBus, EventEnvelope, EventKind};
pub use engine::{Cartographer, EngineStatus};
pub use error::{CrawlError, CrawlResult};
pub use records::{CompletionReason, Manifest, PageRecord, RenderMode, Summary};
pub use renderer::{BrowserEngine, BrowserPage, Renderer};
