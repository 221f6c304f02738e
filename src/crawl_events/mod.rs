//! Crawl event system: typed bus, envelopes and metrics.

mod bus;
mod metrics;
mod types;

pub use bus::{CrawlEventBus, Subscription};
pub use metrics::{CrawlMetrics, EventBusMetrics};
pub use types::{CrawlEvent, EventEnvelope, EventKind, ProgressSnapshot};
