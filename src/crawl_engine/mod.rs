//! The crawl engine: scheduler, frontier, rate limiting, page pipeline.

pub mod frontier;
pub mod memory;
pub mod page_task;
pub mod rate_limiter;
mod scheduler;

pub use frontier::{Frontier, QueueItem};
pub use page_task::{Candidate, TaskContext, TaskOutput};
pub use rate_limiter::{GlobalRateGate, HostTokenBuckets};
pub use scheduler::{ControlMsg, CrawlState, Scheduler, SharedProgress};
