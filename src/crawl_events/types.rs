//! Event type definitions for the crawl event system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::records::{CompletionReason, ErrorRecord};

/// Progress snapshot carried by heartbeats and `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub queued: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub errors: u64,
    pub pages_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Events emitted during the crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CrawlEvent {
    #[serde(rename_all = "camelCase")]
    Started {
        seeds: Vec<String>,
        staging_dir: PathBuf,
        #[serde(skip_serializing_if = "Option::is_none")]
        resumed_from: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PageFetched {
        url: String,
        status_code: u16,
        fetch_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    PageParsed {
        url: String,
        url_key: String,
        depth: u32,
        edges: usize,
        assets: usize,
        render_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    ErrorOccurred { record: ErrorRecord },
    #[serde(rename_all = "camelCase")]
    CheckpointSaved {
        visited: u64,
        frontier: u64,
        graceful: bool,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat { progress: ProgressSnapshot },
    #[serde(rename_all = "camelCase")]
    Backpressure {
        hosts_ready: Vec<String>,
        hosts_deferred: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Shutdown { graceful: bool },
    #[serde(rename_all = "camelCase")]
    Finished {
        incomplete: bool,
        completion_reason: CompletionReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        manifest_path: Option<PathBuf>,
    },
}

/// Discriminant of [`CrawlEvent`], used for filtered subscriptions and the
/// replay rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Started,
    PageFetched,
    PageParsed,
    ErrorOccurred,
    CheckpointSaved,
    Heartbeat,
    Backpressure,
    Shutdown,
    Finished,
}

impl EventKind {
    /// Wire name, matching the published event taxonomy.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "crawl.started",
            Self::PageFetched => "page.fetched",
            Self::PageParsed => "page.parsed",
            Self::ErrorOccurred => "error.occurred",
            Self::CheckpointSaved => "checkpoint.saved",
            Self::Heartbeat => "crawl.heartbeat",
            Self::Backpressure => "crawl.backpressure",
            Self::Shutdown => "crawl.shutdown",
            Self::Finished => "crawl.finished",
        }
    }
}

impl CrawlEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Started { .. } => EventKind::Started,
            Self::PageFetched { .. } => EventKind::PageFetched,
            Self::PageParsed { .. } => EventKind::PageParsed,
            Self::ErrorOccurred { .. } => EventKind::ErrorOccurred,
            Self::CheckpointSaved { .. } => EventKind::CheckpointSaved,
            Self::Heartbeat { .. } => EventKind::Heartbeat,
            Self::Backpressure { .. } => EventKind::Backpressure,
            Self::Shutdown { .. } => EventKind::Shutdown,
            Self::Finished { .. } => EventKind::Finished,
        }
    }
}

/// A published event with its bus stamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub crawl_id: String,
    /// Monotonically increasing per bus.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: CrawlEvent,
}

impl EventEnvelope {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_names() {
        assert_eq!(EventKind::Started.as_str(), "crawl.started");
        assert_eq!(EventKind::Backpressure.as_str(), "crawl.backpressure");
        assert_eq!(EventKind::ErrorOccurred.as_str(), "error.occurred");
    }

    #[test]
    fn event_kind_discrimination() {
        let event = CrawlEvent::Shutdown { graceful: true };
        assert_eq!(event.kind(), EventKind::Shutdown);
    }
}
