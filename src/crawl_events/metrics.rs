//! Lock-free counters for the bus and the crawl.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use crate::records::RenderMode;

/// Delivery accounting for the event bus.
#[derive(Debug, Default)]
pub struct EventBusMetrics {
    pub events_published: AtomicU64,
    pub events_dropped: AtomicU64,
    pub active_subscribers: AtomicU64,
    pub peak_subscribers: AtomicU64,
}

impl EventBusMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_published(&self) {
        self.events_published.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn update_subscriber_count(&self, count: usize) {
        self.active_subscribers.store(count as u64, Ordering::SeqCst);
        self.peak_subscribers.fetch_max(count as u64, Ordering::SeqCst);
    }
}

/// Per-page timers and crawl totals feeding the summary.
pub struct CrawlMetrics {
    started: Instant,
    pub pages: AtomicU64,
    pub errors: AtomicU64,
    pub edges: AtomicU64,
    pub assets: AtomicU64,
    pub bytes_fetched: AtomicU64,
    pub fetch_ms_total: AtomicU64,
    pub render_ms_total: AtomicU64,
    pub extract_ms_total: AtomicU64,
    pub write_ms_total: AtomicU64,
    pub max_depth_reached: AtomicU32,
    status_histogram: Mutex<BTreeMap<String, u64>>,
    mode_histogram: Mutex<BTreeMap<String, u64>>,
    modes_used: Mutex<Vec<RenderMode>>,
    rss_samples: Mutex<Vec<u64>>,
}

impl CrawlMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            pages: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            edges: AtomicU64::new(0),
            assets: AtomicU64::new(0),
            bytes_fetched: AtomicU64::new(0),
            fetch_ms_total: AtomicU64::new(0),
            render_ms_total: AtomicU64::new(0),
            extract_ms_total: AtomicU64::new(0),
            write_ms_total: AtomicU64::new(0),
            max_depth_reached: AtomicU32::new(0),
            status_histogram: Mutex::new(BTreeMap::new()),
            mode_histogram: Mutex::new(BTreeMap::new()),
            modes_used: Mutex::new(Vec::new()),
            rss_samples: Mutex::new(Vec::new()),
        }
    }

    pub fn record_page(
        &self,
        status_code: u16,
        mode: RenderMode,
        depth: u32,
        fetch_ms: u64,
        render_ms: u64,
        extract_ms: u64,
        write_ms: u64,
    ) {
        self.pages.fetch_add(1, Ordering::Relaxed);
        self.fetch_ms_total.fetch_add(fetch_ms, Ordering::Relaxed);
        self.render_ms_total.fetch_add(render_ms, Ordering::Relaxed);
        self.extract_ms_total.fetch_add(extract_ms, Ordering::Relaxed);
        self.write_ms_total.fetch_add(write_ms, Ordering::Relaxed);
        self.max_depth_reached.fetch_max(depth, Ordering::Relaxed);
        *self
            .status_histogram
            .lock()
            .entry(status_code.to_string())
            .or_default() += 1;
        *self
            .mode_histogram
            .lock()
            .entry(mode.as_str().to_string())
            .or_default() += 1;
        let mut modes = self.modes_used.lock();
        if !modes.contains(&mode) {
            modes.push(mode);
        }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rss(&self, bytes: u64) {
        let mut samples = self.rss_samples.lock();
        samples.push(bytes);
        // Only a recent window matters for reporting.
        if samples.len() > 600 {
            samples.remove(0);
        }
    }

    #[must_use]
    pub fn pages_per_second(&self) -> f64 {
        let pages = self.pages.load(Ordering::Relaxed) as f64;
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            pages / secs
        } else {
            0.0
        }
    }

    #[must_use]
    pub fn avg_render_ms(&self) -> f64 {
        let pages = self.pages.load(Ordering::Relaxed);
        if pages == 0 {
            return 0.0;
        }
        self.render_ms_total.load(Ordering::Relaxed) as f64 / pages as f64
    }

    #[must_use]
    pub fn status_histogram(&self) -> BTreeMap<String, u64> {
        self.status_histogram.lock().clone()
    }

    #[must_use]
    pub fn mode_histogram(&self) -> BTreeMap<String, u64> {
        self.mode_histogram.lock().clone()
    }

    #[must_use]
    pub fn modes_used(&self) -> Vec<RenderMode> {
        self.modes_used.lock().clone()
    }
}

impl Default for CrawlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_page_accumulates() {
        let metrics = CrawlMetrics::new();
        metrics.record_page(200, RenderMode::Raw, 2, 10, 20, 3, 1);
        metrics.record_page(404, RenderMode::Raw, 1, 10, 40, 3, 1);

        assert_eq!(metrics.pages.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.avg_render_ms(), 30.0);
        assert_eq!(metrics.max_depth_reached.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.status_histogram()["200"], 1);
        assert_eq!(metrics.status_histogram()["404"], 1);
        assert_eq!(metrics.modes_used(), vec![RenderMode::Raw]);
    }

    #[test]
    fn bus_metrics_track_peak() {
        let metrics = EventBusMetrics::new();
        metrics.update_subscriber_count(3);
        metrics.update_subscriber_count(1);
        assert_eq!(metrics.active_subscribers.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.peak_subscribers.load(Ordering::SeqCst), 3);
    }
}
