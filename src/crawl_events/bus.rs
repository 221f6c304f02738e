//! The typed publish/subscribe hub.
//!
//! The façade owns one bus for its lifetime and injects it explicitly into
//! the scheduler and writer, never through process globals; successive
//! crawls re-stamp the crawl id rather than replacing the bus, so handlers
//! registered before the scheduler starts still receive its events.
//! Emission never blocks and never fails the emitter; a handler that
//! panics takes down only its own delivery task.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use super::metrics::EventBusMetrics;
use super::types::{CrawlEvent, EventEnvelope, EventKind};

/// Events retained per type for replay subscriptions.
const REPLAY_RING: usize = 32;

const DEFAULT_CAPACITY: usize = 1024;

/// Guard for a handler subscription; dropping it unsubscribes.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Explicit unsubscribe, equivalent to dropping the guard.
    pub fn off(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct CrawlEventBus {
    /// Stamped on every envelope; re-set by the façade when a new crawl
    /// starts on the same bus.
    crawl_id: RwLock<String>,
    sender: broadcast::Sender<EventEnvelope>,
    seq: AtomicU64,
    replay: Mutex<HashMap<EventKind, VecDeque<EventEnvelope>>>,
    metrics: EventBusMetrics,
}

impl CrawlEventBus {
    #[must_use]
    pub fn new(crawl_id: &str) -> Self {
        Self::with_capacity(crawl_id, DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(crawl_id: &str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            crawl_id: RwLock::new(crawl_id.to_string()),
            sender,
            seq: AtomicU64::new(0),
            replay: Mutex::new(HashMap::new()),
            metrics: EventBusMetrics::new(),
        }
    }

    #[must_use]
    pub fn crawl_id(&self) -> String {
        self.crawl_id.read().clone()
    }

    /// Re-stamp the bus for a new crawl. Existing subscriptions keep
    /// receiving; only the id carried on future envelopes changes.
    pub fn set_crawl_id(&self, crawl_id: &str) {
        *self.crawl_id.write() = crawl_id.to_string();
    }

    #[must_use]
    pub fn metrics(&self) -> &EventBusMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Stamp and publish. Emission is fire-and-forget: with no subscribers
    /// the event still lands in the replay ring.
    pub fn publish(&self, event: CrawlEvent) -> EventEnvelope {
        let envelope = EventEnvelope {
            crawl_id: self.crawl_id(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            timestamp: chrono::Utc::now(),
            event,
        };

        {
            let mut replay = self.replay.lock();
            let ring = replay.entry(envelope.kind()).or_default();
            if ring.len() >= REPLAY_RING {
                ring.pop_front();
            }
            ring.push_back(envelope.clone());
        }

        match self.sender.send(envelope.clone()) {
            Ok(subscribers) => {
                self.metrics.increment_published();
                self.metrics.update_subscriber_count(subscribers);
            }
            Err(_) => {
                self.metrics.increment_dropped();
                debug!("published {} with no subscribers", envelope.kind().as_str());
            }
        }
        envelope
    }

    /// Raw subscription to every event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// The most recent event of `kind`, if any was published.
    #[must_use]
    pub fn latest(&self, kind: EventKind) -> Option<EventEnvelope> {
        self.replay.lock().get(&kind).and_then(|r| r.back().cloned())
    }

    /// Register a handler for `kind` (or all events when `None`).
    pub fn on<F>(&self, kind: Option<EventKind>, handler: F) -> Subscription
    where
        F: Fn(EventEnvelope) + Send + Sync + 'static,
    {
        self.spawn_handler(kind, handler, false, None)
    }

    /// Register a handler that fires once, then unsubscribes itself.
    pub fn once<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(EventEnvelope) + Send + Sync + 'static,
    {
        self.spawn_handler(Some(kind), handler, true, None)
    }

    /// Like [`on`](Self::on), but delivers the most recent event of the
    /// type immediately after subscription.
    pub fn on_with_replay<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(EventEnvelope) + Send + Sync + 'static,
    {
        let seed = self.latest(kind);
        self.spawn_handler(Some(kind), handler, false, seed)
    }

    fn spawn_handler<F>(
        &self,
        kind: Option<EventKind>,
        handler: F,
        once: bool,
        seed: Option<EventEnvelope>,
    ) -> Subscription
    where
        F: Fn(EventEnvelope) + Send + Sync + 'static,
    {
        let mut receiver = self.sender.subscribe();
        let handler: Arc<dyn Fn(EventEnvelope) + Send + Sync> = Arc::new(handler);

        let handle = tokio::spawn(async move {
            if let Some(seed) = seed {
                if call_isolated(&handler, seed) && once {
                    return;
                }
            }
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if let Some(kind) = kind {
                            if envelope.kind() != kind {
                                continue;
                            }
                        }
                        let delivered = call_isolated(&handler, envelope);
                        if once && delivered {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("event handler lagged, skipped {missed} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Subscription { handle }
    }
}

/// Invoke the handler, swallowing panics. Returns whether it was invoked.
fn call_isolated(
    handler: &Arc<dyn Fn(EventEnvelope) + Send + Sync>,
    envelope: EventEnvelope,
) -> bool {
    let callable = handler.as_ref();
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| callable(envelope)));
    if result.is_err() {
        tracing::warn!("event handler panicked; subscription continues");
    }
    true
}
