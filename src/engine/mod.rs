//! The public engine façade.
//!
//! [`Cartographer`] owns the event bus for its whole lifetime and passes it
//! to each crawl it spawns, so handlers registered before the scheduler
//! starts still receive its events and stay subscribed across successive
//! crawls. It also owns the crawl lifecycle: start, pause, resume, cancel,
//! status, event subscription. One façade runs one crawl at a time;
//! `start` while running is an invalid-state error.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::CrawlConfig;
use crate::crawl_engine::{ControlMsg, CrawlState, Scheduler, SharedProgress};
use crate::crawl_events::{CrawlEventBus, EventEnvelope, EventKind, ProgressSnapshot, Subscription};
use crate::error::{CrawlError, CrawlResult};
use crate::renderer::BrowserEngine;

/// Non-blocking status snapshot.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state: CrawlState,
    pub progress: ProgressSnapshot,
    pub manifest_path: Option<PathBuf>,
}

struct ActiveCrawl {
    control_tx: mpsc::Sender<ControlMsg>,
    progress: Arc<SharedProgress>,
    join: Option<JoinHandle<CrawlResult<PathBuf>>>,
    signal_task: Option<JoinHandle<()>>,
}

/// The engine façade.
pub struct Cartographer {
    bus: Arc<CrawlEventBus>,
    active: tokio::sync::Mutex<Option<ActiveCrawl>>,
}

impl Cartographer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bus: Arc::new(CrawlEventBus::new(&uuid::Uuid::new_v4().to_string())),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Begin a crawl (or resume one when `config.resume` is set).
    ///
    /// Fails with an invalid-state error while a crawl is already running.
    pub async fn start(&self, config: CrawlConfig) -> CrawlResult<()> {
        self.start_with_engine(config, None).await
    }

    /// Like [`start`](Self::start) with an injected browser engine; used by
    /// tests and embedders that manage their own browser.
    pub async fn start_with_engine(
        &self,
        config: CrawlConfig,
        engine: Option<Arc<dyn BrowserEngine>>,
    ) -> CrawlResult<()> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            let state = current.progress.state();
            if !matches!(state, CrawlState::Done | CrawlState::Failed) {
                return Err(CrawlError::InvalidState(format!(
                    "crawl already {state:?}; cancel it before starting another"
                )));
            }
        }

        // Same bus, new crawl id: subscriptions survive across crawls.
        let crawl_id = uuid::Uuid::new_v4().to_string();
        self.bus.set_crawl_id(&crawl_id);
        let progress = Arc::new(SharedProgress::new());
        let (control_tx, control_rx) = mpsc::channel(16);

        let scheduler = Scheduler::new(
            config,
            Arc::clone(&self.bus),
            Arc::clone(&progress),
            control_rx,
        )?;
        info!(crawl_id, "starting crawl");
        let join = tokio::spawn(scheduler.run(engine));

        // First termination signal: graceful cancel. A second one aborts
        // the process after the scheduler's best-effort checkpoint window.
        let signal_control = control_tx.clone();
        let signal_task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("termination signal received, requesting graceful shutdown");
            let _ = signal_control.send(ControlMsg::Cancel).await;
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("second signal, exiting immediately");
                std::process::exit(130);
            }
        });

        *active = Some(ActiveCrawl {
            control_tx,
            progress,
            join: Some(join),
            signal_task: Some(signal_task),
        });
        Ok(())
    }

    /// Wait for the running crawl to finish; returns the archive path.
    pub async fn join(&self) -> CrawlResult<PathBuf> {
        let join = {
            let mut active = self.active.lock().await;
            let current = active
                .as_mut()
                .ok_or_else(|| CrawlError::InvalidState("no crawl was started".into()))?;
            current
                .join
                .take()
                .ok_or_else(|| CrawlError::InvalidState("crawl already joined".into()))?
        };
        let result = join
            .await
            .map_err(|e| CrawlError::Other(anyhow::anyhow!("crawl task panicked: {e}")))?;

        let mut active = self.active.lock().await;
        if let Some(current) = active.as_mut() {
            if let Some(signal_task) = current.signal_task.take() {
                signal_task.abort();
            }
        }
        result
    }

    pub async fn pause(&self) -> CrawlResult<()> {
        self.send_control(ControlMsg::Pause).await
    }

    pub async fn resume(&self) -> CrawlResult<()> {
        self.send_control(ControlMsg::Resume).await
    }

    /// Cooperative cancel: no new dispatches, bounded drain, checkpoint,
    /// then finalize with completion reason `manual`.
    pub async fn cancel(&self) -> CrawlResult<()> {
        self.send_control(ControlMsg::Cancel).await
    }

    /// Non-blocking lifecycle + progress snapshot.
    pub async fn status(&self) -> EngineStatus {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(current) => EngineStatus {
                state: current.progress.state(),
                progress: current.progress.snapshot(),
                manifest_path: current.progress.manifest_path(),
            },
            None => EngineStatus {
                state: CrawlState::Idle,
                progress: SharedProgress::new().snapshot(),
                manifest_path: None,
            },
        }
    }

    /// Subscribe a handler to one event type (or all with `None`).
    /// Valid before any crawl starts and across successive crawls.
    pub fn on<F>(&self, kind: Option<EventKind>, handler: F) -> Subscription
    where
        F: Fn(EventEnvelope) + Send + Sync + 'static,
    {
        self.bus.on(kind, handler)
    }

    /// Subscribe a handler that fires exactly once.
    pub fn once<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(EventEnvelope) + Send + Sync + 'static,
    {
        self.bus.once(kind, handler)
    }

    /// Subscribe with immediate delivery of the latest event of the type.
    pub fn on_with_replay<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(EventEnvelope) + Send + Sync + 'static,
    {
        self.bus.on_with_replay(kind, handler)
    }

    /// The façade's event bus, shared by every crawl it runs.
    #[must_use]
    pub fn bus(&self) -> Arc<CrawlEventBus> {
        Arc::clone(&self.bus)
    }

    async fn send_control(&self, msg: ControlMsg) -> CrawlResult<()> {
        let active = self.active.lock().await;
        let current = active
            .as_ref()
            .ok_or_else(|| CrawlError::InvalidState("no crawl was started".into()))?;
        current
            .control_tx
            .send(msg)
            .await
            .map_err(|_| CrawlError::InvalidState("crawl is no longer running".into()))
    }
}

impl Default for Cartographer {
    fn default() -> Self {
        Self::new()
    }
}
