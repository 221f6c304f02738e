//! The crawl scheduler: BFS dispatch, state machine, checkpointing and
//! graceful shutdown.
//!
//! The loop owns the frontier, the visited/enqueued sets and the per-host
//! queues exclusively. Page tasks run on a bounded pool and report back
//! through joined futures; the loop integrates their results, applies the
//! enqueue rules and fires checkpoints between dispatches, which is what
//! makes checkpoint snapshots consistent.

use chrono::{DateTime, Utc};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::frontier::{Frontier, QueueItem};
use super::memory::current_rss_bytes;
use super::page_task::{process_page, Candidate, FatalError, TaskContext, TaskOutput};
use super::rate_limiter::{GlobalRateGate, HostTokenBuckets};
use crate::archive_writer::{ArchiveWriter, SummaryInput};
use crate::checkpoint::{CheckpointSnapshot, CheckpointStore};
use crate::config::CrawlConfig;
use crate::crawl_events::{CrawlEvent, CrawlEventBus, CrawlMetrics, ProgressSnapshot};
use crate::error::{CrawlError, CrawlResult};
use crate::fetcher::Fetcher;
use crate::records::{CompletionReason, SummaryConfig};
use crate::renderer::{BrowserEngine, Renderer};
use crate::robots::RobotsCache;
use crate::url_norm::{normalize, url_key, ParamBlockList, SeenParams};

/// Crawl lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlState {
    Idle,
    Running,
    Paused,
    Canceling,
    Finalizing,
    Done,
    Failed,
}

/// Lifecycle commands from the façade.
#[derive(Debug, Clone, Copy)]
pub enum ControlMsg {
    Pause,
    Resume,
    Cancel,
}

/// Non-blocking progress view shared with the façade.
pub struct SharedProgress {
    state: Mutex<CrawlState>,
    queued: AtomicU64,
    in_flight: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    pps_milli: AtomicU64,
    started_at: Mutex<DateTime<Utc>>,
    manifest_path: Mutex<Option<PathBuf>>,
    completion_reason: Mutex<Option<CompletionReason>>,
}

impl SharedProgress {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CrawlState::Idle),
            queued: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            pps_milli: AtomicU64::new(0),
            started_at: Mutex::new(Utc::now()),
            manifest_path: Mutex::new(None),
            completion_reason: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn state(&self) -> CrawlState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: CrawlState) {
        *self.state.lock() = state;
    }

    #[must_use]
    pub fn manifest_path(&self) -> Option<PathBuf> {
        self.manifest_path.lock().clone()
    }

    #[must_use]
    pub fn completion_reason(&self) -> Option<CompletionReason> {
        *self.completion_reason.lock()
    }

    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        let queued = self.queued.load(Ordering::Relaxed);
        let pps = self.pps_milli.load(Ordering::Relaxed) as f64 / 1000.0;
        ProgressSnapshot {
            queued,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            pages_per_second: pps,
            eta_seconds: (pps > 0.0 && queued > 0).then(|| queued as f64 / pps),
            started_at: *self.started_at.lock(),
            updated_at: Utc::now(),
        }
    }

    fn update(&self, queued: u64, in_flight: u64, completed: u64, errors: u64, pps: f64) {
        self.queued.store(queued, Ordering::Relaxed);
        self.in_flight.store(in_flight, Ordering::Relaxed);
        self.completed.store(completed, Ordering::Relaxed);
        self.errors.store(errors, Ordering::Relaxed);
        self.pps_milli.store((pps * 1000.0) as u64, Ordering::Relaxed);
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Interval between backpressure emissions while the loop is starved.
const BACKPRESSURE_EVERY: Duration = Duration::from_secs(1);
/// Nap when no host could consume in a round.
const DRY_NAP: Duration = Duration::from_millis(100);
const MEMORY_HIGH_WATER: f64 = 0.90;
const MEMORY_LOW_WATER: f64 = 0.70;

pub struct Scheduler {
    cfg: Arc<CrawlConfig>,
    crawl_id: String,
    resume_of: Option<String>,
    bus: Arc<CrawlEventBus>,
    progress: Arc<SharedProgress>,
    control_rx: Option<mpsc::Receiver<ControlMsg>>,
    frontier: Frontier,
    buckets: HostTokenBuckets,
    global_gate: GlobalRateGate,
    checkpoint: CheckpointStore,
    metrics: Arc<CrawlMetrics>,
    writer: Option<ArchiveWriter>,
    seen_params: Arc<SeenParams>,
    started_at: DateTime<Utc>,
}

impl Scheduler {
    /// Build a scheduler, restoring checkpoint state when the config asks
    /// for a resume.
    pub fn new(
        cfg: CrawlConfig,
        bus: Arc<CrawlEventBus>,
        progress: Arc<SharedProgress>,
        control_rx: mpsc::Receiver<ControlMsg>,
    ) -> CrawlResult<Self> {
        let cfg = Arc::new(cfg);
        let crawl_id = bus.crawl_id();
        let staging = cfg.effective_staging_dir();
        let block_list = ParamBlockList::compile(&cfg.discovery.block_list)
            .map_err(|e| CrawlError::Config(format!("{e:#}")))?;
        // Per-crawl sample-policy state; seeds claim their parameters here
        // so the same state must flow into the page tasks.
        let seen_params = Arc::new(SeenParams::new());

        let mut frontier = Frontier::new();
        let mut resume_of = None;
        let writer;

        if let Some(resume) = &cfg.resume {
            let restored = CheckpointStore::restore(&resume.staging_dir)
                .map_err(|e| CrawlError::Config(format!("cannot resume: {e:#}")))?;
            resume_of = Some(restored.state.crawl_id.clone());

            for key in restored.visited {
                frontier.mark_visited(key);
            }
            for entry in restored.frontier {
                // Entries were admitted under the original policy; re-bin
                // them verbatim rather than re-applying the param policy.
                let Some(normalized) = normalize(&entry.url) else {
                    continue;
                };
                let Some(host) = Url::parse(&entry.url)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
                else {
                    continue;
                };
                frontier.enqueue(QueueItem {
                    url: entry.url,
                    key: url_key(&normalized),
                    normalized,
                    host,
                    depth: entry.depth,
                    discovered_from: entry.discovered_from,
                });
            }

            let w = ArchiveWriter::resume(&cfg, &crawl_id, &restored.state.part_pointers)
                .map_err(|e| CrawlError::Write(format!("{e:#}")))?;
            w.add_note(format!("Resumed from crawl {}", restored.state.crawl_id));
            writer = w;
            info!(
                resumed_from = %resume_of.as_deref().unwrap_or(""),
                visited = frontier.visited_count(),
                queued = frontier.queued(),
                "resuming crawl from checkpoint"
            );
        } else {
            writer = ArchiveWriter::init(&cfg, &crawl_id)
                .map_err(|e| CrawlError::Write(format!("{e:#}")))?;
            // Seed the frontier at depth 0; the page cap counts seeds too.
            for seed in &cfg.seeds {
                if cfg.page_cap_reached(frontier.admitted()) {
                    break;
                }
                if let Some(candidate) = super::page_task::prepare_candidate(
                    seed,
                    &cfg,
                    &block_list,
                    &seen_params,
                    false,
                ) {
                    frontier.enqueue(QueueItem {
                        url: candidate.url,
                        normalized: candidate.normalized,
                        key: candidate.key,
                        host: candidate.host,
                        depth: 0,
                        discovered_from: None,
                    });
                } else {
                    warn!("seed did not survive normalization: {seed}");
                }
            }
            if frontier.queued() == 0 {
                return Err(CrawlError::Config("no usable seed URLs".into()));
            }
        }

        let checkpoint = CheckpointStore::new(
            &staging,
            cfg.checkpoint.enabled,
            cfg.checkpoint.interval,
            cfg.checkpoint.every_seconds,
        );

        Ok(Self {
            buckets: HostTokenBuckets::new(cfg.http.per_host_rps, cfg.http.burst),
            global_gate: GlobalRateGate::new(cfg.http.rps),
            checkpoint,
            metrics: Arc::new(CrawlMetrics::new()),
            frontier,
            crawl_id,
            resume_of,
            bus,
            progress,
            control_rx: Some(control_rx),
            writer: Some(writer),
            seen_params,
            cfg,
            started_at: Utc::now(),
        })
    }

    /// Drive the crawl to completion. Returns the sealed archive path.
    pub async fn run(
        mut self,
        engine_override: Option<Arc<dyn BrowserEngine>>,
    ) -> CrawlResult<PathBuf> {
        let fetcher = Arc::new(
            Fetcher::new(&self.cfg.http, &self.cfg.render)
                .map_err(|e| CrawlError::Config(format!("{e:#}")))?,
        );
        let robots = Arc::new(
            RobotsCache::new(&self.cfg.http.user_agent, self.cfg.robots.respect)
                .map_err(|e| CrawlError::Config(format!("{e:#}")))?,
        );
        let renderer = match engine_override {
            Some(engine) => Arc::new(Renderer::with_engine(&self.cfg, engine)),
            None => Arc::new(
                Renderer::init(&self.cfg)
                    .await
                    .map_err(|e| CrawlError::Renderer(format!("{e:#}")))?,
            ),
        };
        let writer = Arc::new(self.writer.take().expect("writer present until run"));
        let block_list = Arc::new(
            ParamBlockList::compile(&self.cfg.discovery.block_list)
                .map_err(|e| CrawlError::Config(format!("{e:#}")))?,
        );

        let ctx = TaskContext {
            cfg: Arc::clone(&self.cfg),
            fetcher,
            renderer: Arc::clone(&renderer),
            robots: Arc::clone(&robots),
            writer: Arc::clone(&writer),
            bus: Arc::clone(&self.bus),
            metrics: Arc::clone(&self.metrics),
            block_list,
            seen_params: Arc::clone(&self.seen_params),
        };

        self.progress.set_state(CrawlState::Running);
        *self.progress.started_at.lock() = self.started_at;
        self.bus.publish(CrawlEvent::Started {
            seeds: self.cfg.seeds.clone(),
            staging_dir: self.cfg.effective_staging_dir(),
            resumed_from: self.resume_of.clone(),
        });

        let outcome = self.main_loop(&ctx).await;
        // Every task has joined; release this loop's component handles so
        // the writer Arc can be reclaimed below.
        drop(ctx);

        // Finalization path, shared by every exit.
        self.progress.set_state(CrawlState::Finalizing);
        let graceful = matches!(&outcome.exit, LoopExit::Cancelled | LoopExit::Completed);
        let writer = match Arc::try_unwrap(writer) {
            Ok(writer) => writer,
            Err(_) => {
                return Err(CrawlError::Write(
                    "writer still referenced by unfinished tasks".into(),
                ));
            }
        };

        if let Err(e) = writer.flush_and_sync().await {
            self.progress.set_state(CrawlState::Failed);
            return Err(CrawlError::Write(format!("{e:#}")));
        }
        self.save_checkpoint(&writer, graceful).await;

        for origin in robots.malformed_origins() {
            writer.add_note(format!("robots.txt at {origin} was malformed; treated as allow-all"));
        }

        if let LoopExit::Fatal(fatal) = outcome.exit {
            let _ = renderer.close().await;
            self.progress.set_state(CrawlState::Failed);
            return Err(match fatal {
                FatalError::Renderer(msg) => CrawlError::Renderer(msg),
                FatalError::Write(msg) => CrawlError::Write(msg),
            });
        }

        let completion = outcome.completion;
        // A capped crawl completed everything its config allowed; only
        // cancellation and budget exhaustion mark the archive incomplete.
        let incomplete = matches!(
            completion,
            CompletionReason::Manual | CompletionReason::ErrorBudget
        );
        writer.set_completion_reason(completion);
        let summary_input = self.summary_input(completion, incomplete);
        let archive = writer
            .finalize(summary_input)
            .await
            .map_err(|e| CrawlError::Write(format!("{e:#}")))?;

        if let Err(e) = renderer.close().await {
            debug!("renderer close failed: {e:#}");
        }

        *self.progress.manifest_path.lock() = Some(archive.clone());
        *self.progress.completion_reason.lock() = Some(completion);
        self.progress.set_state(CrawlState::Done);
        self.bus.publish(CrawlEvent::Finished {
            incomplete,
            completion_reason: completion,
            manifest_path: Some(archive.clone()),
        });
        info!(archive = %archive.display(), ?completion, "crawl finished");
        Ok(archive)
    }

    async fn main_loop(&mut self, ctx: &TaskContext) -> LoopOutcome {
        let concurrency = self.cfg.render.concurrency;
        let max_rss = self.cfg.memory.max_rss_mb * 1024 * 1024;
        let graceful_timeout = Duration::from_millis(self.cfg.shutdown.graceful_timeout_ms);

        let mut control_rx = self.control_rx.take().expect("control channel present");
        let mut control_closed = false;
        let mut tasks: FuturesUnordered<tokio::task::JoinHandle<TaskOutput>> =
            FuturesUnordered::new();
        let mut abort_handles: Vec<tokio::task::AbortHandle> = Vec::new();
        let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut user_paused = false;
        let mut memory_paused = false;
        let mut cancel_requested = false;
        let mut cancel_at: Option<Instant> = None;
        let mut capped_hit = false;
        let mut budget_exceeded = false;
        let mut fatal: Option<FatalError> = None;
        let mut last_backpressure = Instant::now() - BACKPRESSURE_EVERY;

        loop {
            let draining =
                cancel_requested || budget_exceeded || fatal.is_some();
            let paused = user_paused || memory_paused;

            // Dispatch up to the concurrency limit.
            if !draining && !paused {
                let mut dispatched_any = false;
                while tasks.len() < concurrency {
                    let now = Instant::now();
                    let buckets = &self.buckets;
                    let gate = &self.global_gate;
                    let item = self.frontier.next_ready(|host| {
                        if buckets.tokens(host, now) < 1.0 {
                            return false;
                        }
                        if !gate.try_pass(now) {
                            return false;
                        }
                        buckets.try_consume(host, now)
                    });
                    match item {
                        Some(item) => {
                            debug!(url = %item.url, depth = item.depth, "dispatching");
                            let handle = tokio::spawn(process_page(ctx.clone(), item));
                            abort_handles.push(handle.abort_handle());
                            tasks.push(handle);
                            dispatched_any = true;
                        }
                        None => break,
                    }
                }

                // No host could consume this round: report who is deferred.
                if !dispatched_any
                    && !self.frontier.is_exhausted()
                    && tasks.len() < concurrency
                    && last_backpressure.elapsed() >= BACKPRESSURE_EVERY
                {
                    last_backpressure = Instant::now();
                    let now = Instant::now();
                    let (ready, deferred): (Vec<String>, Vec<String>) = self
                        .frontier
                        .hosts_with_work()
                        .into_iter()
                        .partition(|host| self.buckets.tokens(host, now) >= 1.0);
                    if !deferred.is_empty() {
                        self.bus.publish(CrawlEvent::Backpressure {
                            hosts_ready: ready,
                            hosts_deferred: deferred,
                        });
                    }
                }
            }

            self.publish_progress(tasks.len() as u64);

            // Exit conditions, only once the pool has drained.
            if tasks.is_empty() {
                if fatal.is_some() {
                    return LoopOutcome {
                        exit: LoopExit::Fatal(fatal.expect("checked")),
                        completion: CompletionReason::ErrorBudget,
                    };
                }
                if cancel_requested {
                    return LoopOutcome {
                        exit: LoopExit::Cancelled,
                        completion: CompletionReason::Manual,
                    };
                }
                if budget_exceeded {
                    return LoopOutcome {
                        exit: LoopExit::Completed,
                        completion: CompletionReason::ErrorBudget,
                    };
                }
                if self.frontier.is_exhausted() {
                    let completion = if capped_hit {
                        CompletionReason::Capped
                    } else {
                        CompletionReason::Finished
                    };
                    return LoopOutcome {
                        exit: LoopExit::Completed,
                        completion,
                    };
                }
            }

            // Graceful drain bound after a cancel.
            if let Some(at) = cancel_at {
                if !tasks.is_empty() && at.elapsed() >= graceful_timeout {
                    warn!("graceful timeout elapsed, aborting in-flight tasks");
                    for handle in &abort_handles {
                        handle.abort();
                    }
                }
            }

            tokio::select! {
                biased;

                msg = control_rx.recv(), if !control_closed => {
                    if msg.is_none() {
                        control_closed = true;
                    }
                    match msg {
                        Some(ControlMsg::Pause) => {
                            user_paused = true;
                            self.progress.set_state(CrawlState::Paused);
                            info!("crawl paused");
                        }
                        Some(ControlMsg::Resume) => {
                            user_paused = false;
                            if !memory_paused {
                                self.progress.set_state(CrawlState::Running);
                            }
                            info!("crawl resumed");
                        }
                        Some(ControlMsg::Cancel) | None => {
                            if !cancel_requested {
                                cancel_requested = true;
                                cancel_at = Some(Instant::now());
                                self.progress.set_state(CrawlState::Canceling);
                                self.bus.publish(CrawlEvent::Shutdown { graceful: true });
                                info!("cancel requested, draining in-flight work");
                            }
                        }
                    }
                }

                Some(joined) = tasks.next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(output) => {
                            self.integrate(
                                ctx,
                                output,
                                &mut capped_hit,
                                &mut budget_exceeded,
                                &mut fatal,
                            )
                            .await;
                        }
                        Err(e) if e.is_cancelled() => {
                            debug!("aborted in-flight task joined");
                        }
                        Err(e) => {
                            error!("page task panicked: {e}");
                            self.metrics.record_error();
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    let rss = current_rss_bytes();
                    self.metrics.record_rss(rss);
                    if max_rss > 0 {
                        let fraction = rss as f64 / max_rss as f64;
                        if !memory_paused && fraction >= MEMORY_HIGH_WATER {
                            memory_paused = true;
                            self.progress.set_state(CrawlState::Paused);
                            warn!(rss, "RSS above high water, pausing dispatch");
                        } else if memory_paused && fraction <= MEMORY_LOW_WATER {
                            memory_paused = false;
                            if !user_paused {
                                self.progress.set_state(CrawlState::Running);
                            }
                            info!(rss, "RSS back below low water, resuming");
                        }
                    }
                    self.publish_progress(tasks.len() as u64);
                    self.bus.publish(CrawlEvent::Heartbeat {
                        progress: self.progress.snapshot(),
                    });
                }

                _ = tokio::time::sleep(DRY_NAP) => {
                    // Buckets refill on wall clock; retry dispatch.
                }
            }
        }
    }

    async fn integrate(
        &mut self,
        ctx: &TaskContext,
        output: TaskOutput,
        capped_hit: &mut bool,
        budget_exceeded: &mut bool,
        fatal: &mut Option<FatalError>,
    ) {
        if let Some(f) = output.fatal {
            error!(url = %output.item.url, "fatal error: {f:?}");
            if fatal.is_none() {
                *fatal = Some(f);
            }
            return;
        }

        if output.error_written
            && self.cfg.error_budget > 0
            && self.metrics.errors.load(Ordering::Relaxed) as usize > self.cfg.error_budget
            && !*budget_exceeded
        {
            warn!(
                budget = self.cfg.error_budget,
                "error budget exceeded, finalizing"
            );
            *budget_exceeded = true;
        }

        let next_depth = output.item.depth + 1;
        for candidate in output.discovered {
            self.enqueue_if_new(candidate, next_depth, &output.item.url, capped_hit);
        }

        if output.page_written && self.checkpoint.page_completed() {
            self.save_checkpoint(&ctx.writer, false).await;
        }
    }

    fn enqueue_if_new(
        &mut self,
        candidate: Candidate,
        depth: u32,
        discovered_from: &str,
        capped_hit: &mut bool,
    ) {
        if !self.cfg.depth_allowed(depth) {
            return;
        }
        if candidate.external && !self.cfg.discovery.follow_external {
            return;
        }
        if self.frontier.knows(&candidate.key) {
            return;
        }
        if self.cfg.page_cap_reached(self.frontier.admitted()) {
            *capped_hit = true;
            return;
        }
        self.frontier.enqueue(QueueItem {
            url: candidate.url,
            normalized: candidate.normalized,
            key: candidate.key,
            host: candidate.host,
            depth,
            discovered_from: Some(discovered_from.to_string()),
        });
    }

    async fn save_checkpoint(&mut self, writer: &ArchiveWriter, graceful: bool) {
        if !self.cfg.checkpoint.enabled && !graceful {
            return;
        }
        // Writer first, so the part pointers describe durable bytes.
        if let Err(e) = writer.flush_and_sync().await {
            error!("checkpoint flush failed: {e:#}");
            return;
        }
        let snapshot = CheckpointSnapshot {
            crawl_id: self.crawl_id.clone(),
            resume_of: self.resume_of.clone(),
            visited: self.frontier.visited_keys(),
            frontier: self.frontier.snapshot(),
            part_pointers: writer.part_pointers().await,
            rss_bytes: current_rss_bytes(),
            graceful_shutdown: graceful,
        };
        match self.checkpoint.save(&snapshot).await {
            Ok(()) => {
                self.bus.publish(CrawlEvent::CheckpointSaved {
                    visited: snapshot.visited.len() as u64,
                    frontier: snapshot.frontier.len() as u64,
                    graceful,
                });
            }
            Err(e) => error!("checkpoint save failed: {e:#}"),
        }
    }

    fn publish_progress(&self, in_flight: u64) {
        self.progress.update(
            self.frontier.queued() as u64,
            in_flight,
            self.metrics.pages.load(Ordering::Relaxed),
            self.metrics.errors.load(Ordering::Relaxed),
            self.metrics.pages_per_second(),
        );
    }

    fn summary_input(&self, completion: CompletionReason, incomplete: bool) -> SummaryInput {
        let first_seed = self.cfg.seeds.first().cloned().unwrap_or_default();
        let (primary_origin, domain) = Url::parse(&first_seed)
            .map(|u| {
                (
                    crate::url_norm::origin_of(&u),
                    u.host_str().unwrap_or_default().to_string(),
                )
            })
            .unwrap_or_default();

        let mut modes_used = self.metrics.modes_used();
        if modes_used.is_empty() {
            modes_used.push(self.cfg.render.mode);
        }

        SummaryInput {
            seeds: self.cfg.seeds.clone(),
            primary_origin,
            domain,
            config: SummaryConfig {
                render_mode: self.cfg.render.mode,
                concurrency: self.cfg.render.concurrency,
                max_pages: self.cfg.max_pages,
                max_depth: self.cfg.max_depth,
                param_policy: self.cfg.discovery.param_policy.as_str().to_string(),
                follow_external: self.cfg.discovery.follow_external,
            },
            status_histogram: self.metrics.status_histogram(),
            mode_histogram: self.metrics.mode_histogram(),
            modes_used,
            avg_render_ms: self.metrics.avg_render_ms(),
            max_depth_reached: self.metrics.max_depth_reached.load(Ordering::Relaxed),
            started_at: self.started_at,
            completion_reason: completion,
            incomplete,
        }
    }
}

enum LoopExit {
    Completed,
    Cancelled,
    Fatal(FatalError),
}

struct LoopOutcome {
    exit: LoopExit,
    completion: CompletionReason,
}
