//! The per-page pipeline: robots → fetch → render → extract → write →
//! report discovered links.
//!
//! Runs inside the bounded pool. All shared state is reached through the
//! internally-synchronized writer and bus; the frontier is never touched
//! from here; discovered candidates travel back to the scheduler loop.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use url::Url;

use super::frontier::QueueItem;
use crate::archive_writer::{ArchiveWriter, Viewport};
use crate::config::CrawlConfig;
use crate::crawl_events::{CrawlEvent, CrawlEventBus, CrawlMetrics};
use crate::error::{classify_fetch_error, codes};
use crate::fetcher::Fetcher;
use crate::page_extractor::{run_extractors, ExtractionInput};
use crate::records::{
    ComputedTextNodeRecord, ConsoleRecord, ErrorPhase, ErrorRecord, PageRecord, RenderMode,
    ScreenshotPaths, SecurityHeaders,
};
use crate::renderer::{classify_render_error, Renderer};
use crate::robots::RobotsCache;
use crate::url_norm::{
    apply_param_policy, normalize, origin_key, origin_of, section_of, url_key, ParamBlockList,
    SeenParams,
};

/// Shared components cloned into every page task.
#[derive(Clone)]
pub struct TaskContext {
    pub cfg: Arc<CrawlConfig>,
    pub fetcher: Arc<Fetcher>,
    pub renderer: Arc<Renderer>,
    pub robots: Arc<RobotsCache>,
    pub writer: Arc<ArchiveWriter>,
    pub bus: Arc<CrawlEventBus>,
    pub metrics: Arc<CrawlMetrics>,
    pub block_list: Arc<ParamBlockList>,
    pub seen_params: Arc<SeenParams>,
}

/// A URL candidate surfaced by link discovery, ready for enqueue rules.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub url: String,
    pub normalized: String,
    pub key: String,
    pub host: String,
    pub external: bool,
}

/// Failures that must stop the whole crawl.
#[derive(Debug)]
pub enum FatalError {
    Renderer(String),
    Write(String),
}

/// What one finished task reports back to the scheduler loop.
pub struct TaskOutput {
    pub item: QueueItem,
    pub page_written: bool,
    pub error_written: bool,
    pub fatal: Option<FatalError>,
    pub discovered: Vec<Candidate>,
}

impl TaskOutput {
    fn failed(item: QueueItem) -> Self {
        Self {
            item,
            page_written: false,
            error_written: true,
            fatal: None,
            discovered: Vec::new(),
        }
    }

    fn fatal(item: QueueItem, fatal: FatalError) -> Self {
        Self {
            item,
            page_written: false,
            error_written: false,
            fatal: Some(fatal),
            discovered: Vec::new(),
        }
    }
}

/// Normalize one raw URL through the block list and param policy.
pub fn prepare_candidate(
    raw_url: &str,
    cfg: &CrawlConfig,
    block_list: &ParamBlockList,
    seen_params: &SeenParams,
    external: bool,
) -> Option<Candidate> {
    let parsed = Url::parse(raw_url).ok()?;
    let policied = apply_param_policy(
        &parsed,
        cfg.discovery.param_policy,
        block_list,
        seen_params,
    );
    let normalized = normalize(policied.as_str())?;
    let host = policied.host_str()?.to_string();
    Some(Candidate {
        url: policied.to_string(),
        key: url_key(&normalized),
        normalized,
        host,
        external,
    })
}

/// Run the full pipeline for one dequeued URL.
pub async fn process_page(ctx: TaskContext, item: QueueItem) -> TaskOutput {
    let Ok(url) = Url::parse(&item.url) else {
        // Normalization upstream makes this unreachable in practice.
        let record = error_record(&item.url, ErrorPhase::Fetch, codes::HTTP_PROTOCOL, "unparseable URL");
        return write_error_or_fatal(&ctx, item, record).await;
    };

    // Robots gate.
    if ctx.cfg.robots.respect {
        let verdict = ctx.robots.should_fetch(&url).await;
        if !verdict.allow {
            let message = match verdict.matched_rule {
                Some(rule) => format!("blocked by robots.txt rule: Disallow: {rule}"),
                None => "blocked by robots.txt".to_string(),
            };
            let record =
                error_record(&item.url, ErrorPhase::Fetch, codes::ROBOTS_BLOCKED, &message);
            return write_error_or_fatal(&ctx, item, record).await;
        }
    }

    // Fetch.
    let fetch = match ctx.fetcher.fetch_url(&item.url).await {
        Ok(fetch) => fetch,
        Err(e) => {
            let code = classify_fetch_error(&e);
            let record = error_record(&item.url, ErrorPhase::Fetch, code, &format!("{e:#}"));
            return write_error_or_fatal(&ctx, item, record).await;
        }
    };
    ctx.metrics
        .bytes_fetched
        .fetch_add(fetch.body.len() as u64, std::sync::atomic::Ordering::Relaxed);
    ctx.bus.publish(CrawlEvent::PageFetched {
        url: item.url.clone(),
        status_code: fetch.status_code,
        fetch_ms: fetch.fetch_ms,
    });

    // Render; a crashed browser gets one retry on a fresh context.
    let render = match ctx.renderer.render_page(&fetch.final_url, &fetch).await {
        Ok(render) => render,
        Err(first_err) => {
            let code = classify_render_error(&first_err);
            if code != codes::BROWSER_CRASHED {
                let record =
                    error_record(&item.url, ErrorPhase::Render, code, &format!("{first_err:#}"));
                return write_error_or_fatal(&ctx, item, record).await;
            }
            warn!("browser crashed on {}, recycling context and retrying", item.url);
            if let Err(e) = ctx.renderer.force_context_recycle().await {
                return TaskOutput::fatal(item, FatalError::Renderer(format!("{e:#}")));
            }
            match ctx.renderer.render_page(&fetch.final_url, &fetch).await {
                Ok(render) => render,
                Err(second_err) => {
                    let code = classify_render_error(&second_err);
                    if code == codes::BROWSER_CRASHED {
                        return TaskOutput::fatal(
                            item,
                            FatalError::Renderer(format!("{second_err:#}")),
                        );
                    }
                    let record = error_record(
                        &item.url,
                        ErrorPhase::Render,
                        code,
                        &format!("{second_err:#}"),
                    );
                    return write_error_or_fatal(&ctx, item, record).await;
                }
            }
        }
    };

    // An unresolved challenge produces an error record, never a page.
    if render.challenge_detected {
        let record = error_record(
            &item.url,
            ErrorPhase::Render,
            codes::CHALLENGE_DETECTED,
            "bot-mitigation challenge did not clear within the wait budget",
        );
        return write_error_or_fatal(&ctx, item, record).await;
    }

    // Extract over the effective DOM.
    let extract_started = Instant::now();
    let base = Url::parse(&fetch.final_url).unwrap_or_else(|_| url.clone());
    let input = ExtractionInput {
        dom: &render.dom,
        base: &base,
        page_url: &item.url,
        mode: render.mode_used,
        robots_header: fetch.robots_header.as_deref(),
        headers: &fetch.headers,
        accessibility_enabled: ctx.cfg.accessibility.enabled,
        computed_styles: &render.computed_styles,
    };
    let extracted = run_extractors(&input);
    let extract_ms = extract_started.elapsed().as_millis() as u64;

    // Discovery candidates, before records move out of `extracted`.
    let mut discovered = Vec::new();
    for edge in &extracted.edges {
        if edge.external && !ctx.cfg.discovery.follow_external {
            continue;
        }
        if let Some(candidate) = prepare_candidate(
            &edge.target_url,
            &ctx.cfg,
            &ctx.block_list,
            &ctx.seen_params,
            edge.external,
        ) {
            discovered.push(candidate);
        }
    }

    let internal_links = extracted.edges.iter().filter(|e| !e.external).count() as u32;
    let external_links = extracted.edges.len() as u32 - internal_links;

    // Media sidecars before the page record so their paths can be embedded.
    let write_started = Instant::now();
    let mut screenshot_paths = None;
    if let Some(shots) = &render.screenshots {
        let mut paths = ScreenshotPaths {
            desktop: None,
            mobile: None,
        };
        if let Some(bytes) = &shots.desktop {
            match ctx.writer.write_screenshot(&item.key, Viewport::Desktop, bytes).await {
                Ok(rel) => paths.desktop = Some(rel),
                Err(e) => return TaskOutput::fatal(item, FatalError::Write(format!("{e:#}"))),
            }
        }
        if let Some(bytes) = &shots.mobile {
            match ctx.writer.write_screenshot(&item.key, Viewport::Mobile, bytes).await {
                Ok(rel) => paths.mobile = Some(rel),
                Err(e) => return TaskOutput::fatal(item, FatalError::Write(format!("{e:#}"))),
            }
        }
        screenshot_paths = Some(paths);
    }

    if ctx.cfg.media.favicons.enabled {
        if let Err(e) = capture_favicon(&ctx, &base, extracted.facts.favicon_url.as_deref()).await
        {
            debug!("favicon capture failed for {}: {e:#}", item.url);
        }
    }

    let security_headers = security_headers_from(&fetch.headers);
    let page = PageRecord {
        url_key: item.key.clone(),
        url: item.url.clone(),
        normalized_url: item.normalized.clone(),
        final_url: fetch.final_url.clone(),
        status_code: fetch.status_code,
        content_type: fetch.content_type.clone(),
        fetched_at: Utc::now(),
        render_mode: render.mode_used,
        nav_end_reason: render.nav_end_reason,
        raw_html_hash: fetch.raw_html_hash.clone(),
        dom_hash: render.dom_hash.clone(),
        redirect_chain: fetch.redirect_chain.clone(),
        title: extracted.facts.title.clone(),
        meta_description: extracted.facts.meta_description.clone(),
        h1: extracted.facts.h1.clone(),
        headings: extracted.facts.headings.clone(),
        canonical: extracted.facts.canonical.clone(),
        meta_robots: extracted.facts.meta_robots.clone(),
        robots_header: extracted.facts.robots_header.clone(),
        noindex_surface: extracted.facts.noindex_surface,
        hreflang: extracted.facts.hreflang.clone(),
        language: extracted.facts.language.clone(),
        favicon_url: extracted.facts.favicon_url.clone(),
        text_sample: extracted.facts.text_sample.clone(),
        internal_links_count: internal_links,
        external_links_count: external_links,
        media_count: extracted.facts.media_count,
        missing_alt_count: extracted.facts.missing_alt_count,
        media_assets_count: extracted.assets.len() as u32,
        media_assets_truncated: extracted.assets_truncated,
        section: section_of(&base),
        discovered_from: item.discovered_from.clone(),
        depth: item.depth,
        fetch_ms: fetch.fetch_ms,
        render_ms: render.render_ms,
        security_headers,
        performance: render.performance.clone(),
        screenshot_paths,
        structured_data: (!extracted.structured_data.is_empty())
            .then(|| extracted.structured_data.clone()),
        tech_stack: (!extracted.tech_stack.is_empty()).then(|| extracted.tech_stack.clone()),
        challenge_captured: render.challenge_cleared.then_some(false),
    };

    // Strict per-task write order: page, edges, assets, accessibility,
    // then full-mode records.
    if let Err(e) = ctx.writer.write_page(&page).await {
        return TaskOutput::fatal(item, FatalError::Write(format!("{e:#}")));
    }
    if let Err(e) = ctx.writer.write_edges(&extracted.edges).await {
        return TaskOutput::fatal(item, FatalError::Write(format!("{e:#}")));
    }
    if let Err(e) = ctx.writer.write_assets(&extracted.assets).await {
        return TaskOutput::fatal(item, FatalError::Write(format!("{e:#}")));
    }
    if let Some(accessibility) = &extracted.accessibility {
        if let Err(e) = ctx.writer.write_accessibility(accessibility).await {
            return TaskOutput::fatal(item, FatalError::Write(format!("{e:#}")));
        }
    }
    if render.mode_used == RenderMode::Full {
        let console: Vec<ConsoleRecord> = render
            .console
            .iter()
            .map(|(level, text)| ConsoleRecord {
                page_url: item.url.clone(),
                level: level.clone(),
                text: text.clone(),
                occurred_at: Utc::now(),
            })
            .collect();
        if let Err(e) = ctx.writer.write_console(&console).await {
            return TaskOutput::fatal(item, FatalError::Write(format!("{e:#}")));
        }
        let styles: Vec<ComputedTextNodeRecord> = render
            .computed_styles
            .iter()
            .map(|s| ComputedTextNodeRecord {
                page_url: item.url.clone(),
                selector: s.selector.clone(),
                text: s.text.clone(),
                font_size: s.font_size,
                font_weight: s.font_weight,
                color: s.color.clone(),
                background_color: s.background_color.clone(),
                line_height: s.line_height.clone(),
            })
            .collect();
        if let Err(e) = ctx.writer.write_styles(&styles).await {
            return TaskOutput::fatal(item, FatalError::Write(format!("{e:#}")));
        }
    }
    let write_ms = write_started.elapsed().as_millis() as u64;

    ctx.metrics.record_page(
        fetch.status_code,
        render.mode_used,
        item.depth,
        fetch.fetch_ms,
        render.render_ms,
        extract_ms,
        write_ms,
    );
    ctx.bus.publish(CrawlEvent::PageParsed {
        url: item.url.clone(),
        url_key: item.key.clone(),
        depth: item.depth,
        edges: extracted.edges.len(),
        assets: extracted.assets.len(),
        render_ms: render.render_ms,
    });

    TaskOutput {
        item,
        page_written: true,
        error_written: false,
        fatal: None,
        discovered,
    }
}

async fn write_error_or_fatal(
    ctx: &TaskContext,
    item: QueueItem,
    record: ErrorRecord,
) -> TaskOutput {
    ctx.metrics.record_error();
    ctx.bus.publish(CrawlEvent::ErrorOccurred {
        record: record.clone(),
    });
    match ctx.writer.write_error(&record).await {
        Ok(()) => TaskOutput::failed(item),
        Err(e) => TaskOutput::fatal(item, FatalError::Write(format!("{e:#}"))),
    }
}

fn error_record(url: &str, phase: ErrorPhase, code: &str, message: &str) -> ErrorRecord {
    let parsed = Url::parse(url).ok();
    ErrorRecord {
        url: url.to_string(),
        origin: parsed.as_ref().map(origin_of).unwrap_or_default(),
        host: parsed
            .as_ref()
            .and_then(|u| u.host_str())
            .unwrap_or_default()
            .to_string(),
        occurred_at: Utc::now(),
        phase,
        code: code.to_string(),
        message: message.to_string(),
    }
}

fn security_headers_from(
    headers: &std::collections::BTreeMap<String, String>,
) -> Option<SecurityHeaders> {
    let sec = SecurityHeaders {
        content_security_policy: headers.get("content-security-policy").cloned(),
        strict_transport_security: headers.get("strict-transport-security").cloned(),
        x_frame_options: headers.get("x-frame-options").cloned(),
        referrer_policy: headers.get("referrer-policy").cloned(),
        permissions_policy: headers.get("permissions-policy").cloned(),
    };
    let any = sec.content_security_policy.is_some()
        || sec.strict_transport_security.is_some()
        || sec.x_frame_options.is_some()
        || sec.referrer_policy.is_some()
        || sec.permissions_policy.is_some();
    any.then_some(sec)
}

async fn capture_favicon(
    ctx: &TaskContext,
    base: &Url,
    favicon_url: Option<&str>,
) -> anyhow::Result<()> {
    let Some(favicon_url) = favicon_url else {
        return Ok(());
    };
    let origin = origin_of(base);
    let key = origin_key(&origin);
    if ctx.writer.has_favicon(&key) {
        return Ok(());
    }
    let fetched = ctx.fetcher.fetch_url(favicon_url).await?;
    if fetched.status_code != 200 || fetched.body.is_empty() {
        return Ok(());
    }
    let ext = match fetched.content_type.as_deref() {
        Some("image/png") => "png",
        Some("image/svg+xml") => "svg",
        Some("image/gif") => "gif",
        Some("image/jpeg") => "jpg",
        Some("image/x-icon") | Some("image/vnd.microsoft.icon") => "ico",
        _ => favicon_url.rsplit('.').next().unwrap_or("ico"),
    };
    ctx.writer.write_favicon(&key, ext, &fetched.body).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url_norm::ParamPolicy;

    fn cfg_with_policy(policy: ParamPolicy) -> CrawlConfig {
        CrawlConfig::builder()
            .seeds(["https://a.test/"])
            .out_atls("/tmp/x.atls")
            .param_policy(policy)
            .block_list(["utm_*"])
            .build()
            .unwrap()
    }

    #[test]
    fn candidate_preparation_applies_block_list() {
        let cfg = cfg_with_policy(ParamPolicy::Keep);
        let block = ParamBlockList::compile(&cfg.discovery.block_list).unwrap();
        let seen = SeenParams::new();
        let candidate =
            prepare_candidate("https://a.test/item?id=1&utm_source=x", &cfg, &block, &seen, false)
                .unwrap();
        assert_eq!(candidate.url, "https://a.test/item?id=1");
        assert_eq!(candidate.host, "a.test");
        assert_eq!(candidate.key.len(), 40);
    }

    #[test]
    fn candidate_preparation_rejects_garbage() {
        let cfg = cfg_with_policy(ParamPolicy::Keep);
        let block = ParamBlockList::compile(&cfg.discovery.block_list).unwrap();
        let seen = SeenParams::new();
        assert!(prepare_candidate("not-a-url", &cfg, &block, &seen, false).is_none());
    }

    #[test]
    fn error_record_carries_origin_and_host() {
        let record = error_record(
            "https://sub.a.test:8443/x",
            ErrorPhase::Fetch,
            codes::DNS_FAILURE,
            "boom",
        );
        assert_eq!(record.origin, "https://sub.a.test:8443");
        assert_eq!(record.host, "sub.a.test");
        assert_eq!(record.code, "DNS_FAILURE");
    }

    #[test]
    fn security_headers_require_at_least_one() {
        let empty = std::collections::BTreeMap::new();
        assert!(security_headers_from(&empty).is_none());
        let mut headers = std::collections::BTreeMap::new();
        headers.insert("x-frame-options".to_string(), "DENY".to_string());
        let sec = security_headers_from(&headers).unwrap();
        assert_eq!(sec.x_frame_options.as_deref(), Some("DENY"));
    }
}
