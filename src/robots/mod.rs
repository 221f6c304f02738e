//! Per-origin robots.txt fetching, caching and matching.
//!
//! Parsing and path matching (including `*` wildcards and `$` end-of-path
//! anchors) are delegated to `texting_robots`; this module adds the
//! per-origin TTL cache, the override switch, and the allow-on-failure
//! policy for unreachable or malformed robots files.

use crate::url_norm::origin_of;
use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use texting_robots::Robot;
use tracing::{debug, warn};
use url::Url;

const ROBOTS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Outcome of a robots consultation.
#[derive(Debug, Clone)]
pub struct RobotsVerdict {
    pub allow: bool,
    /// On deny, the best-effort Disallow line that matched.
    pub matched_rule: Option<String>,
}

impl RobotsVerdict {
    fn allow_all() -> Self {
        Self {
            allow: true,
            matched_rule: None,
        }
    }
}

struct CachedRobots {
    /// `None` means allow-all (unreachable, empty, or malformed file).
    robot: Option<Robot>,
    /// Raw body retained for matched-rule reporting.
    raw: Option<String>,
    fetched_at: Instant,
}

/// Per-origin robots.txt cache.
pub struct RobotsCache {
    client: reqwest::Client,
    user_agent: String,
    respect: bool,
    ttl: Duration,
    cache: DashMap<String, Arc<CachedRobots>>,
    malformed: DashMap<String, ()>,
}

impl RobotsCache {
    pub fn new(user_agent: &str, respect: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(ROBOTS_FETCH_TIMEOUT)
            .user_agent(user_agent.to_string())
            .build()?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
            respect,
            ttl: DEFAULT_TTL,
            cache: DashMap::new(),
            malformed: DashMap::new(),
        })
    }

    #[cfg(test)]
    fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Decide whether `url` may be fetched.
    ///
    /// With the override active this returns allow without consulting the
    /// cache at all; the manifest records that fact separately.
    pub async fn should_fetch(&self, url: &Url) -> RobotsVerdict {
        if !self.respect {
            return RobotsVerdict::allow_all();
        }

        let origin = origin_of(url);
        let entry = match self.fresh_entry(&origin) {
            Some(e) => e,
            None => self.fetch_and_cache(&origin).await,
        };

        let Some(robot) = entry.robot.as_ref() else {
            return RobotsVerdict::allow_all();
        };

        let path_and_query = match url.query() {
            Some(q) => format!("{}?{q}", url.path()),
            None => url.path().to_string(),
        };
        if robot.allowed(&path_and_query) {
            RobotsVerdict::allow_all()
        } else {
            let matched_rule = entry
                .raw
                .as_deref()
                .and_then(|raw| find_matched_disallow(raw, &self.user_agent, url.path()));
            RobotsVerdict {
                allow: false,
                matched_rule,
            }
        }
    }

    /// Origins whose robots.txt failed to parse; surfaced as manifest notes.
    #[must_use]
    pub fn malformed_origins(&self) -> Vec<String> {
        let mut origins: Vec<String> = self.malformed.iter().map(|e| e.key().clone()).collect();
        origins.sort();
        origins
    }

    fn fresh_entry(&self, origin: &str) -> Option<Arc<CachedRobots>> {
        let entry = self.cache.get(origin)?;
        (entry.fetched_at.elapsed() < self.ttl).then(|| Arc::clone(&entry))
    }

    async fn fetch_and_cache(&self, origin: &str) -> Arc<CachedRobots> {
        let robots_url = format!("{origin}/robots.txt");
        let cached = match self.client.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => match Robot::new(&self.user_agent, body.as_bytes()) {
                    Ok(robot) => CachedRobots {
                        robot: Some(robot),
                        raw: Some(body),
                        fetched_at: Instant::now(),
                    },
                    Err(e) => {
                        warn!(origin, error = %e, "malformed robots.txt, allowing all");
                        self.malformed.insert(origin.to_string(), ());
                        CachedRobots {
                            robot: None,
                            raw: None,
                            fetched_at: Instant::now(),
                        }
                    }
                },
                Err(e) => {
                    debug!(origin, error = %e, "robots.txt body read failed, allowing all");
                    negative_entry()
                }
            },
            Ok(resp) => {
                debug!(origin, status = %resp.status(), "robots.txt not available, allowing all");
                negative_entry()
            }
            Err(e) => {
                debug!(origin, error = %e, "robots.txt fetch failed, allowing all");
                negative_entry()
            }
        };

        let cached = Arc::new(cached);
        self.cache.insert(origin.to_string(), Arc::clone(&cached));
        cached
    }
}

fn negative_entry() -> CachedRobots {
    CachedRobots {
        robot: None,
        raw: None,
        fetched_at: Instant::now(),
    }
}

/// Best-effort: the longest Disallow prefix in the active agent group that
/// matches `path`. The verdict itself always comes from `texting_robots`;
/// this only names the rule for the error record.
fn find_matched_disallow(raw: &str, user_agent: &str, path: &str) -> Option<String> {
    let ua_lower = user_agent.to_lowercase();
    let mut best: Option<String> = None;
    let mut in_matching_group = false;
    let mut in_wildcard_group = false;
    let mut wildcard_best: Option<String> = None;

    for line in raw.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let field = field.trim().to_lowercase();
        let value = value.trim();

        match field.as_str() {
            "user-agent" => {
                let agent = value.to_lowercase();
                in_matching_group = !agent.is_empty() && ua_lower.contains(&agent);
                in_wildcard_group = agent == "*";
            }
            "disallow" if !value.is_empty() => {
                let prefix = value.split(['*', '$']).next().unwrap_or(value);
                if path.starts_with(prefix) {
                    if in_matching_group
                        && best.as_deref().map_or(true, |b| b.len() < value.len())
                    {
                        best = Some(value.to_string());
                    }
                    if in_wildcard_group
                        && wildcard_best.as_deref().map_or(true, |b| b.len() < value.len())
                    {
                        wildcard_best = Some(value.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    best.or(wildcard_best)
}
