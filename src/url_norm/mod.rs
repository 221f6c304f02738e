//! URL normalization, dedup keys and the query parameter policy.
//!
//! Normalization is the foundation of the visited set: two URLs are the same
//! page iff their normalized forms hash to the same key. The stored
//! normalized URL preserves path case; only the key computation lowercases
//! the whole string, so pages differing only in path case stay
//! distinguishable in output while sharing one dedup key.

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use url::Url;

/// Query parameter handling across the crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamPolicy {
    /// Keep every retained parameter.
    Keep,
    /// Remove all parameters.
    Strip,
    /// Keep a (path, name, value) combination the first time it is seen,
    /// drop later re-occurrences arriving with different companions. This
    /// collapses query-param crawl explosions without conflating URLs that
    /// genuinely differ in parameter values.
    Sample,
}

impl ParamPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::Strip => "strip",
            Self::Sample => "sample",
        }
    }
}

/// Wildcard parameter kill list (`utm_*`, `fbclid`, ...), compiled once.
#[derive(Debug, Default)]
pub struct ParamBlockList {
    patterns: Vec<Regex>,
}

impl ParamBlockList {
    /// Compile glob patterns; `*` matches any sequence. Invalid patterns are
    /// rejected so configuration errors surface at build time, not mid-crawl.
    pub fn compile(patterns: &[String]) -> anyhow::Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let escaped = regex::escape(p).replace(r"\*", ".*");
                Regex::new(&format!("^{escaped}$"))
                    .map_err(|e| anyhow::anyhow!("invalid block pattern '{p}': {e}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    #[must_use]
    pub fn is_blocked(&self, param_name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(param_name))
    }
}

/// Per-crawl state backing the `sample` policy.
///
/// Maps (path, name, value) to the canonical form of the first URL that
/// carried it, so re-applying the policy to an already-sampled URL is a
/// no-op while later arrivals with different companions lose the pair.
#[derive(Debug, Default)]
pub struct SeenParams {
    claims: DashMap<(String, String, String), String>,
}

impl SeenParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

/// Canonicalize: strip fragment, lowercase host, drop default port, sort
/// retained query pairs alphabetically by key (stable within a key).
///
/// Returns `None` for unparseable input or non-http(s) schemes; callers
/// skip, never crash.
#[must_use]
pub fn normalize(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    sort_query_pairs(&mut url);
    Some(url.to_string())
}

/// 160-bit dedup key: SHA-1 over the fully-lowercased normalized URL.
#[must_use]
pub fn url_key(normalized: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(normalized.to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

/// Key used to name per-origin media files (favicons).
#[must_use]
pub fn origin_key(origin: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(origin.to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

/// scheme + host + port with default ports omitted.
#[must_use]
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

#[must_use]
pub fn is_same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

/// Leading path segment as `/segment/`, or `/` for the root.
#[must_use]
pub fn section_of(url: &Url) -> String {
    match url.path_segments().and_then(|mut s| s.next()) {
        Some(seg) if !seg.is_empty() => format!("/{seg}/"),
        _ => "/".to_string(),
    }
}

/// Resolve a relative reference against a base, admitting only http(s).
///
/// `javascript:`, `mailto:`, `data:` and malformed references all come back
/// as `None`.
#[must_use]
pub fn safe_join(base: &Url, relative: &str) -> Option<Url> {
    let relative = relative.trim();
    if relative.is_empty() {
        return None;
    }
    let joined = base.join(relative).ok()?;
    matches!(joined.scheme(), "http" | "https").then_some(joined)
}

/// Apply the wildcard block list and the configured parameter policy.
///
/// Block patterns always apply first. The returned URL has its remaining
/// query pairs sorted, so the result composes directly with [`normalize`].
#[must_use]
pub fn apply_param_policy(
    url: &Url,
    policy: ParamPolicy,
    block: &ParamBlockList,
    seen: &SeenParams,
) -> Url {
    let mut out = url.clone();
    out.set_fragment(None);

    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !block.is_blocked(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let kept: Vec<(String, String)> = match policy {
        ParamPolicy::Keep => retained,
        ParamPolicy::Strip => Vec::new(),
        ParamPolicy::Sample => {
            let canon = canonical_with_pairs(url, &retained);
            retained
                .into_iter()
                .filter(|(k, v)| {
                    let claim = self_or_claimant(seen, url.path(), k, v, &canon);
                    claim == canon
                })
                .collect()
        }
    };

    set_query_pairs(&mut out, kept);
    sort_query_pairs(&mut out);
    out
}

/// Look up or record the claimant for one (path, name, value) triple.
fn self_or_claimant(
    seen: &SeenParams,
    path: &str,
    name: &str,
    value: &str,
    canon: &str,
) -> String {
    seen.claims
        .entry((path.to_string(), name.to_string(), value.to_string()))
        .or_insert_with(|| canon.to_string())
        .clone()
}

/// Canonical pre-sample form: the URL with exactly `pairs` as its sorted
/// query. Used as the claim identity so policy application is idempotent.
fn canonical_with_pairs(url: &Url, pairs: &[(String, String)]) -> String {
    let mut canon = url.clone();
    canon.set_fragment(None);
    set_query_pairs(&mut canon, pairs.to_vec());
    sort_query_pairs(&mut canon);
    canon.to_string()
}

fn set_query_pairs(url: &mut Url, pairs: Vec<(String, String)>) {
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
}

fn sort_query_pairs(url: &mut Url) {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
        return;
    }
    // Stable: values keep their relative order within one key.
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    url.query_pairs_mut().clear().extend_pairs(pairs);
}
