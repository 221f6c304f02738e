//! Plain HTTP retrieval with manual redirect-chain capture.
//!
//! Redirects are disabled at the client so every hop lands here and the
//! full chain is recorded. Bodies stream in chunks against the per-page
//! byte cap rather than buffering unbounded responses.

use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

use crate::config::{HttpConfig, RenderConfig};

/// Everything captured from one fetch, redirects included.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// URL after following redirects.
    pub final_url: String,
    pub status_code: u16,
    pub content_type: Option<String>,
    /// Response headers of the final hop, keys lowercased.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Every pre-final hop in order.
    pub redirect_chain: Vec<String>,
    /// SHA-256 of the raw response body.
    pub raw_html_hash: String,
    /// `X-Robots-Tag` of the final hop, if present.
    pub robots_header: Option<String>,
    pub fetch_ms: u64,
}

pub struct Fetcher {
    client: reqwest::Client,
    max_redirects: usize,
    max_bytes: usize,
}

impl Fetcher {
    pub fn new(http: &HttpConfig, render: &RenderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_millis(render.timeout_ms))
            .user_agent(http.user_agent.clone())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            max_redirects: http.max_redirects,
            max_bytes: render.max_bytes_per_page,
        })
    }

    /// Retrieve `url`, following redirects up to the configured cap.
    pub async fn fetch_url(&self, url: &str) -> Result<FetchResult> {
        let started = Instant::now();
        let mut current = Url::parse(url).with_context(|| format!("invalid URL: {url}"))?;
        let mut chain: Vec<String> = Vec::new();

        loop {
            let resp = self
                .client
                .get(current.clone())
                .send()
                .await
                .with_context(|| format!("request failed: {current}"))?;

            let status = resp.status();
            if status.is_redirection() {
                if chain.len() >= self.max_redirects {
                    bail!("redirect cap of {} exceeded at {current}", self.max_redirects);
                }
                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| anyhow!("redirect without Location header at {current}"))?;
                let next = current
                    .join(location)
                    .with_context(|| format!("unresolvable redirect target: {location}"))?;
                debug!(from = %current, to = %next, status = status.as_u16(), "following redirect");
                chain.push(current.to_string());
                current = next;
                continue;
            }

            let headers: BTreeMap<String, String> = resp
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_lowercase(),
                        String::from_utf8_lossy(v.as_bytes()).to_string(),
                    )
                })
                .collect();
            let content_type = headers
                .get("content-type")
                .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
            let robots_header = headers.get("x-robots-tag").cloned();

            let body = self.read_capped_body(resp).await?;
            let raw_html_hash = hex::encode(Sha256::digest(&body));

            return Ok(FetchResult {
                final_url: current.to_string(),
                status_code: status.as_u16(),
                content_type,
                headers,
                body,
                redirect_chain: chain,
                raw_html_hash,
                robots_header,
                fetch_ms: started.elapsed().as_millis() as u64,
            });
        }
    }

    async fn read_capped_body(&self, resp: reqwest::Response) -> Result<Vec<u8>> {
        let mut body: Vec<u8> = Vec::with_capacity(16 * 1024);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("error reading response body")?;
            if body.len() + chunk.len() > self.max_bytes {
                bail!("response body too large: exceeds {} bytes", self.max_bytes);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}
