//! Crawl error taxonomy.
//!
//! Two layers: `CrawlError` is the fatal/engine-level error returned from the
//! public API, while recoverable per-page failures are represented as
//! [`ErrorRecord`](crate::records::ErrorRecord)s written into the archive and
//! counted against the error budget.

use thiserror::Error;

/// Fatal error surfaced by the engine façade.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Configuration was rejected before the crawl started.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A lifecycle call arrived in a state that does not permit it.
    #[error("invalid engine state: {0}")]
    InvalidState(String),

    /// The headless browser could not be launched or crashed unrecoverably.
    #[error("renderer failure: {0}")]
    Renderer(String),

    /// The archive writer hit a non-recoverable I/O failure.
    #[error("archive write failure: {0}")]
    Write(String),

    /// Post-seal validation of the archive failed under strict mode.
    #[error("archive validation failed: {0}")]
    Validation(String),

    /// The configured budget of recoverable errors was exhausted.
    #[error("error budget of {0} recoverable errors exceeded")]
    ErrorBudget(usize),

    /// The crawl was cancelled before completion.
    #[error("crawl cancelled")]
    Cancelled,

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrawlError {
    /// Process exit code for CLI front-ends.
    ///
    /// 0 is success and therefore never produced here; 2 error budget,
    /// 3 renderer fatal, 4 write/IO fatal, 5 archive validation, 10 unknown.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ErrorBudget(_) => 2,
            Self::Renderer(_) => 3,
            Self::Write(_) => 4,
            Self::Validation(_) => 5,
            Self::Config(_) | Self::InvalidState(_) | Self::Cancelled | Self::Other(_) => 10,
        }
    }
}

/// Convenience alias used throughout the crate internals.
pub type CrawlResult<T> = Result<T, CrawlError>;

/// Symbolic codes carried by [`ErrorRecord`](crate::records::ErrorRecord)s.
///
/// Codes are stable strings, not enum variants, because downstream consumers
/// read them out of JSON lines and new codes must not break old readers.
pub mod codes {
    pub const DNS_FAILURE: &str = "DNS_FAILURE";
    pub const TLS_FAILURE: &str = "TLS_FAILURE";
    pub const CONNECT_TIMEOUT: &str = "CONNECT_TIMEOUT";
    pub const CONNECTION_RESET: &str = "CONNECTION_RESET";
    pub const HTTP_PROTOCOL: &str = "HTTP_PROTOCOL";
    pub const BODY_TOO_LARGE: &str = "BODY_TOO_LARGE";
    pub const REDIRECT_LOOP: &str = "REDIRECT_LOOP";
    pub const ROBOTS_BLOCKED: &str = "ROBOTS_BLOCKED";
    pub const NAV_TIMEOUT: &str = "NAV_TIMEOUT";
    pub const REQUEST_CAP_EXCEEDED: &str = "REQUEST_CAP_EXCEEDED";
    pub const BYTE_CAP_EXCEEDED: &str = "BYTE_CAP_EXCEEDED";
    pub const BROWSER_CRASHED: &str = "BROWSER_CRASHED";
    pub const CHALLENGE_DETECTED: &str = "CHALLENGE_DETECTED";
    pub const WRITE_FAILED: &str = "WRITE_FAILED";
}

/// Classify a fetch-layer error into a symbolic code.
///
/// Pattern matching over the error chain text mirrors how reqwest surfaces
/// connection-level failures; the mapping is best-effort and falls back to
/// `HTTP_PROTOCOL`.
#[must_use]
pub fn classify_fetch_error(err: &anyhow::Error) -> &'static str {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("dns") || msg.contains("name or service not known") {
        codes::DNS_FAILURE
    } else if msg.contains("tls") || msg.contains("certificate") || msg.contains("handshake") {
        codes::TLS_FAILURE
    } else if msg.contains("timed out") || msg.contains("timeout") {
        codes::CONNECT_TIMEOUT
    } else if msg.contains("reset") || msg.contains("broken pipe") || msg.contains("aborted") {
        codes::CONNECTION_RESET
    } else if msg.contains("redirect") {
        codes::REDIRECT_LOOP
    } else if msg.contains("body too large") {
        codes::BODY_TOO_LARGE
    } else {
        codes::HTTP_PROTOCOL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(CrawlError::ErrorBudget(5).exit_code(), 2);
        assert_eq!(CrawlError::Renderer("boom".into()).exit_code(), 3);
        assert_eq!(CrawlError::Write("disk full".into()).exit_code(), 4);
        assert_eq!(CrawlError::Validation("bad record".into()).exit_code(), 5);
        assert_eq!(CrawlError::Cancelled.exit_code(), 10);
    }

    #[test]
    fn fetch_error_classification() {
        let err = anyhow::anyhow!("dns error: name or service not known");
        assert_eq!(classify_fetch_error(&err), codes::DNS_FAILURE);
        let err = anyhow::anyhow!("error trying to connect: operation timed out");
        assert_eq!(classify_fetch_error(&err), codes::CONNECT_TIMEOUT);
        let err = anyhow::anyhow!("connection reset by peer");
        assert_eq!(classify_fetch_error(&err), codes::CONNECTION_RESET);
        let err = anyhow::anyhow!("some opaque failure");
        assert_eq!(classify_fetch_error(&err), codes::HTTP_PROTOCOL);
    }
}
