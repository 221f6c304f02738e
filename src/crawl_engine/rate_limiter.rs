//! Per-host token buckets and the global rate gate.
//!
//! Each host starts with `burst` tokens and refills at `per_host_rps`
//! tokens per second, capped at `burst`. `try_consume` never blocks; the
//! scheduler polls hosts round-robin and treats an empty bucket as
//! backpressure. A separate serial gate keeps the sum across hosts under
//! the global RPS ceiling.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Fixed-point scale: one request costs 1000 token units.
const TOKEN_SCALE: u64 = 1000;

#[derive(Debug)]
struct Bucket {
    /// Scaled token count.
    tokens: u64,
    last_refill: Instant,
}

/// Non-blocking per-host rate limiter.
pub struct HostTokenBuckets {
    buckets: DashMap<String, Mutex<Bucket>>,
    /// Scaled tokens added per second.
    refill_per_sec: u64,
    /// Scaled cap.
    max_tokens: u64,
}

impl HostTokenBuckets {
    #[must_use]
    pub fn new(per_host_rps: f64, burst: f64) -> Self {
        let per_host_rps = per_host_rps.max(0.001);
        let burst = burst.max(1.0);
        Self {
            buckets: DashMap::new(),
            refill_per_sec: (per_host_rps * TOKEN_SCALE as f64) as u64,
            max_tokens: (burst * TOKEN_SCALE as f64) as u64,
        }
    }

    /// Take one token for `host` if available. Never blocks.
    pub fn try_consume(&self, host: &str, now: Instant) -> bool {
        let entry = self
            .buckets
            .entry(host.to_string())
            .or_insert_with(|| Mutex::new(self.new_bucket(now)));
        let mut bucket = entry.lock();
        self.refill(&mut bucket, now);
        if bucket.tokens >= TOKEN_SCALE {
            bucket.tokens -= TOKEN_SCALE;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available for `host`.
    pub fn tokens(&self, host: &str, now: Instant) -> f64 {
        match self.buckets.get(host) {
            Some(entry) => {
                let mut bucket = entry.lock();
                self.refill(&mut bucket, now);
                bucket.tokens as f64 / TOKEN_SCALE as f64
            }
            // An unseen host has a full bucket.
            None => self.max_tokens as f64 / TOKEN_SCALE as f64,
        }
    }

    fn new_bucket(&self, now: Instant) -> Bucket {
        Bucket {
            tokens: self.max_tokens,
            last_refill: now,
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let added = (elapsed.as_secs_f64() * self.refill_per_sec as f64) as u64;
        if added > 0 {
            bucket.tokens = bucket.tokens.saturating_add(added).min(self.max_tokens);
            bucket.last_refill = now;
        }
    }
}

/// Serial limiter enforcing the global requests-per-second ceiling.
///
/// One permit per `1/rps` seconds regardless of host; checked after the
/// per-host bucket so a starved host cannot hoard the global budget.
pub struct GlobalRateGate {
    min_interval: Duration,
    last_pass: Mutex<Option<Instant>>,
}

impl GlobalRateGate {
    #[must_use]
    pub fn new(rps: f64) -> Self {
        let rps = rps.max(0.001);
        Self {
            min_interval: Duration::from_secs_f64(1.0 / rps),
            last_pass: Mutex::new(None),
        }
    }

    /// Non-blocking: true when the global budget admits one more request.
    pub fn try_pass(&self, now: Instant) -> bool {
        let mut last = self.last_pass.lock();
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
