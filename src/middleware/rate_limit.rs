//! Fixed-window rate limiting per client key.
//!
//! Each key gets `max_requests` per `window`. The window starts at the
//! key's first request and restarts on the first request after it ends.
//! Buckets live in a `DashMap`, so concurrent requests from one key
//! serialise on that key's shard only.

use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::header::{HeaderName, HeaderValue, RETRY_AFTER};

use super::{Flow, Stage};
use crate::config::RateLimitConfig;
use crate::error::ApiError;
use crate::handler::BoxFuture;
use crate::request::Request;
use crate::response::IntoResponse;

const LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

#[derive(Debug)]
struct Bucket {
    count: u32,
    window_start: Instant,
}

#[derive(Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

/// Counter store behind the [`RateLimit`] stage.
pub struct RateLimiter<K = IpAddr> {
    max_requests: u32,
    window: Duration,
    buckets: DashMap<K, Bucket>,
}

impl<K: Eq + Hash> RateLimiter<K> {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self { max_requests, window, buckets: DashMap::new() }
    }

    pub fn max_requests(&self) -> u32 { self.max_requests }
    pub fn window(&self) -> Duration { self.window }

    pub fn check(&self, key: K) -> Decision {
        self.check_at(key, Instant::now())
    }

    /// [`check`](Self::check) against an explicit clock reading.
    pub fn check_at(&self, key: K, now: Instant) -> Decision {
        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| Bucket { count: 0, window_start: now });

        if now.saturating_duration_since(bucket.window_start) >= self.window {
            bucket.count = 0;
            bucket.window_start = now;
        }
        bucket.count = bucket.count.saturating_add(1);

        if bucket.count > self.max_requests {
            let elapsed = now.saturating_duration_since(bucket.window_start);
            Decision::Denied { retry_after: self.window.saturating_sub(elapsed) }
        } else {
            Decision::Allowed { remaining: self.max_requests - bucket.count }
        }
    }

    /// Drops buckets whose window has ended. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.window_start) < self.window);
        before.saturating_sub(self.buckets.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

/// The rate-limit stage: keys requests by client IP.
pub struct RateLimit {
    limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
}

impl RateLimit {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::new(config.max_requests, config.window)),
            trust_forwarded_for: config.trust_forwarded_for,
        }
    }

    /// Shared handle to the counters, for the periodic sweep.
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }
}

impl Stage for RateLimit {
    fn name(&self) -> &'static str { "rate_limit" }

    fn call<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, Flow> {
        let ip = client_ip(req, self.trust_forwarded_for);
        req.defer_header(LIMIT, HeaderValue::from(self.limiter.max_requests()));

        let flow = match self.limiter.check(ip) {
            Decision::Allowed { remaining } => {
                req.defer_header(REMAINING, HeaderValue::from(remaining));
                Flow::Continue
            }
            Decision::Denied { retry_after } => {
                tracing::warn!(%ip, path = req.path(), "rate limit exceeded");
                req.defer_header(REMAINING, HeaderValue::from(0u32));
                let mut res = ApiError::RateLimitExceeded.into_response();
                res.headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(ceil_secs(retry_after)));
                Flow::Terminate(res)
            }
        };
        Box::pin(std::future::ready(flow))
    }
}

fn ceil_secs(d: Duration) -> u64 {
    (d.as_secs() + u64::from(d.subsec_nanos() > 0)).max(1)
}

/// The address a request is attributed to.
///
/// The peer address, unless `trust_forwarded_for` is set and the request
/// carries a parseable `X-Forwarded-For` (leftmost entry) or `X-Real-IP`.
pub fn client_ip(req: &Request, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = req
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .or_else(|| req.header("x-real-ip"))
            .and_then(|v| v.trim().parse().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    req.remote_addr().ip()
}
