//! Admission Control
//!
//! Token bucket rate limiting for inbound routes and outbound upstream calls.
//!
//! Features:
//! - Lazy refill computed from elapsed time at call time (no background timers)
//! - Refill and decrement performed under one lock
//! - Blocking acquisition for pacing calls against a rate-limited upstream
//! - Per-caller buckets with quota headers for inbound HTTP protection
//!
//! Time comes from `tokio::time::Instant`, so tests can pause and advance it.

use crate::errors::{retry_after_secs, ApiError};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Shortest sleep between blocking acquisition attempts
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Absorbs float error so a bucket refilled for exactly one interval grants one token
const EPSILON: f64 = 1e-9;

/// Longest refill interval; keeps near-zero rates from overflowing `Duration`
const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Tracked callers before idle buckets are pruned
const PRUNE_THRESHOLD: usize = 4096;

/// Default window for inbound limits (15 minutes)
const DEFAULT_WINDOW_SECS: u64 = 15 * 60;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    /// When the bucket last started draining from full
    window_start: Instant,
}

/// Result of a single acquisition attempt
#[derive(Debug, Clone, Copy)]
pub struct Acquisition {
    pub granted: bool,
    /// Tokens left after this attempt
    pub tokens: f64,
    pub window_start: Instant,
    /// Time until one token is available (zero when one already is)
    pub next_token_in: Duration,
    /// Time until the bucket is full again
    pub full_in: Duration,
}

/// Token bucket with lazy refill
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    /// Time to refill one token
    interval: Duration,
    state: Mutex<BucketState>,
    reset_notify: Notify,
    waiters: AtomicUsize,
}

impl TokenBucket {
    /// Bucket holding `capacity` tokens, refilled at `refill_per_sec`
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let rate = if refill_per_sec.is_finite() && refill_per_sec > 0.0 {
            refill_per_sec
        } else {
            warn!(refill_per_sec, "Invalid refill rate, falling back to 1/s");
            1.0
        };
        let interval = Duration::try_from_secs_f64(1.0 / rate).unwrap_or(MAX_INTERVAL);
        Self::with_interval(capacity, interval)
    }

    /// Bucket allowing `max` units per `window`, refilled continuously
    pub fn per_window(max: u32, window: Duration) -> Self {
        Self::with_interval(max, window / max.max(1))
    }

    /// Bucket allowing `n` units per second, e.g. upstream API pacing
    pub fn per_second(n: u32) -> Self {
        Self::per_window(n, Duration::from_secs(1))
    }

    fn with_interval(capacity: u32, interval: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        let now = Instant::now();
        Self {
            capacity,
            interval: interval.clamp(Duration::from_nanos(1), MAX_INTERVAL),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
                window_start: now,
            }),
            reset_notify: Notify::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    pub fn refill_per_sec(&self) -> f64 {
        1.0 / self.interval.as_secs_f64()
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        let added = elapsed.as_secs_f64() / self.interval.as_secs_f64();
        state.tokens = (state.tokens + added).min(self.capacity);
        state.last_refill = now;
    }

    fn time_for(&self, tokens: f64) -> Duration {
        if tokens <= 0.0 {
            Duration::ZERO
        } else {
            self.interval.mul_f64(tokens)
        }
    }

    /// Refill, then take one token if available
    pub fn acquire(&self) -> Acquisition {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        let granted = state.tokens + EPSILON >= 1.0;
        if granted {
            if state.tokens + EPSILON >= self.capacity {
                state.window_start = now;
            }
            state.tokens = (state.tokens - 1.0).max(0.0);
        }

        Acquisition {
            granted,
            tokens: state.tokens,
            window_start: state.window_start,
            next_token_in: self.time_for(1.0 - state.tokens),
            full_in: self.time_for(self.capacity - state.tokens),
        }
    }

    /// Take one token if available
    pub fn try_acquire(&self) -> bool {
        self.acquire().granted
    }

    /// Take one token, sleeping until one is available
    pub async fn acquire_blocking(&self) {
        let _waiting = WaiterGuard::enter(&self.waiters);
        loop {
            let notified = self.reset_notify.notified();
            let attempt = self.acquire();
            if attempt.granted {
                break;
            }

            let wait = attempt.next_token_in.max(MIN_WAIT);
            debug!(wait_ms = wait.as_millis() as u64, "Waiting for token");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = notified => {}
            }
        }
    }

    /// Run `f` once a token is available
    pub async fn execute<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire_blocking().await;
        f().await
    }

    /// Current token count after refill
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Callers currently suspended in `acquire_blocking`
    pub fn waiting(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Refill to capacity and wake all waiters
    pub fn reset(&self) {
        {
            let now = Instant::now();
            let mut state = self.state.lock();
            state.tokens = self.capacity;
            state.last_refill = now;
            state.window_start = now;
        }
        self.reset_notify.notify_waiters();
    }

    fn is_full(&self) -> bool {
        self.available() + EPSILON >= self.capacity
    }
}

/// Counts a suspended caller, including one whose future is dropped mid-wait
struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Inbound rate limit configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window
    pub max_requests: u32,
    /// Time window
    pub window: Duration,
    /// Admit everything (development only)
    pub skip: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::general()
    }
}

impl RateLimitConfig {
    /// General API traffic: 100 requests per 15 minutes
    pub fn general() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            skip: false,
        }
    }

    /// Credential retrieval: 10 requests per 15 minutes
    pub fn auto_credentials() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            skip: false,
        }
    }

    pub fn skipped(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }
}

/// Admission decision for one inbound request
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub window_start: Instant,
    /// Time until the caller's quota is fully restored
    pub reset_after: Duration,
    /// Set on denial: time until the next request would be admitted
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// Seconds until the quota is full again, rounded up
    pub fn reset_secs(&self) -> u64 {
        if self.reset_after.is_zero() {
            0
        } else {
            retry_after_secs(self.reset_after)
        }
    }

    /// Write `RateLimit-*` headers. A response that already carries them
    /// (from a route-level limiter nested inside) keeps the inner quota.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        if headers.contains_key("ratelimit-limit") {
            return;
        }

        let values = [
            ("ratelimit-limit", self.limit.to_string()),
            ("ratelimit-remaining", self.remaining.to_string()),
            ("ratelimit-reset", self.reset_secs().to_string()),
        ];
        for (name, value) in values {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }
    }
}

/// Per-caller token buckets for one protected route
pub struct CallerLimiter {
    name: String,
    config: RateLimitConfig,
    trust_proxy: bool,
    callers: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl CallerLimiter {
    pub fn new(name: &str, config: RateLimitConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            trust_proxy: false,
            callers: Mutex::new(HashMap::new()),
        }
    }

    /// Key callers by forwarding headers (only behind a trusted reverse proxy)
    pub fn trusting_proxy(mut self, trust_proxy: bool) -> Self {
        self.trust_proxy = trust_proxy;
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Caller identity for `req` under this limiter's proxy policy
    pub fn caller_key(&self, req: &Request) -> String {
        client_key(req, self.trust_proxy)
    }

    fn bucket_for(&self, caller: &str) -> Arc<TokenBucket> {
        let mut callers = self.callers.lock();

        if callers.len() >= PRUNE_THRESHOLD && !callers.contains_key(caller) {
            let before = callers.len();
            callers.retain(|_, bucket| !bucket.is_full());
            debug!(
                limiter = %self.name,
                pruned = before - callers.len(),
                "Pruned idle rate limit buckets"
            );
        }

        callers
            .entry(caller.to_string())
            .or_insert_with(|| {
                Arc::new(TokenBucket::per_window(
                    self.config.max_requests,
                    self.config.window,
                ))
            })
            .clone()
    }

    /// Admit or reject one request from `caller`
    pub fn check(&self, caller: &str) -> RateLimitDecision {
        let limit = self.config.max_requests;

        if self.config.skip {
            return RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit,
                window_start: Instant::now(),
                reset_after: Duration::ZERO,
                retry_after: None,
            };
        }

        let attempt = self.bucket_for(caller).acquire();
        let decision = RateLimitDecision {
            allowed: attempt.granted,
            limit,
            remaining: (attempt.tokens + EPSILON).floor() as u32,
            window_start: attempt.window_start,
            reset_after: attempt.full_in,
            retry_after: (!attempt.granted).then_some(attempt.next_token_in),
        };

        if decision.allowed {
            debug!(limiter = %self.name, caller, remaining = decision.remaining, "Request admitted");
        } else {
            warn!(
                limiter = %self.name,
                caller,
                retry_after_secs = decision.retry_after.map(retry_after_secs),
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Forget all callers (test isolation)
    pub fn reset(&self) {
        self.callers.lock().clear();
    }

    pub fn stats(&self) -> RateLimitStats {
        let callers = self.callers.lock();
        RateLimitStats {
            name: self.name.clone(),
            tracked_callers: callers.len(),
            limited_callers: callers.values().filter(|b| b.available() + EPSILON < 1.0).count(),
            config: self.config.clone(),
        }
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone)]
pub struct RateLimitStats {
    pub name: String,
    pub tracked_callers: usize,
    pub limited_callers: usize,
    pub config: RateLimitConfig,
}

/// Caller identity resolved by the admission middleware, for handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerKey(pub String);

/// Identify the caller by peer address.
///
/// `X-Forwarded-For` and `X-Real-IP` are client-controlled, so they are only
/// consulted when `trust_proxy` is set.
pub fn client_key(req: &Request, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(ip) = forwarded_for(req.headers()) {
            return ip;
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return Some(ip.to_string());
    }

    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Admission middleware for a route or router
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<CallerLimiter>>,
    mut req: Request,
    next: Next,
) -> Response {
    let caller = limiter.caller_key(&req);
    let decision = limiter.check(&caller);

    if !decision.allowed {
        let mut response = ApiError::RateLimited {
            retry_after: decision.retry_after.unwrap_or(limiter.config.window),
        }
        .into_response();
        decision.apply_headers(response.headers_mut());
        return response;
    }

    req.extensions_mut().insert(CallerKey(caller));
    let mut response = next.run(req).await;
    decision.apply_headers(response.headers_mut());
    response
}
