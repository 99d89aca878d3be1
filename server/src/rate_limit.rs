//! Per-tracking-id rate limiting for the ingestion endpoint.
//!
//! Tracking identifiers are public (they are embedded in every page that
//! loads the snippet), so each one gets its own token bucket. A bucket holds
//! up to `capacity` tokens, refills at `rate` tokens per second, and every
//! accepted event consumes one token. An empty bucket yields
//! [`RateLimitResult::Limited`], which the route turns into `429` with a
//! `Retry-After` header.
//!
//! ```rust
//! use recovery_server::rate_limit::RateLimiter;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let limiter = RateLimiter::new(5.0, 20);
//! assert!(limiter.check("track_abc").await.is_allowed());
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Sustained events per second per tracking id.
pub const DEFAULT_RATE: f64 = 10.0;

/// Burst size per tracking id.
pub const DEFAULT_CAPACITY: u32 = 50;

/// Buckets idle for this long are dropped by the cleanup task.
pub const STALE_ENTRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    /// Rejected; the caller may retry after `retry_after_secs`.
    Limited { retry_after_secs: u64 },
}

impl RateLimitResult {
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    #[inline]
    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limited { .. })
    }

    #[inline]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Allowed => None,
            Self::Limited { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

/// Token bucket for a single tracking id.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: u32) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: u32) -> RateLimitResult {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(f64::from(capacity));
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateLimitResult::Allowed;
        }

        let seconds_until_token = (1.0 - self.tokens) / rate;
        RateLimitResult::Limited {
            retry_after_secs: (seconds_until_token.ceil() as u64).max(1),
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_refill.elapsed()
    }
}

#[derive(Debug)]
struct RateLimiterInner {
    buckets: HashMap<String, TokenBucket>,
    rate: f64,
    capacity: u32,
}

/// Shared, cloneable per-tracking-id rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<RwLock<RateLimiterInner>>,
}

impl RateLimiter {
    /// Creates a limiter refilling `rate` tokens per second up to `capacity`.
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RateLimiterInner {
                buckets: HashMap::new(),
                rate,
                capacity,
            })),
        }
    }

    /// Consumes one token for `tracking_id`.
    pub async fn check(&self, tracking_id: &str) -> RateLimitResult {
        let mut inner = self.inner.write().await;
        let (rate, capacity) = (inner.rate, inner.capacity);

        inner
            .buckets
            .entry(tracking_id.to_string())
            .or_insert_with(|| TokenBucket::full(capacity))
            .try_consume(rate, capacity)
    }

    /// Drops buckets idle for at least `timeout`. Returns how many were removed.
    pub async fn cleanup_idle(&self, timeout: Duration) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.buckets.len();
        inner.buckets.retain(|_, bucket| bucket.idle_for() < timeout);
        before - inner.buckets.len()
    }

    /// Number of tracking ids currently holding a bucket.
    pub async fn tracked_count(&self) -> usize {
        self.inner.read().await.buckets.len()
    }

    /// Spawns a task that runs [`cleanup_idle`](Self::cleanup_idle) with
    /// [`STALE_ENTRY_TIMEOUT`] every `every`.
    pub fn spawn_cleanup_task(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let removed = limiter.cleanup_idle(STALE_ENTRY_TIMEOUT).await;
                if removed > 0 {
                    debug!(removed_count = removed, "Dropped idle rate limit buckets");
                }
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_CAPACITY)
    }
}
