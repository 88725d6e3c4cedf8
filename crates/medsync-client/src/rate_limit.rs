//! Token-bucket rate limiting, one bucket per upstream host.
//!
//! Buckets refill lazily on each acquisition. Waiters queue on an async
//! mutex, so they are served in arrival order and a sleeping waiter keeps
//! its place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use medsync_core::config::{RateLimit, RateLimitConfig};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Lowest sustained rate a limiter accepts, in requests per second.
pub const MIN_RATE: f64 = 0.1;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Bounds the request rate to one host.
///
/// Over any window of length `T` at most `burst + rate * T` permits are
/// granted.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a full bucket. `rate` is floored at [`MIN_RATE`] and `burst`
    /// at 1.
    pub fn new(rate: f64, burst: u32) -> Self {
        let rate = if rate.is_finite() { rate.max(MIN_RATE) } else { MIN_RATE };
        let capacity = f64::from(burst.max(1));
        Self {
            rate,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_limit(limit: RateLimit) -> Self {
        Self::new(limit.rate, limit.burst)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.capacity as u32
    }

    /// Waits until a permit is available and consumes it.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        loop {
            self.refill(&mut bucket, Instant::now());
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return;
            }
            let deficit = 1.0 - bucket.tokens;
            tokio::time::sleep(Duration::from_secs_f64(deficit / self.rate)).await;
        }
    }

    /// Consumes a permit if one is available right now.
    ///
    /// Returns false without waiting when the bucket is empty or another
    /// caller is already queued.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut bucket) = self.bucket.try_lock() else {
            return false;
        };
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;
    }
}

/// Lazily created limiters keyed by host name.
#[derive(Debug, Default)]
pub struct RateLimiters {
    config: RateLimitConfig,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiters {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// The shared limiter for `host`, created on first use.
    pub async fn for_host(&self, host: &str) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().await;
        limiters
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::from_limit(self.config.for_host(host))))
            .clone()
    }
}
