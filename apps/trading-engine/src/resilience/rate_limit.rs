//! Rate limiting for venue calls.
//!
//! Two gates run in sequence: a token bucket (burst + steady refill) and a
//! multi-tier sliding-window counter (per-second and per-minute caps, the
//! shape exchange API weight limits take). A call passes only if every gate
//! admits it; tokens consumed by a call that a later gate rejects are
//! returned.
//!
//! Limiters are tracked per (endpoint, account) in [`RateLimiterRegistry`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Steady-state refill rate (tokens per second).
    pub tokens_per_second: f64,
    /// Bucket capacity (maximum burst).
    pub burst: u32,
    /// Sliding one-second window cap (0 disables the tier).
    pub per_second_cap: u32,
    /// Sliding one-minute window cap (0 disables the tier).
    pub per_minute_cap: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: 10.0,
            burst: 10,
            per_second_cap: 0,
            per_minute_cap: 1_200,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Default)]
struct WindowState {
    /// Timestamps of admitted calls within the last minute.
    admitted: VecDeque<Instant>,
}

impl WindowState {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.admitted.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_within(&self, now: Instant, window: Duration) -> usize {
        self.admitted
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) <= window)
            .count()
    }
}

/// Token-bucket plus windowed-counter limiter for one (endpoint, account).
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    bucket: Mutex<BucketState>,
    window: Mutex<WindowState>,
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    #[must_use]
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            name: name.into(),
            bucket: Mutex::new(BucketState {
                tokens: f64::from(config.burst),
                last_refill: Instant::now(),
            }),
            window: Mutex::new(WindowState::default()),
            config,
        }
    }

    /// Get the limiter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to admit one call without waiting.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        if !self.take_token(now) {
            return false;
        }
        if self.check_windows(now) {
            true
        } else {
            // The window tier vetoed; give the bucket token back.
            self.bucket.lock().tokens += 1.0;
            false
        }
    }

    /// Admit one call, waiting until tokens are available or the deadline
    /// elapses. Returns `false` if the deadline passed first.
    pub async fn acquire_until(&self, deadline: Instant) -> bool {
        loop {
            if self.try_acquire() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = self.time_to_next_token(now).min(deadline - now);
            tokio::time::sleep(wait).await;
        }
    }

    fn take_token(&self, now: Instant) -> bool {
        let mut bucket = self.bucket.lock();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.tokens_per_second)
            .min(f64::from(self.config.burst));
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn check_windows(&self, now: Instant) -> bool {
        let mut window = self.window.lock();
        window.prune(now);

        if self.config.per_second_cap > 0
            && window.count_within(now, Duration::from_secs(1))
                >= self.config.per_second_cap as usize
        {
            return false;
        }
        if self.config.per_minute_cap > 0
            && window.admitted.len() >= self.config.per_minute_cap as usize
        {
            return false;
        }

        window.admitted.push_back(now);
        true
    }

    fn time_to_next_token(&self, now: Instant) -> Duration {
        let bucket = self.bucket.lock();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        let tokens = bucket.tokens + elapsed * self.config.tokens_per_second;
        if tokens >= 1.0 {
            // A window tier is the blocker; poll on a short interval.
            return Duration::from_millis(50);
        }
        let deficit = 1.0 - tokens;
        Duration::from_secs_f64(deficit / self.config.tokens_per_second.max(f64::EPSILON))
    }
}

/// Process-wide registry of limiters keyed by (endpoint, account).
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    config: RateLimitConfig,
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    /// Create a registry; all limiters share one configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            limiters: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the limiter for an endpoint/account pair.
    pub fn limiter(&self, endpoint: &str, account: &str) -> Arc<RateLimiter> {
        let key = format!("{endpoint}:{account}");
        if let Some(existing) = self.limiters.read().get(&key) {
            return Arc::clone(existing);
        }
        let mut map = self.limiters.write();
        Arc::clone(
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(RateLimiter::new(key, self.config.clone()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rps: f64, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            tokens_per_second: rps,
            burst,
            per_second_cap: 0,
            per_minute_cap: 0,
        }
    }

    #[test]
    fn burst_admits_exactly_burst_calls() {
        let limiter = RateLimiter::new("order.place:main", config(10.0, 10));

        for i in 0..10 {
            assert!(limiter.try_acquire(), "call {i} should be admitted");
        }
        for i in 10..15 {
            assert!(!limiter.try_acquire(), "call {i} should be rejected");
        }
    }

    #[test]
    fn refill_restores_capacity() {
        let limiter = RateLimiter::new("test", config(100.0, 5));

        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());

        // 100 tokens/s means ~50ms restores the full burst of 5.
        std::thread::sleep(Duration::from_millis(60));
        for i in 0..5 {
            assert!(limiter.try_acquire(), "call {i} after refill");
        }
    }

    #[test]
    fn per_minute_window_caps_admissions() {
        let limiter = RateLimiter::new(
            "test",
            RateLimitConfig {
                tokens_per_second: 1_000.0,
                burst: 1_000,
                per_second_cap: 0,
                per_minute_cap: 3,
            },
        );

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn per_second_window_is_separate_tier() {
        let limiter = RateLimiter::new(
            "test",
            RateLimitConfig {
                tokens_per_second: 1_000.0,
                burst: 1_000,
                per_second_cap: 2,
                per_minute_cap: 100,
            },
        );

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn window_rejection_returns_bucket_token() {
        let limiter = RateLimiter::new(
            "test",
            RateLimitConfig {
                tokens_per_second: 0.001,
                burst: 2,
                per_second_cap: 0,
                per_minute_cap: 1,
            },
        );

        assert!(limiter.try_acquire());
        // Window rejects, but the bucket token is restored, so the bucket
        // still holds one token rather than zero.
        assert!(!limiter.try_acquire());
        assert!((limiter.bucket.lock().tokens - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn acquire_until_waits_for_refill() {
        let limiter = RateLimiter::new("test", config(50.0, 1));
        assert!(limiter.try_acquire());

        let deadline = Instant::now() + Duration::from_millis(200);
        assert!(limiter.acquire_until(deadline).await);
    }

    #[tokio::test]
    async fn acquire_until_respects_deadline() {
        let limiter = RateLimiter::new("test", config(0.1, 1));
        assert!(limiter.try_acquire());

        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(!limiter.acquire_until(deadline).await);
    }

    #[test]
    fn registry_separates_endpoints() {
        let registry = RateLimiterRegistry::new(config(10.0, 1));
        let place = registry.limiter("order.place", "main");
        let cancel = registry.limiter("order.cancel", "main");

        assert!(place.try_acquire());
        assert!(!place.try_acquire());
        assert!(cancel.try_acquire());
    }
}
