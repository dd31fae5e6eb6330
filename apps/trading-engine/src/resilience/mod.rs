//! Resilience primitives: circuit breaking, rate limiting, retry backoff.

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{
    BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker,
};
pub use rate_limit::{RateLimitConfig, RateLimiter, RateLimiterRegistry};
pub use retry::{BackoffCalculator, RetryPolicy, is_retryable_status};
