//! Circuit breaker for exchange endpoints.
//!
//! Fails fast when an endpoint keeps erroring instead of hammering the
//! venue while it is down.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN (N consecutive failures within the failure window)
//! OPEN → HALF_OPEN (cooldown elapsed)
//! HALF_OPEN → CLOSED (all probe calls succeed)
//! HALF_OPEN → OPEN (any probe call fails)
//! ```
//!
//! State is tracked per (endpoint, account) in [`BreakerRegistry`]; the
//! registry is process-wide and thread-safe.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without reaching the venue.
    Open,
    /// A bounded probe set decides the next state.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Failures older than this no longer count toward the streak.
    pub failure_window: Duration,
    /// Time to stay open before probing.
    pub cooldown: Duration,
    /// Probe calls admitted in half-open.
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

/// Circuit breaker for one (endpoint, account) pair.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: RwLock<BreakerState>,
    /// Consecutive failures inside the failure window.
    consecutive_failures: AtomicU32,
    /// Start of the current failure streak.
    streak_started: RwLock<Option<Instant>>,
    /// When the circuit opened.
    opened_at: RwLock<Option<Instant>>,
    half_open_inflight: AtomicU32,
    half_open_successes: AtomicU32,
    state_transitions: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(BreakerState::Closed),
            consecutive_failures: AtomicU32::new(0),
            streak_started: RwLock::new(None),
            opened_at: RwLock::new(None),
            half_open_inflight: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            state_transitions: AtomicU64::new(0),
        }
    }

    /// Get the breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state, applying any time-based transition first.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.check_cooldown();
        *self.state.read()
    }

    /// Whether a call is admitted right now.
    ///
    /// In half-open this also reserves a probe slot, so callers must follow
    /// up with [`Self::record_success`] or [`Self::record_failure`].
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.check_cooldown();
        match *self.state.read() {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                let slot = self.half_open_inflight.fetch_add(1, Ordering::SeqCst);
                if slot < self.config.half_open_probes {
                    true
                } else {
                    self.half_open_inflight.fetch_sub(1, Ordering::SeqCst);
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let state = *self.state.read();
        match state {
            BreakerState::Closed => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                *self.streak_started.write() = None;
            }
            BreakerState::HalfOpen => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.half_open_probes {
                    self.transition_to_closed();
                }
            }
            BreakerState::Open => {
                tracing::warn!(name = %self.name, "success recorded while breaker is OPEN");
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let state = *self.state.read();
        match state {
            BreakerState::Closed => {
                let mut streak = self.streak_started.write();
                let now = Instant::now();
                // A stale streak restarts the count.
                let expired = streak
                    .is_some_and(|started| now.duration_since(started) > self.config.failure_window);
                if expired || streak.is_none() {
                    *streak = Some(now);
                    self.consecutive_failures.store(1, Ordering::SeqCst);
                } else {
                    self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                }
                drop(streak);

                if self.consecutive_failures.load(Ordering::SeqCst) >= self.config.failure_threshold
                {
                    self.transition_to_open();
                }
            }
            BreakerState::HalfOpen => {
                // Any probe failure reopens immediately.
                self.transition_to_open();
            }
            BreakerState::Open => {}
        }
    }

    /// Check for the time-based OPEN -> HALF_OPEN transition.
    fn check_cooldown(&self) {
        let state = *self.state.read();
        if state == BreakerState::Open
            && let Some(opened) = *self.opened_at.read()
            && opened.elapsed() >= self.config.cooldown
        {
            self.transition_to_half_open();
        }
    }

    fn transition_to_open(&self) {
        let mut state = self.state.write();
        let previous = *state;
        if previous != BreakerState::Open {
            *state = BreakerState::Open;
            drop(state);

            *self.opened_at.write() = Some(Instant::now());
            self.state_transitions.fetch_add(1, Ordering::Relaxed);

            tracing::warn!(
                name = %self.name,
                from = %previous,
                to = "OPEN",
                failures = self.consecutive_failures.load(Ordering::SeqCst),
                "Circuit breaker opened"
            );
        }
    }

    fn transition_to_half_open(&self) {
        let mut state = self.state.write();
        let previous = *state;
        if previous == BreakerState::Open {
            *state = BreakerState::HalfOpen;
            drop(state);

            self.half_open_inflight.store(0, Ordering::SeqCst);
            self.half_open_successes.store(0, Ordering::SeqCst);
            self.state_transitions.fetch_add(1, Ordering::Relaxed);

            tracing::info!(name = %self.name, from = %previous, to = "HALF_OPEN", "Circuit breaker probing");
        }
    }

    fn transition_to_closed(&self) {
        let mut state = self.state.write();
        let previous = *state;
        if previous != BreakerState::Closed {
            *state = BreakerState::Closed;
            drop(state);

            self.consecutive_failures.store(0, Ordering::SeqCst);
            *self.streak_started.write() = None;
            *self.opened_at.write() = None;
            self.state_transitions.fetch_add(1, Ordering::Relaxed);

            tracing::info!(name = %self.name, from = %previous, to = "CLOSED", "Circuit breaker closed");
        }
    }

    /// Force the breaker open (operator action).
    pub fn force_open(&self) {
        self.transition_to_open();
    }

    /// Force the breaker closed (operator action).
    pub fn force_close(&self) {
        self.transition_to_closed();
    }

    /// Metrics snapshot.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            name: self.name.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Breaker name (endpoint:account).
    pub name: String,
    /// Current state.
    pub state: BreakerState,
    /// Consecutive failures in the current streak.
    pub consecutive_failures: u32,
    /// Lifetime state transitions.
    pub state_transitions: u64,
}

/// Process-wide registry of breakers keyed by (endpoint, account).
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create a registry; all breakers share one configuration.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for an endpoint/account pair.
    pub fn breaker(&self, endpoint: &str, account: &str) -> Arc<CircuitBreaker> {
        let key = format!("{endpoint}:{account}");
        if let Some(existing) = self.breakers.read().get(&key) {
            return Arc::clone(existing);
        }
        let mut map = self.breakers.write();
        Arc::clone(
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone()))),
        )
    }

    /// Snapshots of every breaker.
    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.read().values().map(|b| b.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, cooldown_ms: u64, probes: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_millis(cooldown_ms),
            half_open_probes: probes,
        }
    }

    #[test]
    fn starts_closed_and_admits_calls() {
        let breaker = CircuitBreaker::new("order.place:main", BreakerConfig::default());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn opens_on_nth_consecutive_failure() {
        let breaker = CircuitBreaker::new("test", config(5, 10_000, 1));

        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn success_resets_the_streak() {
        let breaker = CircuitBreaker::new("test", config(3, 10_000, 1));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn cooldown_admits_single_probe() {
        let breaker = CircuitBreaker::new("test", config(1, 10, 1));

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // One probe slot, further calls rejected.
        assert!(breaker.try_acquire());
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn probe_success_closes() {
        let breaker = CircuitBreaker::new("test", config(1, 10, 1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.try_acquire());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn probe_failure_reopens() {
        let breaker = CircuitBreaker::new("test", config(1, 10, 1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.try_acquire());

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn force_open_and_close() {
        let breaker = CircuitBreaker::new("test", BreakerConfig::default());
        breaker.force_open();
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.force_close();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn registry_shares_breakers_per_key() {
        let registry = BreakerRegistry::new(config(1, 10_000, 1));

        let a = registry.breaker("order.place", "main");
        let b = registry.breaker("order.place", "main");
        let c = registry.breaker("order.cancel", "main");

        a.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(c.state(), BreakerState::Closed);
        assert_eq!(registry.snapshots().len(), 2);
    }
}
