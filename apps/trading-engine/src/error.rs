//! Rich error handling for the trading engine.
//!
//! Every failure surfaced to a caller carries a stable kind, a human
//! message, and optional key-value context. Kinds drive the propagation
//! policy: some are returned to the caller as-is, some are retried with
//! bounded backoff, and some mark the component unhealthy.
//!
//! # Kinds
//!
//! | Kind | Retried | Typical source |
//! |------|---------|----------------|
//! | `Validation` | no | symbol rule or schema violation |
//! | `NotFound` | no | unknown order / config key |
//! | `Conflict` | no | idempotency or version clash |
//! | `RateLimited` | no | limiter rejected the call |
//! | `BreakerOpen` | no | circuit breaker open |
//! | `Halted` | no | emergency stop active |
//! | `Timeout` | yes | deadline elapsed |
//! | `Indeterminate` | no (reconciled) | submission outcome unknown |
//! | `ExchangeRejected` | no | definitive venue refusal |
//! | `InvariantViolation` | no (halts worker) | impossible state detected |
//! | `Transient` | yes | network / 5xx / 429 |
//! | `Fatal` | no (unhealthy) | signing, clock skew, misconfig |

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error kinds for the trading engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Request failed symbol-rule or schema validation.
    Validation,
    /// Referenced entity does not exist.
    NotFound,
    /// Idempotency key or optimistic-lock version clash.
    Conflict,
    /// Rate limiter rejected the call.
    RateLimited,
    /// Circuit breaker is open for the endpoint.
    BreakerOpen,
    /// Emergency stop is active.
    Halted,
    /// Deadline elapsed before the operation completed.
    Timeout,
    /// Outcome unknown; reconciliation will resolve it.
    Indeterminate,
    /// The venue definitively refused the request.
    ExchangeRejected,
    /// An internal invariant was violated.
    InvariantViolation,
    /// Transient failure; safe to retry.
    Transient,
    /// Unrecoverable failure (signing, clock skew, misconfiguration).
    Fatal,
}

impl ErrorKind {
    /// Get the stable code string for this kind.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::BreakerOpen => "BREAKER_OPEN",
            Self::Halted => "HALTED",
            Self::Timeout => "TIMEOUT",
            Self::Indeterminate => "INDETERMINATE",
            Self::ExchangeRejected => "EXCHANGE_REJECTED",
            Self::InvariantViolation => "INVARIANT_VIOLATION",
            Self::Transient => "TRANSIENT",
            Self::Fatal => "FATAL",
        }
    }

    /// Whether an operation failing with this kind may be retried internally.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient)
    }

    /// HTTP status code for API responses.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::RateLimited => 429,
            Self::BreakerOpen | Self::Halted => 503,
            Self::Timeout | Self::Indeterminate => 504,
            Self::ExchangeRejected => 422,
            Self::InvariantViolation | Self::Transient | Self::Fatal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A rich error with kind and context for the trading engine.
#[derive(Debug, Error)]
pub struct EngineError {
    kind: ErrorKind,
    message: String,
    context: Vec<(String, String)>,
}

impl EngineError {
    /// Create a new engine error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
        }
    }

    /// Add context to the error.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }

    /// Get the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the context pairs.
    #[must_use]
    pub fn context(&self) -> &[(String, String)] {
        &self.context
    }

    /// Convert to an HTTP-compatible error response body.
    #[must_use]
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.kind.code().to_string(),
            message: self.message.clone(),
            details: self.context.iter().cloned().collect(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)
    }
}

/// Convenience constructors for common errors.
impl EngineError {
    /// Validation failure.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Entity not found.
    #[must_use]
    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("{entity} {id} not found"))
            .with_context("id", id)
    }

    /// Rate limiter rejection.
    #[must_use]
    pub fn rate_limited(endpoint: &str) -> Self {
        Self::new(
            ErrorKind::RateLimited,
            format!("rate limit exceeded for {endpoint}"),
        )
        .with_context("endpoint", endpoint)
    }

    /// Circuit breaker open.
    #[must_use]
    pub fn breaker_open(endpoint: &str) -> Self {
        Self::new(
            ErrorKind::BreakerOpen,
            format!("circuit breaker open for {endpoint}"),
        )
        .with_context("endpoint", endpoint)
    }

    /// Emergency stop active.
    #[must_use]
    pub fn halted() -> Self {
        Self::new(ErrorKind::Halted, "trading is halted by emergency stop")
    }

    /// Deadline elapsed.
    #[must_use]
    pub fn timeout(operation: &str) -> Self {
        Self::new(ErrorKind::Timeout, format!("{operation} timed out"))
            .with_context("operation", operation)
    }

    /// Invariant violation.
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvariantViolation, message)
    }
}

/// HTTP-compatible error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable error code string.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Additional details.
    pub details: std::collections::HashMap<String, String>,
}
