//! Typed operational alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert categories. Suppression windows are applied per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    /// Free balance fell below the configured floor.
    LowBalance,
    /// Drawdown exceeded the configured limit.
    HighDrawdown,
    /// Margin ratio exceeded the configured limit.
    HighMarginRatio,
    /// Local balance drifted from the exchange beyond tolerance.
    BalanceDrift,
    /// Local position drifted from the exchange beyond tolerance.
    PositionDrift,
    /// An internal invariant was violated.
    InvariantViolation,
    /// A submission stayed ambiguous past the reconciliation window.
    AmbiguousOrder,
    /// The user-data stream has been disconnected past its grace period.
    StreamDisconnected,
    /// The emergency stop engaged or released.
    EmergencyStop,
}

impl AlertKind {
    /// Stable string code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::LowBalance => "LOW_BALANCE",
            Self::HighDrawdown => "HIGH_DRAWDOWN",
            Self::HighMarginRatio => "HIGH_MARGIN_RATIO",
            Self::BalanceDrift => "BALANCE_DRIFT",
            Self::PositionDrift => "POSITION_DRIFT",
            Self::InvariantViolation => "INVARIANT_VIOLATION",
            Self::AmbiguousOrder => "AMBIGUOUS_ORDER",
            Self::StreamDisconnected => "STREAM_DISCONNECTED",
            Self::EmergencyStop => "EMERGENCY_STOP",
        }
    }

    /// Default severity for the kind.
    #[must_use]
    pub const fn default_severity(&self) -> AlertSeverity {
        match self {
            Self::LowBalance | Self::BalanceDrift | Self::PositionDrift => AlertSeverity::Warning,
            Self::HighDrawdown
            | Self::HighMarginRatio
            | Self::InvariantViolation
            | Self::AmbiguousOrder
            | Self::StreamDisconnected
            | Self::EmergencyStop => AlertSeverity::Critical,
        }
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Needs immediate attention.
    Critical,
}

/// An emitted alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Process-unique alert id.
    pub id: String,
    /// Alert category.
    pub kind: AlertKind,
    /// Severity.
    pub severity: AlertSeverity,
    /// Human-readable message.
    pub message: String,
    /// Entity the alert concerns (symbol, asset, order id).
    pub subject: Option<String>,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    /// Create an alert with the kind's default severity.
    #[must_use]
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            subject: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the subject entity.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}
