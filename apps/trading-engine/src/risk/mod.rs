//! Risk manager: policy evaluation, violations, emergency stop.
//!
//! Policies are loaded from the configuration store and re-loaded on
//! `risk_limit` change events. Evaluation is synchronous and pure over a
//! metric set; the background sweep feeds it account-level metrics on a
//! timer and engages the emergency stop when a policy demands it.

pub mod emergency;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::policy::{PolicyAction, RiskPolicy};

pub use emergency::{EmergencyStop, HaltEvent, HaltRecord};

/// Metric values plus the identity of what is being evaluated.
#[derive(Debug, Clone, Default)]
pub struct MetricSet {
    /// Metric values by name.
    pub metrics: HashMap<String, Decimal>,
    /// Symbol context for symbol-scoped policies.
    pub symbol: Option<String>,
    /// Strategy context for strategy-scoped policies.
    pub strategy_id: Option<String>,
}

impl MetricSet {
    /// Start an empty metric set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a metric value.
    #[must_use]
    pub fn with(mut self, name: &str, value: Decimal) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    /// Set the symbol context.
    #[must_use]
    pub fn for_symbol(mut self, symbol: &str) -> Self {
        self.symbol = Some(symbol.to_string());
        self
    }

    /// Set the strategy context.
    #[must_use]
    pub fn for_strategy(mut self, strategy_id: &str) -> Self {
        self.strategy_id = Some(strategy_id.to_string());
        self
    }
}

/// Outcome of a risk evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum RiskVerdict {
    /// No policy fired.
    Allow,
    /// A warn policy fired; proceed but record it.
    Warn {
        /// The firing policy.
        policy_id: String,
        /// Human-readable reason.
        reason: String,
    },
    /// A block policy fired; the operation must be rejected.
    Deny {
        /// The firing policy.
        policy_id: String,
        /// Human-readable reason.
        reason: String,
    },
    /// An emergency-stop policy fired; all trading must halt.
    Halt {
        /// The firing policy.
        policy_id: String,
        /// Human-readable reason.
        reason: String,
    },
}

impl RiskVerdict {
    /// Whether the evaluated operation may proceed.
    #[must_use]
    pub const fn allows(&self) -> bool {
        matches!(self, Self::Allow | Self::Warn { .. })
    }
}

/// A recorded policy firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskViolation {
    /// The firing policy.
    pub policy_id: String,
    /// Metric that fired.
    pub metric: String,
    /// Observed value.
    pub value: Decimal,
    /// Configured threshold.
    pub threshold: Decimal,
    /// Action taken.
    pub action: PolicyAction,
    /// Evaluation context (symbol/strategy).
    pub context: String,
    /// When it fired.
    pub timestamp: DateTime<Utc>,
}

/// Policy evaluation engine.
#[derive(Debug)]
pub struct RiskManager {
    policies: RwLock<Vec<RiskPolicy>>,
    violations: RwLock<Vec<RiskViolation>>,
}

impl RiskManager {
    /// Create with an initial policy set.
    #[must_use]
    pub fn new(policies: Vec<RiskPolicy>) -> Self {
        Self {
            policies: RwLock::new(policies),
            violations: RwLock::new(Vec::new()),
        }
    }

    /// Replace the policy set (called on config change events).
    pub fn reload(&self, policies: Vec<RiskPolicy>) {
        tracing::info!(count = policies.len(), "risk policies reloaded");
        *self.policies.write() = policies;
    }

    /// Current policy set.
    #[must_use]
    pub fn policies(&self) -> Vec<RiskPolicy> {
        self.policies.read().clone()
    }

    /// Evaluate every matching policy against the metric set.
    ///
    /// The dominant action wins (`emergency_stop` > `block` > `warn`), ties
    /// break by priority, then id. Every firing is recorded as a violation.
    pub fn evaluate(&self, metrics: &MetricSet) -> RiskVerdict {
        let policies = self.policies.read();
        let mut fired: Vec<(&RiskPolicy, Decimal)> = Vec::new();

        for policy in policies.iter() {
            if !policy.matches_scope(metrics.symbol.as_deref(), metrics.strategy_id.as_deref()) {
                continue;
            }
            let Some(value) = metrics.metrics.get(&policy.metric) else {
                continue;
            };
            if policy.fires(*value) {
                fired.push((policy, *value));
            }
        }

        if fired.is_empty() {
            return RiskVerdict::Allow;
        }

        fired.sort_by(|(a, _), (b, _)| {
            b.action
                .cmp(&a.action)
                .then(b.priority.cmp(&a.priority))
                .then(a.id.cmp(&b.id))
        });

        let context = format!(
            "symbol={} strategy={}",
            metrics.symbol.as_deref().unwrap_or("-"),
            metrics.strategy_id.as_deref().unwrap_or("-")
        );
        {
            let mut violations = self.violations.write();
            for (policy, value) in &fired {
                metrics::counter!("risk_policy_fired", "action" => action_label(policy.action))
                    .increment(1);
                violations.push(RiskViolation {
                    policy_id: policy.id.clone(),
                    metric: policy.metric.clone(),
                    value: *value,
                    threshold: policy.threshold,
                    action: policy.action,
                    context: context.clone(),
                    timestamp: Utc::now(),
                });
            }
        }

        let (winner, value) = fired[0];
        let reason = format!(
            "{}: {} {} ({} observed)",
            winner.name,
            winner.metric,
            winner.threshold,
            value
        );
        tracing::warn!(
            policy = %winner.id,
            metric = %winner.metric,
            value = %value,
            threshold = %winner.threshold,
            action = ?winner.action,
            "risk policy fired"
        );

        match winner.action {
            PolicyAction::Warn => RiskVerdict::Warn {
                policy_id: winner.id.clone(),
                reason,
            },
            PolicyAction::Block => RiskVerdict::Deny {
                policy_id: winner.id.clone(),
                reason,
            },
            PolicyAction::EmergencyStop => RiskVerdict::Halt {
                policy_id: winner.id.clone(),
                reason,
            },
        }
    }

    /// Recorded violations, newest last.
    #[must_use]
    pub fn violations(&self) -> Vec<RiskViolation> {
        self.violations.read().clone()
    }
}

const fn action_label(action: PolicyAction) -> &'static str {
    match action {
        PolicyAction::Warn => "warn",
        PolicyAction::Block => "block",
        PolicyAction::EmergencyStop => "emergency_stop",
    }
}
