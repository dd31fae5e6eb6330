//! Risk policies.
//!
//! A policy compares one live metric against a threshold and, when it
//! fires, demands an action. `emergency_stop` dominates `block` dominates
//! `warn`; ties within an action break by priority, then id.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Comparison operator for policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyOperator {
    /// Metric strictly below threshold.
    #[serde(rename = "<")]
    Lt,
    /// Metric at or below threshold.
    #[serde(rename = "<=")]
    Le,
    /// Metric strictly above threshold.
    #[serde(rename = ">")]
    Gt,
    /// Metric at or above threshold.
    #[serde(rename = ">=")]
    Ge,
    /// Metric equal to threshold.
    #[serde(rename = "=")]
    Eq,
    /// Metric not equal to threshold.
    #[serde(rename = "!=")]
    Ne,
}

impl PolicyOperator {
    /// Apply the operator.
    #[must_use]
    pub fn apply(&self, metric: Decimal, threshold: Decimal) -> bool {
        match self {
            Self::Lt => metric < threshold,
            Self::Le => metric <= threshold,
            Self::Gt => metric > threshold,
            Self::Ge => metric >= threshold,
            Self::Eq => metric == threshold,
            Self::Ne => metric != threshold,
        }
    }
}

/// What part of the system a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    /// Applies everywhere.
    Global,
    /// Applies to one symbol.
    Symbol,
    /// Applies to one strategy.
    Strategy,
    /// Applies to one user/account.
    User,
}

/// Action demanded by a firing policy, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    /// Record a violation and proceed.
    Warn,
    /// Reject the evaluated operation.
    Block,
    /// Halt all trading.
    EmergencyStop,
}

/// A configured risk policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPolicy {
    /// Stable policy id.
    pub id: String,
    /// Operator-facing name.
    pub name: String,
    /// Metric the policy watches (e.g. `drawdown_pct`, `open_order_count`).
    pub metric: String,
    /// Comparison operator.
    pub operator: PolicyOperator,
    /// Threshold value.
    pub threshold: Decimal,
    /// Scope of application.
    pub scope: PolicyScope,
    /// Scope key (symbol/strategy/user id) for non-global scopes.
    pub scope_id: Option<String>,
    /// Action when the policy fires.
    pub action: PolicyAction,
    /// Tie-break priority (higher wins).
    pub priority: i32,
    /// Whether the policy participates in evaluation.
    pub enabled: bool,
    /// Configuration version this policy came from.
    pub version: u64,
}

impl RiskPolicy {
    /// Whether this policy applies in the given evaluation context.
    #[must_use]
    pub fn matches_scope(&self, symbol: Option<&str>, strategy_id: Option<&str>) -> bool {
        match self.scope {
            PolicyScope::Global => true,
            PolicyScope::Symbol => {
                self.scope_id.as_deref().is_some_and(|s| Some(s) == symbol)
            }
            PolicyScope::Strategy => self
                .scope_id
                .as_deref()
                .is_some_and(|s| Some(s) == strategy_id),
            // Single-account deployment: user-scoped policies apply globally.
            PolicyScope::User => true,
        }
    }

    /// Evaluate the policy against a metric value.
    #[must_use]
    pub fn fires(&self, metric: Decimal) -> bool {
        self.enabled && self.operator.apply(metric, self.threshold)
    }

    /// De-duplication key: at most one enabled policy may exist per key.
    #[must_use]
    pub fn uniqueness_key(&self) -> (PolicyScope, Option<&str>, &str, PolicyOperator) {
        (
            self.scope,
            self.scope_id.as_deref(),
            self.metric.as_str(),
            self.operator,
        )
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn policy(action: PolicyAction, priority: i32) -> RiskPolicy {
        RiskPolicy {
            id: "p1".to_string(),
            name: "max drawdown".to_string(),
            metric: "drawdown_pct".to_string(),
            operator: PolicyOperator::Gt,
            threshold: dec!(10),
            scope: PolicyScope::Global,
            scope_id: None,
            action,
            priority,
            enabled: true,
            version: 1,
        }
    }

    #[test]
    fn operators_compare_correctly() {
        assert!(PolicyOperator::Gt.apply(dec!(10.5), dec!(10)));
        assert!(!PolicyOperator::Gt.apply(dec!(10), dec!(10)));
        assert!(PolicyOperator::Ge.apply(dec!(10), dec!(10)));
        assert!(PolicyOperator::Lt.apply(dec!(9), dec!(10)));
        assert!(PolicyOperator::Eq.apply(dec!(10), dec!(10)));
        assert!(PolicyOperator::Ne.apply(dec!(9), dec!(10)));
    }

    #[test]
    fn action_severity_ordering() {
        assert!(PolicyAction::EmergencyStop > PolicyAction::Block);
        assert!(PolicyAction::Block > PolicyAction::Warn);
    }

    #[test]
    fn disabled_policy_never_fires() {
        let mut p = policy(PolicyAction::Block, 0);
        p.enabled = false;
        assert!(!p.fires(dec!(100)));
    }

    #[test]
    fn scope_matching() {
        let mut p = policy(PolicyAction::Warn, 0);
        p.scope = PolicyScope::Symbol;
        p.scope_id = Some("BTCUSDT".to_string());

        assert!(p.matches_scope(Some("BTCUSDT"), None));
        assert!(!p.matches_scope(Some("ETHUSDT"), None));
        assert!(!p.matches_scope(None, None));

        p.scope = PolicyScope::Strategy;
        p.scope_id = Some("alpha".to_string());
        assert!(p.matches_scope(None, Some("alpha")));
        assert!(!p.matches_scope(None, Some("beta")));
    }

    #[test]
    fn operator_serde_uses_symbols() {
        let json = serde_json::to_string(&PolicyOperator::Ge).unwrap();
        assert_eq!(json, "\">=\"");
        let parsed: PolicyOperator = serde_json::from_str("\"<\"").unwrap();
        assert_eq!(parsed, PolicyOperator::Lt);
    }
}
