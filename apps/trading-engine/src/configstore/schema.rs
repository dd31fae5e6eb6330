//! Per-type validation schemas for configuration writes.
//!
//! A write is materialized only if its payload deserializes into the typed
//! schema for its config type and passes the cross-field checks. `system`
//! entries are free-form.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::policy::{PolicyAction, PolicyOperator, PolicyScope};
use crate::domain::symbol_rules::SymbolRules;

/// Configuration entry types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigType {
    /// Strategy parameters.
    Strategy,
    /// Risk policy definition.
    RiskLimit,
    /// Trading pair rules.
    TradingPair,
    /// Free-form engine settings.
    System,
}

impl ConfigType {
    /// Stable string name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Strategy => "strategy",
            Self::RiskLimit => "risk_limit",
            Self::TradingPair => "trading_pair",
            Self::System => "system",
        }
    }
}

/// Schema violations.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Payload does not deserialize into the schema.
    #[error("malformed {config_type} payload: {message}")]
    Malformed {
        /// Config type being validated.
        config_type: &'static str,
        /// Deserialization failure.
        message: String,
    },

    /// A cross-field constraint failed.
    #[error("invalid {config_type} config: {message}")]
    Constraint {
        /// Config type being validated.
        config_type: &'static str,
        /// Constraint description.
        message: String,
    },
}

/// Typed payload of a `trading_pair` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPairConfig {
    /// Trading pair symbol.
    pub symbol: String,
    /// Minimum order quantity.
    pub min_order_size: Decimal,
    /// Maximum order quantity.
    pub max_order_size: Decimal,
    /// Quantity grid step.
    pub step_size: Decimal,
    /// Price grid step.
    pub tick_size: Decimal,
    /// Minimum notional.
    pub min_notional: Decimal,
    /// Maximum leverage.
    #[serde(default = "default_leverage")]
    pub max_leverage: u32,
    /// Whether the pair is tradable.
    #[serde(default)]
    pub enabled: bool,
}

const fn default_leverage() -> u32 {
    1
}

impl TradingPairConfig {
    /// Convert into the domain rule set used by validation.
    #[must_use]
    pub fn into_rules(self) -> SymbolRules {
        SymbolRules {
            symbol: self.symbol,
            min_qty: self.min_order_size,
            max_qty: self.max_order_size,
            step_size: self.step_size,
            tick_size: self.tick_size,
            min_notional: self.min_notional,
            enabled: self.enabled,
        }
    }
}

/// Typed payload of a `risk_limit` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimitConfig {
    /// Operator-facing name.
    pub name: String,
    /// Metric the policy watches.
    pub metric: String,
    /// Comparison operator.
    pub operator: PolicyOperator,
    /// Threshold value.
    pub threshold: Decimal,
    /// Scope of application.
    pub scope: PolicyScope,
    /// Scope key for non-global scopes.
    #[serde(default)]
    pub scope_id: Option<String>,
    /// Action when the policy fires.
    pub action: PolicyAction,
    /// Tie-break priority.
    #[serde(default)]
    pub priority: i32,
    /// Whether the policy participates in evaluation.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

/// Typed payload of a `strategy` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Strategy name.
    pub name: String,
    /// Whether the strategy may emit signals.
    pub enabled: bool,
    /// Symbols the strategy trades.
    pub symbols: Vec<String>,
    /// Maximum simultaneously open orders.
    pub max_open_orders: u32,
    /// Maximum position notional per symbol.
    pub max_position_notional: Decimal,
}

/// Validate a payload for its declared type. Returns the canonicalized
/// value (unknown fields dropped) to be stored.
pub fn validate(
    config_type: ConfigType,
    value: &serde_json::Value,
) -> Result<serde_json::Value, SchemaError> {
    match config_type {
        ConfigType::TradingPair => {
            let parsed: TradingPairConfig = deserialize(config_type, value)?;
            if !symbol_pattern().is_match(&parsed.symbol) {
                return Err(constraint(
                    config_type,
                    "symbol must be 2-20 uppercase alphanumerics",
                ));
            }
            if parsed.min_order_size <= Decimal::ZERO {
                return Err(constraint(config_type, "min_order_size must be positive"));
            }
            if parsed.min_order_size > parsed.max_order_size {
                return Err(constraint(
                    config_type,
                    "min_order_size must not exceed max_order_size",
                ));
            }
            if parsed.step_size <= Decimal::ZERO || parsed.tick_size <= Decimal::ZERO {
                return Err(constraint(
                    config_type,
                    "step_size and tick_size must be positive",
                ));
            }
            if parsed.min_notional < Decimal::ZERO {
                return Err(constraint(config_type, "min_notional must not be negative"));
            }
            if !(1..=125).contains(&parsed.max_leverage) {
                return Err(constraint(config_type, "max_leverage must be in [1, 125]"));
            }
            serialize(config_type, &parsed)
        }
        ConfigType::RiskLimit => {
            let parsed: RiskLimitConfig = deserialize(config_type, value)?;
            if parsed.metric.is_empty() {
                return Err(constraint(config_type, "metric must not be empty"));
            }
            if parsed.scope != PolicyScope::Global && parsed.scope_id.is_none() {
                return Err(constraint(
                    config_type,
                    "scope_id is required for non-global scopes",
                ));
            }
            serialize(config_type, &parsed)
        }
        ConfigType::Strategy => {
            let parsed: StrategyConfig = deserialize(config_type, value)?;
            if parsed.name.is_empty() {
                return Err(constraint(config_type, "name must not be empty"));
            }
            if parsed.symbols.is_empty() {
                return Err(constraint(config_type, "symbols must not be empty"));
            }
            if parsed.max_open_orders == 0 {
                return Err(constraint(config_type, "max_open_orders must be positive"));
            }
            if parsed.max_position_notional <= Decimal::ZERO {
                return Err(constraint(
                    config_type,
                    "max_position_notional must be positive",
                ));
            }
            serialize(config_type, &parsed)
        }
        ConfigType::System => {
            if value.is_object() {
                Ok(value.clone())
            } else {
                Err(constraint(config_type, "payload must be an object"))
            }
        }
    }
}

fn deserialize<T: serde::de::DeserializeOwned>(
    config_type: ConfigType,
    value: &serde_json::Value,
) -> Result<T, SchemaError> {
    serde_json::from_value(value.clone()).map_err(|e| SchemaError::Malformed {
        config_type: config_type.as_str(),
        message: e.to_string(),
    })
}

fn serialize(
    config_type: ConfigType,
    value: &impl Serialize,
) -> Result<serde_json::Value, SchemaError> {
    serde_json::to_value(value).map_err(|e| SchemaError::Malformed {
        config_type: config_type.as_str(),
        message: e.to_string(),
    })
}

fn constraint(config_type: ConfigType, message: &str) -> SchemaError {
    SchemaError::Constraint {
        config_type: config_type.as_str(),
        message: message.to_string(),
    }
}

fn symbol_pattern() -> &'static regex::Regex {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    // The literal pattern always compiles.
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| regex::Regex::new("^[A-Z0-9]{2,20}$").expect("valid pattern"))
}
