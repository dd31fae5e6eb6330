//! Core domain types: orders, fills, positions, balances, policies, alerts.
//!
//! This layer has no I/O; everything here is deterministic and unit-tested
//! in isolation.

pub mod alert;
pub mod balance;
pub mod fill;
pub mod order;
pub mod policy;
pub mod position;
pub mod signal;
pub mod symbol_rules;

pub use alert::{Alert, AlertKind, AlertSeverity};
pub use balance::Balance;
pub use fill::Fill;
pub use order::{Order, OrderError, OrderSide, OrderState, OrderStateMachine, OrderType, TimeInForce};
pub use policy::{PolicyAction, PolicyOperator, PolicyScope, RiskPolicy};
pub use position::{FillEffect, Position};
pub use signal::{ClientOrderIdSource, OrderSignal};
pub use symbol_rules::{RuleViolation, SymbolRules};
