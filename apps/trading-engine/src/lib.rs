// Allow unwrap/expect in tests - tests should panic on unexpected errors
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Trading Engine - Control Plane Core
//!
//! The deterministic trading control plane: order execution, account
//! monitoring, risk enforcement, and versioned configuration, kept
//! consistent with an external exchange under concurrent, lossy, and
//! failure-prone conditions.
//!
//! # Components
//!
//! - [`exchange`]: the sole venue boundary (signed REST, user-data stream,
//!   in-memory mock)
//! - [`oee`]: order state machine, idempotent submission pipeline,
//!   cancellation, indeterminate-order reconciliation
//! - [`account`]: positions, balances, P&L episodes, drift reconciliation
//! - [`risk`]: policy evaluation and the emergency stop
//! - [`configstore`]: versioned, audited configuration with change events
//! - [`resilience`]: circuit breaker, rate limiter, retry backoff
//! - [`bus`] / [`marketdata`]: in-process event fan-out and tick cache
//! - [`persistence`]: durable orders/fills/alerts (Turso)
//! - [`server`]: admin/health HTTP and the event-stream bridge

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod app;
pub mod bus;
pub mod config;
pub mod configstore;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod marketdata;
pub mod observability;
pub mod oee;
pub mod persistence;
pub mod resilience;
pub mod risk;
pub mod server;

pub use account::{AccountMonitor, AccountSnapshot, AccountThresholds};
pub use app::TradingApp;
pub use bus::{EventBus, MarketTick, OrderUpdateEvent};
pub use config::EngineConfig;
pub use configstore::{ConfigStore, ConfigType};
pub use domain::{
    Fill, Order, OrderSide, OrderSignal, OrderState, OrderType, Position, RiskPolicy, TimeInForce,
};
pub use error::{EngineError, ErrorKind};
pub use exchange::{ExchangePort, MockExchange};
pub use oee::{CancelOutcome, OrderExecutionEngine, SubmitOutcome};
pub use risk::{EmergencyStop, RiskManager, RiskVerdict};
