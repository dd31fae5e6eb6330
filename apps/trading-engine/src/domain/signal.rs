//! Strategy order signals - the typed ingress contract into the engine.
//!
//! Strategies never touch the venue; they emit [`OrderSignal`]s which the
//! execution engine normalizes, validates, risk-checks, and submits.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::{OrderSide, OrderType, TimeInForce};

/// An order request emitted by a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSignal {
    /// Originating strategy.
    pub strategy_id: String,
    /// Trading pair symbol.
    pub symbol: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Order type.
    pub order_type: OrderType,
    /// Requested quantity.
    pub quantity: Decimal,
    /// Limit price, when the type requires one.
    pub price: Option<Decimal>,
    /// Stop trigger price, when the type requires one.
    pub stop_price: Option<Decimal>,
    /// Time in force.
    pub time_in_force: TimeInForce,
    /// Only reduce an existing position.
    #[serde(default)]
    pub reduce_only: bool,
    /// Maker-only flag.
    #[serde(default)]
    pub post_only: bool,
    /// Idempotency key; derived deterministically when absent.
    #[serde(default)]
    pub client_order_id: Option<String>,
}

/// Derives deterministic client order ids for signals that arrive without
/// one: `<strategy_id>-<ms_timestamp>-<sequence>`.
///
/// The sequence is process-wide and monotonic, so two signals normalized in
/// the same millisecond still receive distinct ids.
#[derive(Debug, Default)]
pub struct ClientOrderIdSource {
    sequence: AtomicU64,
}

impl ClientOrderIdSource {
    /// Create a new id source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the next client order id for a strategy.
    pub fn next_for(&self, strategy_id: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let ms = Utc::now().timestamp_millis();
        format!("{strategy_id}-{ms}-{seq}")
    }
}

impl OrderSignal {
    /// Resolve the idempotency key, deriving one if the strategy did not
    /// supply it.
    pub fn resolve_client_order_id(&self, source: &ClientOrderIdSource) -> String {
        self.client_order_id
            .clone()
            .unwrap_or_else(|| source.next_for(&self.strategy_id))
    }
}
