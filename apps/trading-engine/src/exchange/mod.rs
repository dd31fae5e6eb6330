//! Exchange adapter - the sole boundary with the venue.
//!
//! Everything the engine needs from the exchange is expressed by
//! [`ExchangePort`]; the concrete implementation is selected at startup
//! (signed REST + user-data WebSocket in production, [`mock::MockExchange`]
//! for tests and paper runs). No other module may talk to the venue.

pub mod mock;
pub mod rest;
pub mod signing;
pub mod user_stream;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::order::{Order, OrderSide, OrderState, OrderType, TimeInForce};
use crate::domain::fill::Fill;
use crate::error::ErrorKind;

pub use mock::MockExchange;
pub use rest::{RestExchangeClient, RestExchangeConfig};

/// Outbound order request, derived from a local [`Order`] in `NEW`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    /// Idempotency key forwarded to the venue.
    pub client_order_id: String,
    /// Trading pair symbol.
    pub symbol: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Order type.
    pub order_type: OrderType,
    /// Time in force.
    pub time_in_force: TimeInForce,
    /// Requested quantity.
    pub quantity: Decimal,
    /// Limit price, when required.
    pub price: Option<Decimal>,
    /// Stop trigger price, when required.
    pub stop_price: Option<Decimal>,
    /// Only reduce an existing position.
    pub reduce_only: bool,
}

impl PlaceOrderRequest {
    /// Build the outbound request for a local order.
    #[must_use]
    pub fn from_order(order: &Order) -> Self {
        Self {
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            time_in_force: order.time_in_force,
            quantity: order.quantity,
            price: order.price,
            stop_price: order.stop_price,
            reduce_only: order.reduce_only,
        }
    }
}

/// Venue acknowledgement of a placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    /// Venue-assigned order id.
    pub exchange_order_id: String,
    /// Echoed idempotency key.
    pub client_order_id: String,
}

/// Venue view of an order, returned by open/closed order queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrderStatus {
    /// Venue-assigned order id.
    pub exchange_order_id: String,
    /// Idempotency key the order was placed with.
    pub client_order_id: String,
    /// Trading pair symbol.
    pub symbol: String,
    /// Venue-reported lifecycle state.
    pub state: OrderState,
    /// Venue-reported cumulative filled quantity.
    pub filled_quantity: Decimal,
    /// Venue-reported average fill price.
    pub avg_price: Decimal,
}

/// One balance row in the venue account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeBalance {
    /// Asset symbol.
    pub asset: String,
    /// Freely available quantity.
    pub free: Decimal,
    /// Locked quantity.
    pub locked: Decimal,
}

/// One position row in the venue account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    /// Trading pair symbol.
    pub symbol: String,
    /// Signed open quantity (positive = long).
    pub quantity: Decimal,
    /// Venue-reported entry price.
    pub entry_price: Decimal,
}

/// Venue account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeAccountSnapshot {
    /// All balances.
    pub balances: Vec<ExchangeBalance>,
    /// All open positions.
    pub positions: Vec<ExchangePosition>,
    /// Snapshot time at the venue.
    pub timestamp: DateTime<Utc>,
}

/// Events delivered by the user-data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserStreamEvent {
    /// The venue changed an order's state.
    OrderUpdate {
        /// Venue-assigned order id.
        exchange_order_id: String,
        /// Idempotency key the order was placed with.
        client_order_id: String,
        /// Trading pair symbol.
        symbol: String,
        /// New venue-reported state.
        state: OrderState,
        /// Free-form venue reason (reject/cancel cause).
        reason: Option<String>,
    },
    /// An execution occurred.
    Fill(Fill),
    /// A balance changed.
    BalanceUpdate {
        /// Asset symbol.
        asset: String,
        /// Freely available quantity.
        free: Decimal,
        /// Locked quantity.
        locked: Decimal,
    },
    /// The stream (re)connected; local state may have missed events.
    Connected,
    /// The stream dropped; the adapter is reconnecting.
    Disconnected,
}

/// Errors from venue operations.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The venue definitively refused the request.
    #[error("exchange rejected: {message} (code {code})")]
    Rejected {
        /// Venue error code.
        code: i64,
        /// Venue error message.
        message: String,
    },

    /// HTTP 429 from the venue.
    #[error("exchange rate limited")]
    RateLimited,

    /// Network failure or 5xx; safe to retry.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// The request-level deadline elapsed. The outcome is unknown for
    /// mutations and must be resolved by reconciliation.
    #[error("exchange call timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// Signature or clock-skew failure. Unrecoverable without operator
    /// intervention.
    #[error("exchange auth failure: {0}")]
    Auth(String),

    /// The venue answered with something we cannot parse.
    #[error("exchange protocol error: {0}")]
    Protocol(String),
}

impl ExchangeError {
    /// Whether the operation may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Transient(_) | Self::Timeout { .. }
        )
    }

    /// Whether the outcome of a mutation is unknown.
    #[must_use]
    pub const fn is_indeterminate(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transient(_))
    }

    /// Map to the engine-wide error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected { .. } => ErrorKind::ExchangeRejected,
            Self::RateLimited | Self::Transient(_) => ErrorKind::Transient,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Auth(_) => ErrorKind::Fatal,
            Self::Protocol(_) => ErrorKind::Transient,
        }
    }
}

/// The operations the engine needs from the venue.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// Place an order. An `Ok` is a definitive acceptance; a
    /// [`ExchangeError::Rejected`] is a definitive refusal; everything else
    /// is indeterminate.
    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck, ExchangeError>;

    /// Cancel an order by venue id.
    async fn cancel_order(
        &self,
        symbol: &str,
        exchange_order_id: &str,
    ) -> Result<(), ExchangeError>;

    /// Fetch the full account snapshot (balances and positions).
    async fn get_account(&self) -> Result<ExchangeAccountSnapshot, ExchangeError>;

    /// List open orders, optionally filtered by symbol.
    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrderStatus>, ExchangeError>;

    /// Look up one order by its idempotency key. `Ok(None)` means the venue
    /// has never seen the key.
    async fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<ExchangeOrderStatus>, ExchangeError>;

    /// Open the user-data stream. Events arrive in source order per
    /// connection; a `Connected` event after a `Disconnected` marks a
    /// reconnect boundary across which ordering is not guaranteed.
    async fn subscribe_user_stream(
        &self,
    ) -> Result<mpsc::Receiver<UserStreamEvent>, ExchangeError>;
}
