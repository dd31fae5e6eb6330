//! Order aggregate and lifecycle state machine.
//!
//! The order state machine admits only the transitions below; anything
//! else is a programming error surfaced as [`OrderError::InvalidTransition`].
//!
//! ```text
//! NEW → SUBMITTED | REJECTED
//! SUBMITTED → PARTIALLY_FILLED | FILLED | CANCELED | REJECTED | EXPIRED
//! PARTIALLY_FILLED → FILLED | CANCELED
//! {FILLED, CANCELED, REJECTED, EXPIRED} terminal
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::fill::Fill;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    /// Buy (long).
    Buy,
    /// Sell (short).
    Sell,
}

impl OrderSide {
    /// The opposing side.
    #[must_use]
    pub const fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Sign convention: buys add to a position, sells subtract.
    #[must_use]
    pub fn signed(&self, quantity: Decimal) -> Decimal {
        match self {
            Self::Buy => quantity,
            Self::Sell => -quantity,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Execute immediately at the best available price.
    Market,
    /// Execute at the limit price or better.
    Limit,
    /// Market order triggered at the stop price.
    StopMarket,
    /// Limit order triggered at the stop price.
    StopLimit,
    /// Limit order that must rest on the book (maker-only).
    PostOnly,
}

impl OrderType {
    /// Whether this type requires a limit price.
    #[must_use]
    pub const fn requires_price(&self) -> bool {
        matches!(self, Self::Limit | Self::StopLimit | Self::PostOnly)
    }

    /// Whether this type requires a stop price.
    #[must_use]
    pub const fn requires_stop_price(&self) -> bool {
        matches!(self, Self::StopMarket | Self::StopLimit)
    }
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    /// Good till canceled.
    Gtc,
    /// Immediate or cancel.
    Ioc,
    /// Fill or kill.
    Fok,
    /// Good till crossing (post-only semantics on the venue).
    Gtx,
}

/// Order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    /// Created locally, not yet acknowledged by the venue.
    New,
    /// Acknowledged by the venue, resting or working.
    Submitted,
    /// Some quantity executed, remainder working.
    PartiallyFilled,
    /// Fully executed.
    Filled,
    /// Canceled before full execution.
    Canceled,
    /// Refused by validation, risk, or the venue.
    Rejected,
    /// Expired by time-in-force rules.
    Expired,
}

impl OrderState {
    /// Whether this state is terminal (immutable).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }

    /// Whether fills may be applied in this state.
    #[must_use]
    pub const fn can_fill(&self) -> bool {
        matches!(self, Self::Submitted | Self::PartiallyFilled)
    }

    /// Whether the order may be canceled from this state.
    #[must_use]
    pub const fn is_cancelable(&self) -> bool {
        matches!(self, Self::Submitted | Self::PartiallyFilled)
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Submitted => "SUBMITTED",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

/// Errors from order lifecycle operations.
#[derive(Debug, Error)]
pub enum OrderError {
    /// The requested transition is not in the lifecycle graph.
    #[error("invalid order transition {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: OrderState,
        /// Requested state.
        to: OrderState,
    },

    /// Fills are not accepted in the current state.
    #[error("cannot apply fill in state {state}")]
    CannotFill {
        /// Current state.
        state: OrderState,
    },

    /// The fill would push `filled_quantity` above `quantity`.
    #[error("fill of {fill_quantity} overflows order: {filled} already filled of {quantity}")]
    FillOverflow {
        /// Quantity of the offending fill.
        fill_quantity: Decimal,
        /// Quantity filled before the offending fill.
        filled: Decimal,
        /// Total order quantity.
        quantity: Decimal,
    },

    /// The order cannot be canceled in the current state.
    #[error("cannot cancel order in state {state}")]
    CannotCancel {
        /// Current state.
        state: OrderState,
    },

    /// Fill quantity or price is non-positive.
    #[error("fill {fill_id} has non-positive quantity or price")]
    BadFill {
        /// Offending fill id.
        fill_id: String,
    },
}

/// Validates order state transitions.
pub struct OrderStateMachine;

impl OrderStateMachine {
    /// Check if a state transition is valid.
    #[must_use]
    pub fn is_valid_transition(from: OrderState, to: OrderState) -> bool {
        matches!(
            (from, to),
            (OrderState::New, OrderState::Submitted)
                | (OrderState::New, OrderState::Rejected)
                | (OrderState::Submitted, OrderState::PartiallyFilled)
                | (OrderState::Submitted, OrderState::Filled)
                | (OrderState::Submitted, OrderState::Canceled)
                | (OrderState::Submitted, OrderState::Rejected)
                | (OrderState::Submitted, OrderState::Expired)
                | (OrderState::PartiallyFilled, OrderState::Filled)
                | (OrderState::PartiallyFilled, OrderState::Canceled)
        )
    }

    /// Validate a transition, returning a typed error when illegal.
    pub fn validate_transition(from: OrderState, to: OrderState) -> Result<(), OrderError> {
        if Self::is_valid_transition(from, to) {
            Ok(())
        } else {
            Err(OrderError::InvalidTransition { from, to })
        }
    }

    /// All valid next states from a given state.
    #[must_use]
    pub fn valid_next_states(from: OrderState) -> Vec<OrderState> {
        match from {
            OrderState::New => vec![OrderState::Submitted, OrderState::Rejected],
            OrderState::Submitted => vec![
                OrderState::PartiallyFilled,
                OrderState::Filled,
                OrderState::Canceled,
                OrderState::Rejected,
                OrderState::Expired,
            ],
            OrderState::PartiallyFilled => vec![OrderState::Filled, OrderState::Canceled],
            OrderState::Filled
            | OrderState::Canceled
            | OrderState::Rejected
            | OrderState::Expired => vec![],
        }
    }
}

/// An order tracked by the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Process-unique order id.
    pub order_id: String,
    /// Caller-supplied idempotency key, stable across retries.
    pub client_order_id: String,
    /// Venue-assigned id, set on acceptance.
    pub exchange_order_id: Option<String>,
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
    /// Limit price, when the type requires one.
    pub price: Option<Decimal>,
    /// Stop trigger price, when the type requires one.
    pub stop_price: Option<Decimal>,
    /// Cumulative executed quantity.
    pub filled_quantity: Decimal,
    /// Size-weighted average fill price.
    pub avg_price: Decimal,
    /// Total fees charged across fills.
    pub fees_total: Decimal,
    /// Lifecycle state.
    pub state: OrderState,
    /// Only reduce an existing position.
    pub reduce_only: bool,
    /// Maker-only flag.
    pub post_only: bool,
    /// Originating strategy.
    pub strategy_id: String,
    /// Free-form reason for the last transition (reject/cancel cause).
    pub state_reason: Option<String>,
    /// Submission outcome unknown; reconciliation must resolve it.
    pub pending_reconcile: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Remaining unexecuted quantity.
    #[must_use]
    pub fn leaves_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    /// Notional value at the limit price (zero for market orders).
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.price.map_or(Decimal::ZERO, |p| p * self.quantity)
    }

    /// Transition to `SUBMITTED` with the venue-assigned id.
    pub fn mark_submitted(&mut self, exchange_order_id: String) -> Result<(), OrderError> {
        OrderStateMachine::validate_transition(self.state, OrderState::Submitted)?;
        self.exchange_order_id = Some(exchange_order_id);
        self.state = OrderState::Submitted;
        self.pending_reconcile = false;
        self.touch();
        Ok(())
    }

    /// Transition to `REJECTED` with a reason.
    pub fn mark_rejected(&mut self, reason: impl Into<String>) -> Result<(), OrderError> {
        OrderStateMachine::validate_transition(self.state, OrderState::Rejected)?;
        self.state = OrderState::Rejected;
        self.state_reason = Some(reason.into());
        self.pending_reconcile = false;
        self.touch();
        Ok(())
    }

    /// Transition to `CANCELED`.
    pub fn mark_canceled(&mut self, reason: impl Into<String>) -> Result<(), OrderError> {
        if !self.state.is_cancelable() {
            return Err(OrderError::CannotCancel { state: self.state });
        }
        OrderStateMachine::validate_transition(self.state, OrderState::Canceled)?;
        self.state = OrderState::Canceled;
        self.state_reason = Some(reason.into());
        self.touch();
        Ok(())
    }

    /// Transition to `EXPIRED` (venue-reported time-in-force expiry).
    pub fn mark_expired(&mut self) -> Result<(), OrderError> {
        OrderStateMachine::validate_transition(self.state, OrderState::Expired)?;
        self.state = OrderState::Expired;
        self.touch();
        Ok(())
    }

    /// Apply a fill, updating cumulative quantity, weighted average price,
    /// fees, and state.
    ///
    /// The caller is responsible for `fill_id` de-duplication; this method
    /// enforces the overflow invariant and never clamps.
    pub fn apply_fill(&mut self, fill: &Fill) -> Result<(), OrderError> {
        if !self.state.can_fill() {
            return Err(OrderError::CannotFill { state: self.state });
        }
        if fill.quantity <= Decimal::ZERO || fill.price <= Decimal::ZERO {
            return Err(OrderError::BadFill {
                fill_id: fill.fill_id.clone(),
            });
        }

        let new_filled = self.filled_quantity + fill.quantity;
        if new_filled > self.quantity {
            return Err(OrderError::FillOverflow {
                fill_quantity: fill.quantity,
                filled: self.filled_quantity,
                quantity: self.quantity,
            });
        }

        // Size-weighted average across all fills.
        let prior_notional = self.avg_price * self.filled_quantity;
        self.avg_price = (prior_notional + fill.price * fill.quantity) / new_filled;
        self.filled_quantity = new_filled;
        self.fees_total += fill.fee;

        let next = if self.filled_quantity == self.quantity {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        if self.state != next {
            OrderStateMachine::validate_transition(self.state, next)?;
            self.state = next;
        }
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
