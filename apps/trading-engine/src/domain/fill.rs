//! Execution fill records.
//!
//! Fills are append-only and are the sole lawful source of changes to an
//! order's `filled_quantity` and to realized P&L.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::OrderSide;

/// A single execution reported by the venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Venue-unique fill id, used for de-duplication.
    pub fill_id: String,
    /// The order this fill executes against.
    pub order_id: String,
    /// Trading pair symbol.
    pub symbol: String,
    /// Side of the filled order.
    pub side: OrderSide,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity.
    pub quantity: Decimal,
    /// Fee charged for this execution.
    pub fee: Decimal,
    /// Asset the fee was charged in.
    pub fee_asset: String,
    /// Whether the order was the resting (maker) side.
    pub is_maker: bool,
    /// Venue execution time.
    pub timestamp: DateTime<Utc>,
}

impl Fill {
    /// Notional value of this fill.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }

    /// Signed quantity under the long-positive convention.
    #[must_use]
    pub fn signed_quantity(&self) -> Decimal {
        self.side.signed(self.quantity)
    }
}
