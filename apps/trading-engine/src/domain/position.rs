//! Position tracking folded from fills.
//!
//! A position is entirely determined by the ordered stream of fills for its
//! symbol: side-matching fills extend the position at a weighted average
//! entry price, opposing fills realize P&L against that entry, and a fill
//! larger than the open quantity flips the position through zero.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::Signed;
use serde::{Deserialize, Serialize};

use super::fill::Fill;

/// A signed position for one symbol. Positive quantity is long.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Trading pair symbol.
    pub symbol: String,
    /// Signed open quantity (positive = long).
    pub quantity: Decimal,
    /// Weighted average entry price of the open quantity.
    pub avg_entry_price: Decimal,
    /// Cumulative realized P&L from closing fills (gross of fees).
    pub realized_pnl: Decimal,
    /// Cumulative fees across all fills for this symbol.
    pub total_fees: Decimal,
    /// Time of the last applied fill or correction.
    pub last_update: DateTime<Utc>,
}

/// What a single fill did to a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillEffect {
    /// Realized P&L contributed by this fill (gross of fees).
    pub realized_delta: Decimal,
    /// Quantity that closed against the prior open position.
    pub closed_quantity: Decimal,
    /// Whether the position ended flat or flipped sign, closing an episode.
    pub episode_closed: bool,
}

impl Position {
    /// A flat position for a symbol.
    #[must_use]
    pub fn flat(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            last_update: Utc::now(),
        }
    }

    /// Whether no quantity is open.
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Fold one fill into the position.
    pub fn apply_fill(&mut self, fill: &Fill) -> FillEffect {
        let signed = fill.signed_quantity();
        self.total_fees += fill.fee;
        self.last_update = fill.timestamp;

        // Same direction (or opening from flat): extend at weighted entry.
        if self.quantity.is_zero() || self.quantity.signum() == signed.signum() {
            let new_quantity = self.quantity + signed;
            let prior_notional = self.avg_entry_price * self.quantity.abs();
            self.avg_entry_price =
                (prior_notional + fill.price * signed.abs()) / new_quantity.abs();
            self.quantity = new_quantity;
            return FillEffect {
                realized_delta: Decimal::ZERO,
                closed_quantity: Decimal::ZERO,
                episode_closed: false,
            };
        }

        // Opposing direction: close up to the open quantity, then flip.
        let open_abs = self.quantity.abs();
        let fill_abs = signed.abs();
        let closed = open_abs.min(fill_abs);
        let direction = self.quantity.signum();
        let realized = direction * (fill.price - self.avg_entry_price) * closed;
        self.realized_pnl += realized;

        let remainder = fill_abs - closed;
        if remainder.is_zero() {
            self.quantity += signed;
            let episode_closed = self.quantity.is_zero();
            if episode_closed {
                self.avg_entry_price = Decimal::ZERO;
            }
            FillEffect {
                realized_delta: realized,
                closed_quantity: closed,
                episode_closed,
            }
        } else {
            // Crossed zero: the remainder opens a fresh position at the
            // fill price.
            self.quantity = signed.signum() * remainder;
            self.avg_entry_price = fill.price;
            FillEffect {
                realized_delta: realized,
                closed_quantity: closed,
                episode_closed: true,
            }
        }
    }

    /// Unrealized P&L at the given mark price.
    #[must_use]
    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Decimal {
        self.quantity * (mark_price - self.avg_entry_price)
    }

    /// Replace the open quantity with an exchange-authoritative value,
    /// keeping realized P&L and fee history.
    pub fn correct_quantity(&mut self, quantity: Decimal, entry_price: Decimal) {
        self.quantity = quantity;
        self.avg_entry_price = if quantity.is_zero() {
            Decimal::ZERO
        } else {
            entry_price
        };
        self.last_update = Utc::now();
    }
}
