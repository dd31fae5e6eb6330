//! Asset balances.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Balance for a single asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Asset symbol (e.g. `USDT`, `BTC`).
    pub asset: String,
    /// Freely available quantity.
    pub free: Decimal,
    /// Quantity locked by open orders or margin.
    pub locked: Decimal,
    /// Optional USD valuation of the total.
    pub usd_value: Option<Decimal>,
    /// Time of the last snapshot.
    pub last_update: DateTime<Utc>,
}

impl Balance {
    /// Create a balance snapshot.
    #[must_use]
    pub fn new(asset: impl Into<String>, free: Decimal, locked: Decimal) -> Self {
        Self {
            asset: asset.into(),
            free,
            locked,
            usd_value: None,
            last_update: Utc::now(),
        }
    }

    /// Total quantity (`free + locked`).
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }

    /// Whether the snapshot satisfies the non-negativity invariant.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.free >= Decimal::ZERO && self.locked >= Decimal::ZERO
    }
}
