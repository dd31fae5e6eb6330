//! Market data bus: per-symbol last-tick cache plus in-process fan-out.
//!
//! Fed from the external market feed; consumers read the cache for mark
//! prices (unrealized P&L, risk metrics) or subscribe for the live stream.

use std::collections::HashMap;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::broadcast;

use crate::bus::MarketTick;

/// Last-tick cache with broadcast fan-out.
#[derive(Debug)]
pub struct MarketDataBus {
    ticks_tx: broadcast::Sender<MarketTick>,
    last_ticks: RwLock<HashMap<String, MarketTick>>,
}

impl MarketDataBus {
    /// Create a bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            ticks_tx: broadcast::channel(capacity).0,
            last_ticks: RwLock::new(HashMap::new()),
        }
    }

    /// Publish a tick: updates the cache, then fans out.
    pub fn publish(&self, tick: MarketTick) {
        self.last_ticks
            .write()
            .insert(tick.symbol.clone(), tick.clone());
        let _ = self.ticks_tx.send(tick);
    }

    /// Latest tick for a symbol, if any has been seen.
    #[must_use]
    pub fn last_tick(&self, symbol: &str) -> Option<MarketTick> {
        self.last_ticks.read().get(symbol).cloned()
    }

    /// Latest mark (mid) price for a symbol.
    #[must_use]
    pub fn mark_price(&self, symbol: &str) -> Option<Decimal> {
        self.last_tick(symbol).map(|t| t.mid())
    }

    /// Subscribe to the live tick stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MarketTick> {
        self.ticks_tx.subscribe()
    }

    /// Symbols with a cached tick.
    #[must_use]
    pub fn known_symbols(&self) -> Vec<String> {
        self.last_ticks.read().keys().cloned().collect()
    }
}

impl Default for MarketDataBus {
    fn default() -> Self {
        Self::new(8_192)
    }
}
