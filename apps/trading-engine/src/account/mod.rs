//! Account monitor: authoritative local view of positions, balances, P&L.
//!
//! Fills fold into positions under a per-symbol write lock; balances are
//! replaced wholesale from stream events or reconciliation. All changes are
//! published on the event bus. Fill application is idempotent by `fill_id`.

pub mod alerts;
pub mod pnl;
pub mod reconciler;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bus::EventBus;
use crate::domain::alert::{Alert, AlertKind};
use crate::domain::balance::Balance;
use crate::domain::fill::Fill;
use crate::domain::position::Position;
use crate::marketdata::MarketDataBus;

pub use alerts::AlertEmitter;
pub use pnl::{ClosedEpisode, PnlStats, PnlTracker};
pub use reconciler::{AccountReconciler, ReconcileReport, ReconcilerConfig};

/// Account-level alerting thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountThresholds {
    /// Asset equity is denominated in.
    pub quote_asset: String,
    /// Alert when the quote asset's free balance drops below this.
    pub low_balance_floor: Decimal,
    /// Alert when drawdown exceeds this percentage.
    pub drawdown_limit_pct: Decimal,
    /// Alert when the margin ratio exceeds this value.
    pub margin_ratio_limit: Decimal,
}

impl Default for AccountThresholds {
    fn default() -> Self {
        Self {
            quote_asset: "USDT".to_string(),
            low_balance_floor: Decimal::ZERO,
            drawdown_limit_pct: Decimal::from(100),
            margin_ratio_limit: Decimal::ONE,
        }
    }
}

/// Full account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Open positions.
    pub positions: Vec<Position>,
    /// Balances.
    pub balances: Vec<Balance>,
    /// Equity: quote balance plus unrealized P&L at current marks.
    pub equity: Decimal,
    /// Sum of position notionals over equity; zero when equity is zero.
    pub margin_ratio: Decimal,
    /// Percent decline from the equity high-water mark.
    pub drawdown_pct: Decimal,
    /// Unrealized P&L across all positions.
    pub unrealized_pnl: Decimal,
    /// Win/loss statistics over closed episodes.
    pub pnl: PnlStats,
    /// Snapshot time.
    pub timestamp: DateTime<Utc>,
}

/// Authoritative local account state.
pub struct AccountMonitor {
    positions: RwLock<HashMap<String, Position>>,
    balances: RwLock<HashMap<String, Balance>>,
    seen_fills: Mutex<HashSet<String>>,
    pnl: Mutex<PnlTracker>,
    peak_equity: RwLock<Decimal>,
    thresholds: AccountThresholds,
    bus: Arc<EventBus>,
    marketdata: Arc<MarketDataBus>,
    alerts: AlertEmitter,
}

impl AccountMonitor {
    /// Create an empty monitor.
    #[must_use]
    pub fn new(
        bus: Arc<EventBus>,
        marketdata: Arc<MarketDataBus>,
        thresholds: AccountThresholds,
    ) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
            seen_fills: Mutex::new(HashSet::new()),
            pnl: Mutex::new(PnlTracker::new()),
            peak_equity: RwLock::new(Decimal::ZERO),
            thresholds,
            alerts: AlertEmitter::new(Arc::clone(&bus)),
            bus,
            marketdata,
        }
    }

    /// Fold a fill into its symbol's position. Duplicate `fill_id`s are
    /// ignored (idempotent replay across stream reconnects).
    ///
    /// Returns the closed episode when the fill flattened the position.
    pub fn apply_fill(&self, fill: &Fill) -> Option<ClosedEpisode> {
        if !self.seen_fills.lock().insert(fill.fill_id.clone()) {
            tracing::debug!(fill_id = %fill.fill_id, "duplicate fill ignored");
            return None;
        }

        let (position, effect) = {
            let mut positions = self.positions.write();
            let position = positions
                .entry(fill.symbol.clone())
                .or_insert_with(|| Position::flat(fill.symbol.clone()));
            let effect = position.apply_fill(fill);
            (position.clone(), effect)
        };

        let closed = {
            let mut pnl = self.pnl.lock();
            let closed = pnl.record(fill, &effect);
            if effect.episode_closed && !position.is_flat() {
                pnl.reopen_after_flip(&fill.symbol, fill.timestamp);
            }
            closed
        };

        metrics::counter!("fills_applied").increment(1);
        self.bus.publish_position(position);
        closed
    }

    /// Replace an asset's balance snapshot.
    pub fn update_balance(&self, asset: &str, free: Decimal, locked: Decimal) {
        let balance = Balance::new(asset, free, locked);
        if !balance.is_valid() {
            tracing::warn!(asset, %free, %locked, "ignoring negative balance snapshot");
            return;
        }
        self.balances
            .write()
            .insert(asset.to_string(), balance.clone());
        self.bus.publish_balance(balance);
    }

    /// Unrealized P&L for one symbol at a mark price.
    #[must_use]
    pub fn compute_unrealized(&self, symbol: &str, mark_price: Decimal) -> Decimal {
        self.positions
            .read()
            .get(symbol)
            .map_or(Decimal::ZERO, |p| p.unrealized_pnl(mark_price))
    }

    /// Current position for a symbol.
    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    /// Current balance for an asset.
    #[must_use]
    pub fn balance(&self, asset: &str) -> Option<Balance> {
        self.balances.read().get(asset).cloned()
    }

    /// Build the full account snapshot and advance the equity high-water
    /// mark.
    #[must_use]
    pub fn snapshot(&self) -> AccountSnapshot {
        let positions: Vec<Position> = self.positions.read().values().cloned().collect();
        let balances: Vec<Balance> = self.balances.read().values().cloned().collect();

        let quote_balance = balances
            .iter()
            .find(|b| b.asset == self.thresholds.quote_asset)
            .map_or(Decimal::ZERO, Balance::total);

        let mut unrealized = Decimal::ZERO;
        let mut gross_notional = Decimal::ZERO;
        for position in &positions {
            if let Some(mark) = self.marketdata.mark_price(&position.symbol) {
                unrealized += position.unrealized_pnl(mark);
                gross_notional += (position.quantity * mark).abs();
            }
        }

        let equity = quote_balance + unrealized;
        let peak = {
            let mut peak = self.peak_equity.write();
            if equity > *peak {
                *peak = equity;
            }
            *peak
        };
        let drawdown_pct = if peak > Decimal::ZERO {
            (peak - equity) / peak * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
        let margin_ratio = if equity > Decimal::ZERO {
            gross_notional / equity
        } else {
            Decimal::ZERO
        };

        AccountSnapshot {
            positions,
            balances,
            equity,
            margin_ratio,
            drawdown_pct,
            unrealized_pnl: unrealized,
            pnl: self.pnl.lock().stats(),
            timestamp: Utc::now(),
        }
    }

    /// Evaluate account thresholds and emit alerts for breaches.
    pub fn check_thresholds(&self) -> AccountSnapshot {
        let snapshot = self.snapshot();

        let quote_free = self
            .balance(&self.thresholds.quote_asset)
            .map_or(Decimal::ZERO, |b| b.free);
        if quote_free < self.thresholds.low_balance_floor {
            self.alerts.emit(
                Alert::new(
                    AlertKind::LowBalance,
                    format!(
                        "free {} balance {quote_free} below floor {}",
                        self.thresholds.quote_asset, self.thresholds.low_balance_floor
                    ),
                )
                .with_subject(self.thresholds.quote_asset.clone()),
            );
        }
        if snapshot.drawdown_pct > self.thresholds.drawdown_limit_pct {
            self.alerts.emit(Alert::new(
                AlertKind::HighDrawdown,
                format!(
                    "drawdown {:.2}% exceeds limit {}%",
                    snapshot.drawdown_pct, self.thresholds.drawdown_limit_pct
                ),
            ));
        }
        if snapshot.margin_ratio > self.thresholds.margin_ratio_limit {
            self.alerts.emit(Alert::new(
                AlertKind::HighMarginRatio,
                format!(
                    "margin ratio {:.4} exceeds limit {}",
                    snapshot.margin_ratio, self.thresholds.margin_ratio_limit
                ),
            ));
        }
        snapshot
    }

    /// Alert emitter, shared with the reconciler.
    #[must_use]
    pub fn alert_emitter(&self) -> &AlertEmitter {
        &self.alerts
    }

    // ========================================================================
    // Reconciliation corrections (exchange is authoritative)
    // ========================================================================

    /// Replace a position's open quantity with the exchange value.
    pub fn correct_position(&self, symbol: &str, quantity: Decimal, entry_price: Decimal) {
        let position = {
            let mut positions = self.positions.write();
            let position = positions
                .entry(symbol.to_string())
                .or_insert_with(|| Position::flat(symbol.to_string()));
            position.correct_quantity(quantity, entry_price);
            position.clone()
        };
        self.bus.publish_position(position);
    }

    /// Replace an asset's balance with the exchange value.
    pub fn correct_balance(&self, asset: &str, free: Decimal, locked: Decimal) {
        self.update_balance(asset, free, locked);
    }
}
