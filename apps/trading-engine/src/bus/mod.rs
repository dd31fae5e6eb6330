//! In-process event bus.
//!
//! Components publish typed events here; the dashboard bridge, persistence
//! writers, and the account monitor subscribe. Each event maps to a bus
//! subject and serializes as a self-describing record with a schema
//! version, which is exactly what crosses the wire to external consumers.
//!
//! Fan-out uses tokio broadcast channels, one per subject family, so a slow
//! subscriber lags and drops on its own channel without affecting others.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::account::pnl::ClosedEpisode;
use crate::domain::alert::Alert;
use crate::domain::balance::Balance;
use crate::domain::fill::Fill;
use crate::domain::order::Order;
use crate::domain::position::Position;

/// Bus subjects produced by the engine.
pub mod subjects {
    /// Order lifecycle transitions.
    pub const ORDERS: &str = "trading.orders.updates";
    /// Executions.
    pub const FILLS: &str = "trading.fills";
    /// Position changes.
    pub const POSITIONS: &str = "trading.account.positions";
    /// Balance changes.
    pub const BALANCES: &str = "trading.account.balances";
    /// Operational alerts.
    pub const ALERTS: &str = "trading.alerts";
    /// Configuration changes.
    pub const CONFIG: &str = "config.updates";
    /// Market ticks (per-symbol suffix on the wire).
    pub const MARKET_TICKS: &str = "market.ticks";
}

/// Schema version stamped on every outbound record.
pub const SCHEMA_VERSION: u32 = 1;

/// An order transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdateEvent {
    /// Snapshot of the order after the transition.
    pub order: Order,
    /// Cause of the transition.
    pub reason: Option<String>,
}

/// A market tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTick {
    /// Trading pair symbol.
    pub symbol: String,
    /// Best bid.
    pub bid: Decimal,
    /// Best ask.
    pub ask: Decimal,
    /// Last traded price.
    pub last: Decimal,
    /// Venue timestamp.
    pub timestamp: DateTime<Utc>,
}

impl MarketTick {
    /// Mid price of the tick.
    #[must_use]
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// A configuration change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChangeEvent {
    /// Configuration key.
    pub key: String,
    /// Configuration type.
    pub config_type: String,
    /// Version that became active.
    pub version: u64,
    /// What happened (`create`, `update`, `activate`, `rollback`).
    pub action: String,
}

/// Self-describing record as it crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusRecord {
    /// Bus subject.
    pub subject: String,
    /// Payload schema version.
    pub schema_version: u32,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
    /// Subject-specific payload.
    pub payload: serde_json::Value,
}

impl BusRecord {
    fn new(subject: &str, payload: &impl Serialize) -> Self {
        Self {
            subject: subject.to_string(),
            schema_version: SCHEMA_VERSION,
            timestamp: Utc::now(),
            // Serialization of engine-owned types cannot fail.
            #[allow(clippy::expect_used)]
            payload: serde_json::to_value(payload).expect("event serializes"),
        }
    }
}

/// Capacities for the bus channels.
#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    /// Capacity of the order update channel.
    pub orders_capacity: usize,
    /// Capacity of the fill channel.
    pub fills_capacity: usize,
    /// Capacity of the position channel.
    pub positions_capacity: usize,
    /// Capacity of the balance channel.
    pub balances_capacity: usize,
    /// Capacity of the alert channel.
    pub alerts_capacity: usize,
    /// Capacity of the config change channel.
    pub config_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            orders_capacity: 4_096,
            fills_capacity: 4_096,
            positions_capacity: 1_024,
            balances_capacity: 1_024,
            alerts_capacity: 256,
            config_capacity: 256,
        }
    }
}

/// Central hub for engine events.
#[derive(Debug)]
pub struct EventBus {
    orders_tx: broadcast::Sender<OrderUpdateEvent>,
    fills_tx: broadcast::Sender<Fill>,
    positions_tx: broadcast::Sender<Position>,
    balances_tx: broadcast::Sender<Balance>,
    alerts_tx: broadcast::Sender<Alert>,
    config_tx: broadcast::Sender<ConfigChangeEvent>,
    episodes_tx: broadcast::Sender<ClosedEpisode>,
}

impl EventBus {
    /// Create a bus with the given channel capacities.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            orders_tx: broadcast::channel(config.orders_capacity).0,
            fills_tx: broadcast::channel(config.fills_capacity).0,
            positions_tx: broadcast::channel(config.positions_capacity).0,
            balances_tx: broadcast::channel(config.balances_capacity).0,
            alerts_tx: broadcast::channel(config.alerts_capacity).0,
            config_tx: broadcast::channel(config.config_capacity).0,
            episodes_tx: broadcast::channel(256).0,
        }
    }

    /// Create a bus with default capacities.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BusConfig::default())
    }

    /// Publish an order transition.
    pub fn publish_order_update(&self, event: OrderUpdateEvent) {
        let _ = self.orders_tx.send(event);
    }

    /// Publish a fill.
    pub fn publish_fill(&self, fill: Fill) {
        let _ = self.fills_tx.send(fill);
    }

    /// Publish a position change.
    pub fn publish_position(&self, position: Position) {
        let _ = self.positions_tx.send(position);
    }

    /// Publish a balance change.
    pub fn publish_balance(&self, balance: Balance) {
        let _ = self.balances_tx.send(balance);
    }

    /// Publish an alert.
    pub fn publish_alert(&self, alert: Alert) {
        let _ = self.alerts_tx.send(alert);
    }

    /// Publish a configuration change.
    pub fn publish_config_change(&self, event: ConfigChangeEvent) {
        let _ = self.config_tx.send(event);
    }

    /// Publish a closed P&L episode.
    pub fn publish_episode(&self, episode: ClosedEpisode) {
        let _ = self.episodes_tx.send(episode);
    }

    /// Subscribe to order transitions.
    #[must_use]
    pub fn orders_rx(&self) -> broadcast::Receiver<OrderUpdateEvent> {
        self.orders_tx.subscribe()
    }

    /// Subscribe to fills.
    #[must_use]
    pub fn fills_rx(&self) -> broadcast::Receiver<Fill> {
        self.fills_tx.subscribe()
    }

    /// Subscribe to position changes.
    #[must_use]
    pub fn positions_rx(&self) -> broadcast::Receiver<Position> {
        self.positions_tx.subscribe()
    }

    /// Subscribe to balance changes.
    #[must_use]
    pub fn balances_rx(&self) -> broadcast::Receiver<Balance> {
        self.balances_tx.subscribe()
    }

    /// Subscribe to alerts.
    #[must_use]
    pub fn alerts_rx(&self) -> broadcast::Receiver<Alert> {
        self.alerts_tx.subscribe()
    }

    /// Subscribe to configuration changes.
    #[must_use]
    pub fn config_rx(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.config_tx.subscribe()
    }

    /// Subscribe to closed P&L episodes.
    #[must_use]
    pub fn episodes_rx(&self) -> broadcast::Receiver<ClosedEpisode> {
        self.episodes_tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Wire encoding of engine events, used by the event-stream bridge.
pub mod wire {
    use super::{
        Alert, Balance, BusRecord, ConfigChangeEvent, Fill, MarketTick, OrderUpdateEvent,
        Position, subjects,
    };

    /// Encode an order update.
    #[must_use]
    pub fn order_update(event: &OrderUpdateEvent) -> BusRecord {
        BusRecord::new(subjects::ORDERS, event)
    }

    /// Encode a fill.
    #[must_use]
    pub fn fill(fill: &Fill) -> BusRecord {
        BusRecord::new(subjects::FILLS, fill)
    }

    /// Encode a position.
    #[must_use]
    pub fn position(position: &Position) -> BusRecord {
        BusRecord::new(subjects::POSITIONS, position)
    }

    /// Encode a balance.
    #[must_use]
    pub fn balance(balance: &Balance) -> BusRecord {
        BusRecord::new(subjects::BALANCES, balance)
    }

    /// Encode an alert.
    #[must_use]
    pub fn alert(alert: &Alert) -> BusRecord {
        BusRecord::new(subjects::ALERTS, alert)
    }

    /// Encode a config change.
    #[must_use]
    pub fn config_change(event: &ConfigChangeEvent) -> BusRecord {
        BusRecord::new(subjects::CONFIG, event)
    }

    /// Encode a market tick with the per-symbol subject suffix.
    #[must_use]
    pub fn market_tick(tick: &MarketTick) -> BusRecord {
        let mut record = BusRecord::new(subjects::MARKET_TICKS, tick);
        record.subject = format!("{}.{}", subjects::MARKET_TICKS, tick.symbol);
        record
    }
}
