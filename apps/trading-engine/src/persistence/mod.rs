//! Durable state for crash recovery and audit.
//!
//! Uses Turso (Rust rewrite of `SQLite`). Monetary fields are stored as
//! decimal strings, never floats. Fill writes are idempotent by `fill_id`
//! (`INSERT OR IGNORE`), so the asynchronous writer can replay bus events
//! safely. On startup the engine reloads non-terminal orders and lets the
//! reconciliation loop resolve whatever was in flight when the process
//! died.

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use turso::{Builder, Database, Error as TursoError, Row, Value};

use crate::account::pnl::ClosedEpisode;
use crate::bus::EventBus;
use crate::domain::alert::Alert;
use crate::domain::fill::Fill;
use crate::domain::order::{Order, OrderSide, OrderState, OrderType, TimeInForce};

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Database connection error.
    #[error("database connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("query error: {0}")]
    Query(String),

    /// A stored row is missing or malformed.
    #[error("bad row: {0}")]
    BadRow(String),
}

impl From<TursoError> for PersistenceError {
    fn from(err: TursoError) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Durable store for orders, fills, alerts, and P&L history.
pub struct TradingStore {
    db: Database,
}

impl TradingStore {
    /// Open (and migrate) a database file.
    pub async fn open(path: &str) -> Result<Self, PersistenceError> {
        let db = Builder::new_local(path).build().await?;
        Self::run_migrations(&db).await?;
        Ok(Self { db })
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self, PersistenceError> {
        Self::open(":memory:").await
    }

    async fn run_migrations(db: &Database) -> Result<(), PersistenceError> {
        let conn = db.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                client_order_id TEXT NOT NULL UNIQUE,
                exchange_order_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                time_in_force TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT,
                stop_price TEXT,
                filled_quantity TEXT NOT NULL,
                avg_price TEXT NOT NULL,
                fees_total TEXT NOT NULL,
                state TEXT NOT NULL,
                reduce_only INTEGER NOT NULL DEFAULT 0,
                post_only INTEGER NOT NULL DEFAULT 0,
                strategy_id TEXT NOT NULL,
                state_reason TEXT,
                pending_reconcile INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_orders_state ON orders(state);
            CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders(symbol);

            CREATE TABLE IF NOT EXISTS fills (
                fill_id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                fee TEXT NOT NULL,
                fee_asset TEXT NOT NULL,
                is_maker INTEGER NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_fills_order ON fills(order_id);

            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                subject TEXT,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pnl_episodes (
                symbol TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                fees TEXT NOT NULL,
                net_pnl TEXT NOT NULL,
                PRIMARY KEY (symbol, closed_at)
            );

            CREATE TABLE IF NOT EXISTS reconciliation_runs (
                run_at TEXT NOT NULL,
                balance_drifts INTEGER NOT NULL,
                position_drifts INTEGER NOT NULL,
                ignored_drifts INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL
            );",
        )
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;
        tracing::info!("persistence migrations complete");
        Ok(())
    }

    /// Upsert an order row.
    pub async fn save_order(&self, order: &Order) -> Result<(), PersistenceError> {
        let conn = self.db.connect()?;
        let params: Vec<Value> = vec![
            Value::Text(order.order_id.clone()),
            Value::Text(order.client_order_id.clone()),
            opt_text(order.exchange_order_id.clone()),
            Value::Text(order.symbol.clone()),
            Value::Text(format!("{:?}", order.side)),
            Value::Text(format!("{:?}", order.order_type)),
            Value::Text(format!("{:?}", order.time_in_force)),
            Value::Text(order.quantity.to_string()),
            opt_text(order.price.map(|p| p.to_string())),
            opt_text(order.stop_price.map(|p| p.to_string())),
            Value::Text(order.filled_quantity.to_string()),
            Value::Text(order.avg_price.to_string()),
            Value::Text(order.fees_total.to_string()),
            Value::Text(order.state.to_string()),
            Value::Integer(i64::from(order.reduce_only)),
            Value::Integer(i64::from(order.post_only)),
            Value::Text(order.strategy_id.clone()),
            opt_text(order.state_reason.clone()),
            Value::Integer(i64::from(order.pending_reconcile)),
            Value::Text(order.created_at.to_rfc3339()),
            Value::Text(order.updated_at.to_rfc3339()),
        ];

        conn.execute(
            "INSERT OR REPLACE INTO orders (
                order_id, client_order_id, exchange_order_id, symbol, side,
                order_type, time_in_force, quantity, price, stop_price,
                filled_quantity, avg_price, fees_total, state, reduce_only,
                post_only, strategy_id, state_reason, pending_reconcile,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params,
        )
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;
        Ok(())
    }

    /// Insert a fill; duplicates by `fill_id` are ignored.
    pub async fn save_fill(&self, fill: &Fill) -> Result<(), PersistenceError> {
        let conn = self.db.connect()?;
        let params: Vec<Value> = vec![
            Value::Text(fill.fill_id.clone()),
            Value::Text(fill.order_id.clone()),
            Value::Text(fill.symbol.clone()),
            Value::Text(format!("{:?}", fill.side)),
            Value::Text(fill.price.to_string()),
            Value::Text(fill.quantity.to_string()),
            Value::Text(fill.fee.to_string()),
            Value::Text(fill.fee_asset.clone()),
            Value::Integer(i64::from(fill.is_maker)),
            Value::Text(fill.timestamp.to_rfc3339()),
        ];

        conn.execute(
            "INSERT OR IGNORE INTO fills (
                fill_id, order_id, symbol, side, price, quantity, fee,
                fee_asset, is_maker, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params,
        )
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;
        Ok(())
    }

    /// Persist an alert.
    pub async fn save_alert(&self, alert: &Alert) -> Result<(), PersistenceError> {
        let conn = self.db.connect()?;
        let params: Vec<Value> = vec![
            Value::Text(alert.id.clone()),
            Value::Text(alert.kind.code().to_string()),
            Value::Text(format!("{:?}", alert.severity)),
            Value::Text(alert.message.clone()),
            opt_text(alert.subject.clone()),
            Value::Text(alert.timestamp.to_rfc3339()),
        ];
        conn.execute(
            "INSERT OR IGNORE INTO alerts (id, kind, severity, message, subject, timestamp)
             VALUES (?, ?, ?, ?, ?, ?)",
            params,
        )
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;
        Ok(())
    }

    /// Persist a closed P&L episode.
    pub async fn save_episode(&self, episode: &ClosedEpisode) -> Result<(), PersistenceError> {
        let conn = self.db.connect()?;
        let params: Vec<Value> = vec![
            Value::Text(episode.symbol.clone()),
            Value::Text(episode.opened_at.to_rfc3339()),
            Value::Text(episode.closed_at.to_rfc3339()),
            Value::Text(episode.realized_pnl.to_string()),
            Value::Text(episode.fees.to_string()),
            Value::Text(episode.net_pnl.to_string()),
        ];
        conn.execute(
            "INSERT OR REPLACE INTO pnl_episodes (
                symbol, opened_at, closed_at, realized_pnl, fees, net_pnl
            ) VALUES (?, ?, ?, ?, ?, ?)",
            params,
        )
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;
        Ok(())
    }

    /// Record one reconciliation run for the time-series surface.
    pub async fn save_reconciliation_run(
        &self,
        report: &crate::account::ReconcileReport,
    ) -> Result<(), PersistenceError> {
        let conn = self.db.connect()?;
        let params: Vec<Value> = vec![
            Value::Text(chrono::Utc::now().to_rfc3339()),
            Value::Integer(i64::from(report.balance_drifts)),
            Value::Integer(i64::from(report.position_drifts)),
            Value::Integer(i64::from(report.ignored_drifts)),
            Value::Integer(report.duration_ms as i64),
        ];
        conn.execute(
            "INSERT INTO reconciliation_runs (
                run_at, balance_drifts, position_drifts, ignored_drifts, duration_ms
            ) VALUES (?, ?, ?, ?, ?)",
            params,
        )
        .await
        .map_err(|e| PersistenceError::Query(e.to_string()))?;
        Ok(())
    }

    /// Load all non-terminal orders for crash recovery. Orders that were
    /// in `NEW` when the process died come back marked `pending_reconcile`
    /// so the reconciler can resolve them.
    pub async fn load_open_orders(&self) -> Result<Vec<Order>, PersistenceError> {
        let conn = self.db.connect()?;
        let mut rows = conn
            .query(
                "SELECT order_id, client_order_id, exchange_order_id, symbol, side,
                        order_type, time_in_force, quantity, price, stop_price,
                        filled_quantity, avg_price, fees_total, state, reduce_only,
                        post_only, strategy_id, state_reason, pending_reconcile,
                        created_at, updated_at
                 FROM orders
                 WHERE state NOT IN ('FILLED', 'CANCELED', 'REJECTED', 'EXPIRED')",
                Vec::<Value>::new(),
            )
            .await
            .map_err(|e| PersistenceError::Query(e.to_string()))?;

        let mut orders = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| PersistenceError::Query(e.to_string()))?
        {
            let mut order = row_to_order(&row)?;
            if order.state == OrderState::New {
                order.pending_reconcile = true;
            }
            orders.push(order);
        }
        tracing::info!(count = orders.len(), "recovered open orders");
        Ok(orders)
    }

    /// Count persisted fills for an order.
    pub async fn fill_count(&self, order_id: &str) -> Result<u64, PersistenceError> {
        let conn = self.db.connect()?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM fills WHERE order_id = ?",
                vec![Value::Text(order_id.to_string())],
            )
            .await
            .map_err(|e| PersistenceError::Query(e.to_string()))?;
        let row = rows
            .next()
            .await
            .map_err(|e| PersistenceError::Query(e.to_string()))?
            .ok_or_else(|| PersistenceError::BadRow("missing count row".to_string()))?;
        let count: i64 = row
            .get(0)
            .map_err(|e| PersistenceError::BadRow(e.to_string()))?;
        Ok(count as u64)
    }
}

fn opt_text(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

fn get_text(row: &Row, index: usize, field: &str) -> Result<String, PersistenceError> {
    row.get::<String>(index)
        .map_err(|e| PersistenceError::BadRow(format!("{field}: {e}")))
}

fn get_decimal(row: &Row, index: usize, field: &str) -> Result<Decimal, PersistenceError> {
    get_text(row, index, field)?
        .parse()
        .map_err(|e| PersistenceError::BadRow(format!("{field}: {e}")))
}

fn row_to_order(row: &Row) -> Result<Order, PersistenceError> {
    let parse_time = |index: usize, field: &str| -> Result<chrono::DateTime<chrono::Utc>, PersistenceError> {
        let text = get_text(row, index, field)?;
        chrono::DateTime::parse_from_rfc3339(&text)
            .map(|t| t.with_timezone(&chrono::Utc))
            .map_err(|e| PersistenceError::BadRow(format!("{field}: {e}")))
    };

    Ok(Order {
        order_id: get_text(row, 0, "order_id")?,
        client_order_id: get_text(row, 1, "client_order_id")?,
        exchange_order_id: row.get::<String>(2).ok(),
        symbol: get_text(row, 3, "symbol")?,
        side: parse_side(&get_text(row, 4, "side")?)?,
        order_type: parse_type(&get_text(row, 5, "order_type")?)?,
        time_in_force: parse_tif(&get_text(row, 6, "time_in_force")?)?,
        quantity: get_decimal(row, 7, "quantity")?,
        price: row.get::<String>(8).ok().and_then(|s| s.parse().ok()),
        stop_price: row.get::<String>(9).ok().and_then(|s| s.parse().ok()),
        filled_quantity: get_decimal(row, 10, "filled_quantity")?,
        avg_price: get_decimal(row, 11, "avg_price")?,
        fees_total: get_decimal(row, 12, "fees_total")?,
        state: parse_state(&get_text(row, 13, "state")?)?,
        reduce_only: row.get::<i64>(14).unwrap_or(0) != 0,
        post_only: row.get::<i64>(15).unwrap_or(0) != 0,
        strategy_id: get_text(row, 16, "strategy_id")?,
        state_reason: row.get::<String>(17).ok(),
        pending_reconcile: row.get::<i64>(18).unwrap_or(0) != 0,
        created_at: parse_time(19, "created_at")?,
        updated_at: parse_time(20, "updated_at")?,
    })
}

fn parse_side(s: &str) -> Result<OrderSide, PersistenceError> {
    match s {
        "Buy" => Ok(OrderSide::Buy),
        "Sell" => Ok(OrderSide::Sell),
        other => Err(PersistenceError::BadRow(format!("side: {other}"))),
    }
}

fn parse_type(s: &str) -> Result<OrderType, PersistenceError> {
    match s {
        "Market" => Ok(OrderType::Market),
        "Limit" => Ok(OrderType::Limit),
        "StopMarket" => Ok(OrderType::StopMarket),
        "StopLimit" => Ok(OrderType::StopLimit),
        "PostOnly" => Ok(OrderType::PostOnly),
        other => Err(PersistenceError::BadRow(format!("order_type: {other}"))),
    }
}

fn parse_tif(s: &str) -> Result<TimeInForce, PersistenceError> {
    match s {
        "Gtc" => Ok(TimeInForce::Gtc),
        "Ioc" => Ok(TimeInForce::Ioc),
        "Fok" => Ok(TimeInForce::Fok),
        "Gtx" => Ok(TimeInForce::Gtx),
        other => Err(PersistenceError::BadRow(format!("time_in_force: {other}"))),
    }
}

fn parse_state(s: &str) -> Result<OrderState, PersistenceError> {
    match s {
        "NEW" => Ok(OrderState::New),
        "SUBMITTED" => Ok(OrderState::Submitted),
        "PARTIALLY_FILLED" => Ok(OrderState::PartiallyFilled),
        "FILLED" => Ok(OrderState::Filled),
        "CANCELED" => Ok(OrderState::Canceled),
        "REJECTED" => Ok(OrderState::Rejected),
        "EXPIRED" => Ok(OrderState::Expired),
        other => Err(PersistenceError::BadRow(format!("state: {other}"))),
    }
}

/// Asynchronous writer draining bus events into the store.
///
/// Runs off the hot path: a lagging writer drops broadcast backlog rather
/// than stalling producers, and replayed events are harmless because every
/// write is idempotent by primary key.
pub struct PersistenceWriter {
    store: Arc<TradingStore>,
    bus: Arc<EventBus>,
}

impl PersistenceWriter {
    /// Create a writer.
    #[must_use]
    pub fn new(store: Arc<TradingStore>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut orders = self.bus.orders_rx();
        let mut fills = self.bus.fills_rx();
        let mut alerts = self.bus.alerts_rx();
        let mut episodes = self.bus.episodes_rx();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("persistence writer stopped");
                    return;
                }
                event = orders.recv() => {
                    if let Ok(event) = event
                        && let Err(e) = self.store.save_order(&event.order).await
                    {
                        tracing::warn!(error = %e, "order persist failed");
                    }
                }
                fill = fills.recv() => {
                    if let Ok(fill) = fill
                        && let Err(e) = self.store.save_fill(&fill).await
                    {
                        tracing::warn!(error = %e, "fill persist failed");
                    }
                }
                alert = alerts.recv() => {
                    if let Ok(alert) = alert
                        && let Err(e) = self.store.save_alert(&alert).await
                    {
                        tracing::warn!(error = %e, "alert persist failed");
                    }
                }
                episode = episodes.recv() => {
                    if let Ok(episode) = episode
                        && let Err(e) = self.store.save_episode(&episode).await
                    {
                        tracing::warn!(error = %e, "episode persist failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::alert::AlertKind;

    fn order(order_id: &str, client_order_id: &str, state: OrderState) -> Order {
        let now = Utc::now();
        Order {
            order_id: order_id.to_string(),
            client_order_id: client_order_id.to_string(),
            exchange_order_id: Some("X1".to_string()),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtc,
            quantity: dec!(0.001),
            price: Some(dec!(45000)),
            stop_price: None,
            filled_quantity: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            fees_total: Decimal::ZERO,
            state,
            reduce_only: false,
            post_only: false,
            strategy_id: "alpha".to_string(),
            state_reason: None,
            pending_reconcile: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn fill(fill_id: &str) -> Fill {
        Fill {
            fill_id: fill_id.to_string(),
            order_id: "o1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            price: dec!(45000),
            quantity: dec!(0.001),
            fee: dec!(0.045),
            fee_asset: "USDT".to_string(),
            is_maker: true,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn order_roundtrip_preserves_fields() {
        let store = TradingStore::in_memory().await.unwrap();
        store
            .save_order(&order("o1", "c1", OrderState::Submitted))
            .await
            .unwrap();

        let recovered = store.load_open_orders().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].order_id, "o1");
        assert_eq!(recovered[0].quantity, dec!(0.001));
        assert_eq!(recovered[0].price, Some(dec!(45000)));
        assert_eq!(recovered[0].state, OrderState::Submitted);
    }

    #[tokio::test]
    async fn terminal_orders_are_not_recovered() {
        let store = TradingStore::in_memory().await.unwrap();
        store
            .save_order(&order("o1", "c1", OrderState::Filled))
            .await
            .unwrap();
        store
            .save_order(&order("o2", "c2", OrderState::Submitted))
            .await
            .unwrap();

        let recovered = store.load_open_orders().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].order_id, "o2");
    }

    #[tokio::test]
    async fn recovered_new_orders_marked_pending_reconcile() {
        let store = TradingStore::in_memory().await.unwrap();
        store
            .save_order(&order("o1", "c1", OrderState::New))
            .await
            .unwrap();

        let recovered = store.load_open_orders().await.unwrap();
        assert!(recovered[0].pending_reconcile);
    }

    #[tokio::test]
    async fn fill_insert_is_idempotent() {
        let store = TradingStore::in_memory().await.unwrap();
        store.save_fill(&fill("f1")).await.unwrap();
        store.save_fill(&fill("f1")).await.unwrap();
        store.save_fill(&fill("f2")).await.unwrap();

        assert_eq!(store.fill_count("o1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn alert_persists() {
        let store = TradingStore::in_memory().await.unwrap();
        let alert = Alert::new(AlertKind::PositionDrift, "drift").with_subject("BTCUSDT");
        store.save_alert(&alert).await.unwrap();
        // Idempotent by id.
        store.save_alert(&alert).await.unwrap();
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");
        let path = path.to_str().unwrap();

        {
            let store = TradingStore::open(path).await.unwrap();
            store
                .save_order(&order("o1", "c1", OrderState::New))
                .await
                .unwrap();
            store.save_fill(&fill("f1")).await.unwrap();
        }

        // A fresh process reopening the same file sees the same state.
        let store = TradingStore::open(path).await.unwrap();
        let recovered = store.load_open_orders().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(recovered[0].pending_reconcile);
        assert_eq!(store.fill_count("o1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn save_order_upserts() {
        let store = TradingStore::in_memory().await.unwrap();
        let mut o = order("o1", "c1", OrderState::Submitted);
        store.save_order(&o).await.unwrap();

        o.filled_quantity = dec!(0.001);
        o.state = OrderState::Filled;
        store.save_order(&o).await.unwrap();

        // Filled order no longer shows up as open.
        assert!(store.load_open_orders().await.unwrap().is_empty());
    }
}
