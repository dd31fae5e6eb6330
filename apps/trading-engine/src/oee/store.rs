//! In-memory order store with serialized per-order mutation.
//!
//! Orders are indexed by order id, client order id, and exchange order id.
//! All mutations go through [`OrderStore::mutate`], which runs under the
//! write lock, so transitions for one order are serialized. A key whose
//! worker hit an invariant violation is halted: further mutations are
//! refused until an operator resumes it.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use thiserror::Error;

use crate::domain::order::{Order, OrderError};

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unknown order id.
    #[error("order {0} not found")]
    NotFound(String),

    /// Another order already uses the client order id.
    #[error("client order id {0} already in use")]
    DuplicateClientOrderId(String),

    /// A duplicate venue id was observed for a different order.
    #[error("exchange order id {0} already mapped")]
    DuplicateExchangeOrderId(String),

    /// The order's worker was halted by an invariant violation.
    #[error("order {0} is halted pending operator resume")]
    KeyHalted(String),

    /// The mutation itself failed.
    #[error(transparent)]
    Order(#[from] OrderError),
}

/// Thread-safe order store.
#[derive(Debug, Default)]
pub struct OrderStore {
    orders: RwLock<HashMap<String, Order>>,
    client_index: RwLock<HashMap<String, String>>,
    exchange_index: RwLock<HashMap<String, String>>,
    seen_fills: RwLock<HashSet<String>>,
    halted_keys: RwLock<HashSet<String>>,
}

impl OrderStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new order. Fails if the client order id is taken.
    pub fn insert(&self, order: Order) -> Result<(), StoreError> {
        let mut client_index = self.client_index.write();
        if client_index.contains_key(&order.client_order_id) {
            return Err(StoreError::DuplicateClientOrderId(
                order.client_order_id.clone(),
            ));
        }
        client_index.insert(order.client_order_id.clone(), order.order_id.clone());
        drop(client_index);

        self.orders
            .write()
            .insert(order.order_id.clone(), order);
        Ok(())
    }

    /// Get an order snapshot by order id.
    #[must_use]
    pub fn get(&self, order_id: &str) -> Option<Order> {
        self.orders.read().get(order_id).cloned()
    }

    /// Get an order snapshot by client order id.
    #[must_use]
    pub fn get_by_client_id(&self, client_order_id: &str) -> Option<Order> {
        let order_id = self.client_index.read().get(client_order_id).cloned()?;
        self.get(&order_id)
    }

    /// Get an order snapshot by exchange order id.
    #[must_use]
    pub fn get_by_exchange_id(&self, exchange_order_id: &str) -> Option<Order> {
        let order_id = self.exchange_index.read().get(exchange_order_id).cloned()?;
        self.get(&order_id)
    }

    /// Mutate an order under the write lock. The closure either transitions
    /// the order or fails without side effects.
    pub fn mutate<T>(
        &self,
        order_id: &str,
        f: impl FnOnce(&mut Order) -> Result<T, OrderError>,
    ) -> Result<(T, Order), StoreError> {
        if self.halted_keys.read().contains(order_id) {
            return Err(StoreError::KeyHalted(order_id.to_string()));
        }

        let mut orders = self.orders.write();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| StoreError::NotFound(order_id.to_string()))?;

        let result = f(order)?;
        let snapshot = order.clone();
        drop(orders);

        if let Some(exchange_id) = snapshot.exchange_order_id.clone() {
            self.exchange_index
                .write()
                .entry(exchange_id)
                .or_insert_with(|| snapshot.order_id.clone());
        }
        Ok((result, snapshot))
    }

    /// Record a fill id; returns `false` if it was already seen.
    pub fn record_fill_id(&self, fill_id: &str) -> bool {
        self.seen_fills.write().insert(fill_id.to_string())
    }

    /// Halt a key after an invariant violation.
    pub fn halt_key(&self, order_id: &str) {
        tracing::error!(order_id, "order worker halted by invariant violation");
        self.halted_keys.write().insert(order_id.to_string());
    }

    /// Whether a key is halted.
    #[must_use]
    pub fn is_key_halted(&self, order_id: &str) -> bool {
        self.halted_keys.read().contains(order_id)
    }

    /// Operator resume for a halted key.
    pub fn resume_key(&self, order_id: &str) -> bool {
        self.halted_keys.write().remove(order_id)
    }

    /// All non-terminal orders.
    #[must_use]
    pub fn active_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| !o.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Orders awaiting reconciliation of an indeterminate submission.
    #[must_use]
    pub fn pending_reconcile_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| o.pending_reconcile && !o.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Count of non-terminal orders for one strategy.
    #[must_use]
    pub fn open_order_count(&self, strategy_id: &str) -> usize {
        self.orders
            .read()
            .values()
            .filter(|o| !o.state.is_terminal() && o.strategy_id == strategy_id)
            .count()
    }

    /// Total number of orders.
    #[must_use]
    pub fn count(&self) -> usize {
        self.orders.read().len()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::order::{OrderSide, OrderState, OrderType, TimeInForce};

    fn order(order_id: &str, client_order_id: &str) -> Order {
        let now = Utc::now();
        Order {
            order_id: order_id.to_string(),
            client_order_id: client_order_id.to_string(),
            exchange_order_id: None,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtc,
            quantity: dec!(1),
            price: Some(dec!(100)),
            stop_price: None,
            filled_quantity: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            fees_total: Decimal::ZERO,
            state: OrderState::New,
            reduce_only: false,
            post_only: false,
            strategy_id: "alpha".to_string(),
            state_reason: None,
            pending_reconcile: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn client_order_id_uniqueness_enforced() {
        let store = OrderStore::new();
        store.insert(order("o1", "c1")).unwrap();

        let err = store.insert(order("o2", "c1")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateClientOrderId(_)));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn lookup_by_all_indexes() {
        let store = OrderStore::new();
        store.insert(order("o1", "c1")).unwrap();
        store
            .mutate("o1", |o| o.mark_submitted("X1".to_string()))
            .unwrap();

        assert!(store.get("o1").is_some());
        assert!(store.get_by_client_id("c1").is_some());
        assert_eq!(store.get_by_exchange_id("X1").unwrap().order_id, "o1");
    }

    #[test]
    fn mutate_failure_leaves_order_untouched() {
        let store = OrderStore::new();
        store.insert(order("o1", "c1")).unwrap();

        // Cancel from NEW is not a legal transition.
        let result = store.mutate("o1", |o| o.mark_canceled("nope"));
        assert!(result.is_err());
        assert_eq!(store.get("o1").unwrap().state, OrderState::New);
    }

    #[test]
    fn halted_key_refuses_mutation() {
        let store = OrderStore::new();
        store.insert(order("o1", "c1")).unwrap();

        store.halt_key("o1");
        let err = store
            .mutate("o1", |o| o.mark_submitted("X1".to_string()))
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyHalted(_)));

        assert!(store.resume_key("o1"));
        assert!(store.mutate("o1", |o| o.mark_submitted("X1".to_string())).is_ok());
    }

    #[test]
    fn fill_id_deduplication() {
        let store = OrderStore::new();
        assert!(store.record_fill_id("f1"));
        assert!(!store.record_fill_id("f1"));
        assert!(store.record_fill_id("f2"));
    }

    #[test]
    fn active_and_pending_filters() {
        let store = OrderStore::new();
        store.insert(order("o1", "c1")).unwrap();
        let mut pending = order("o2", "c2");
        pending.pending_reconcile = true;
        store.insert(pending).unwrap();
        store.insert(order("o3", "c3")).unwrap();
        store.mutate("o3", |o| o.mark_rejected("test")).unwrap();

        assert_eq!(store.active_orders().len(), 2);
        assert_eq!(store.pending_reconcile_orders().len(), 1);
        assert_eq!(store.open_order_count("alpha"), 2);
        assert_eq!(store.open_order_count("other"), 0);
    }
}
