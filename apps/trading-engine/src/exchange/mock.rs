//! In-memory venue for tests and paper trading.
//!
//! Accepts every order by default; failures are scripted per call so tests
//! can drive the breaker, limiter, and reconciliation paths. Fills and
//! balance changes are emitted on demand through the same user-stream
//! channel the real adapter uses.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use super::{
    ExchangeAccountSnapshot, ExchangeBalance, ExchangeError, ExchangeOrderStatus,
    ExchangePort, ExchangePosition, OrderAck, PlaceOrderRequest, UserStreamEvent,
};
use crate::domain::fill::Fill;
use crate::domain::order::{OrderSide, OrderState};

/// Scripted failure for the next venue call.
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    /// Network/5xx failure.
    Transient,
    /// Request deadline elapsed (indeterminate for mutations).
    Timeout,
    /// HTTP 429.
    RateLimited,
    /// Definitive refusal.
    Rejected {
        /// Venue error code.
        code: i64,
        /// Venue error message.
        message: String,
    },
}

impl ScriptedFailure {
    fn into_error(self, operation: &str) -> ExchangeError {
        match self {
            Self::Transient => ExchangeError::Transient("scripted".to_string()),
            Self::Timeout => ExchangeError::Timeout {
                operation: operation.to_string(),
            },
            Self::RateLimited => ExchangeError::RateLimited,
            Self::Rejected { code, message } => ExchangeError::Rejected { code, message },
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    /// Orders the venue has accepted, keyed by client order id.
    orders: HashMap<String, ExchangeOrderStatus>,
    /// Requested quantity and side per client order id.
    requested: HashMap<String, (Decimal, OrderSide)>,
    balances: HashMap<String, ExchangeBalance>,
    positions: HashMap<String, ExchangePosition>,
    place_failures: VecDeque<ScriptedFailure>,
    cancel_failures: VecDeque<ScriptedFailure>,
    account_failures: VecDeque<ScriptedFailure>,
    /// When set, the next scripted place timeout still lands the order on
    /// the venue book (response lost in flight).
    accept_despite_timeout: bool,
    subscribers: Vec<mpsc::Sender<UserStreamEvent>>,
    place_calls: u64,
}

/// In-memory [`ExchangePort`] implementation.
#[derive(Debug, Default)]
pub struct MockExchange {
    state: Mutex<MockState>,
    next_order_id: AtomicU64,
    next_fill_id: AtomicU64,
}

impl MockExchange {
    /// Create an empty mock venue.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script failures for upcoming `place_order` calls, consumed in order.
    pub fn fail_next_places(&self, failures: impl IntoIterator<Item = ScriptedFailure>) {
        self.state.lock().place_failures.extend(failures);
    }

    /// Script failures for upcoming `cancel_order` calls.
    pub fn fail_next_cancels(&self, failures: impl IntoIterator<Item = ScriptedFailure>) {
        self.state.lock().cancel_failures.extend(failures);
    }

    /// Script failures for upcoming `get_account` calls.
    pub fn fail_next_account_fetches(&self, failures: impl IntoIterator<Item = ScriptedFailure>) {
        self.state.lock().account_failures.extend(failures);
    }

    /// Make the next scripted place timeout still register the order on the
    /// venue (models a response lost after the venue applied the request).
    pub fn lose_next_place_response(&self) {
        let mut state = self.state.lock();
        state.place_failures.push_back(ScriptedFailure::Timeout);
        state.accept_despite_timeout = true;
    }

    /// Number of `place_order` calls that reached the venue.
    #[must_use]
    pub fn place_calls(&self) -> u64 {
        self.state.lock().place_calls
    }

    /// Seed a balance row.
    pub fn set_balance(&self, asset: &str, free: Decimal, locked: Decimal) {
        self.state.lock().balances.insert(
            asset.to_string(),
            ExchangeBalance {
                asset: asset.to_string(),
                free,
                locked,
            },
        );
    }

    /// Seed a position row.
    pub fn set_position(&self, symbol: &str, quantity: Decimal, entry_price: Decimal) {
        self.state.lock().positions.insert(
            symbol.to_string(),
            ExchangePosition {
                symbol: symbol.to_string(),
                quantity,
                entry_price,
            },
        );
    }

    /// Emit an arbitrary user-stream event to all subscribers.
    pub async fn emit(&self, event: UserStreamEvent) {
        let senders: Vec<_> = self.state.lock().subscribers.clone();
        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }

    /// Fully or partially fill an accepted order: updates the venue book
    /// and emits the matching `Fill` and `OrderUpdate` events.
    pub async fn fill_order(&self, client_order_id: &str, quantity: Decimal, price: Decimal) {
        let fill_id = self.next_fill_id.fetch_add(1, Ordering::Relaxed) + 1;
        let Some((fill, update)) = ({
            let mut state = self.state.lock();
            let requested = state.requested.get(client_order_id).copied();
            match (state.orders.get_mut(client_order_id), requested) {
                (Some(order), Some((requested_qty, side))) => {
                    order.filled_quantity += quantity;
                    order.avg_price = price;
                    order.state = if order.filled_quantity >= requested_qty {
                        OrderState::Filled
                    } else {
                        OrderState::PartiallyFilled
                    };

                    let fill = Fill {
                        fill_id: format!("mock-fill-{fill_id}"),
                        order_id: order.exchange_order_id.clone(),
                        symbol: order.symbol.clone(),
                        side,
                        price,
                        quantity,
                        fee: price * quantity * Decimal::new(1, 3), // 0.1% taker fee
                        fee_asset: "USDT".to_string(),
                        is_maker: false,
                        timestamp: Utc::now(),
                    };
                    let update = UserStreamEvent::OrderUpdate {
                        exchange_order_id: order.exchange_order_id.clone(),
                        client_order_id: client_order_id.to_string(),
                        symbol: order.symbol.clone(),
                        state: order.state,
                        reason: None,
                    };
                    Some((fill, update))
                }
                _ => None,
            }
        }) else {
            return;
        };

        self.emit(UserStreamEvent::Fill(fill)).await;
        self.emit(update).await;
    }
}

#[async_trait::async_trait]
impl ExchangePort for MockExchange {
    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut state = self.state.lock();

        if let Some(failure) = state.place_failures.pop_front() {
            let lost = matches!(failure, ScriptedFailure::Timeout) && state.accept_despite_timeout;
            if lost {
                state.accept_despite_timeout = false;
                state.place_calls += 1;
                let id = self.next_order_id.fetch_add(1, Ordering::Relaxed) + 1;
                state.orders.insert(
                    request.client_order_id.clone(),
                    ExchangeOrderStatus {
                        exchange_order_id: id.to_string(),
                        client_order_id: request.client_order_id.clone(),
                        symbol: request.symbol.clone(),
                        state: OrderState::Submitted,
                        filled_quantity: Decimal::ZERO,
                        avg_price: Decimal::ZERO,
                    },
                );
                state
                    .requested
                    .insert(request.client_order_id.clone(), (request.quantity, request.side));
            }
            return Err(failure.into_error("order.place"));
        }

        state.place_calls += 1;

        // Idempotent on client order id, like the venue.
        if let Some(existing) = state.orders.get(&request.client_order_id) {
            return Ok(OrderAck {
                exchange_order_id: existing.exchange_order_id.clone(),
                client_order_id: existing.client_order_id.clone(),
            });
        }

        let id = self.next_order_id.fetch_add(1, Ordering::Relaxed) + 1;
        let exchange_order_id = id.to_string();
        state.orders.insert(
            request.client_order_id.clone(),
            ExchangeOrderStatus {
                exchange_order_id: exchange_order_id.clone(),
                client_order_id: request.client_order_id.clone(),
                symbol: request.symbol.clone(),
                state: OrderState::Submitted,
                filled_quantity: Decimal::ZERO,
                avg_price: Decimal::ZERO,
            },
        );
        state
            .requested
            .insert(request.client_order_id.clone(), (request.quantity, request.side));

        Ok(OrderAck {
            exchange_order_id,
            client_order_id: request.client_order_id.clone(),
        })
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        exchange_order_id: &str,
    ) -> Result<(), ExchangeError> {
        let update = {
            let mut state = self.state.lock();
            if let Some(failure) = state.cancel_failures.pop_front() {
                return Err(failure.into_error("order.cancel"));
            }

            let order = state
                .orders
                .values_mut()
                .find(|o| o.exchange_order_id == exchange_order_id)
                .ok_or(ExchangeError::Rejected {
                    code: -2011,
                    message: "Unknown order sent".to_string(),
                })?;
            order.state = OrderState::Canceled;
            UserStreamEvent::OrderUpdate {
                exchange_order_id: order.exchange_order_id.clone(),
                client_order_id: order.client_order_id.clone(),
                symbol: order.symbol.clone(),
                state: OrderState::Canceled,
                reason: Some("canceled".to_string()),
            }
        };
        self.emit(update).await;
        Ok(())
    }

    async fn get_account(&self) -> Result<ExchangeAccountSnapshot, ExchangeError> {
        let mut state = self.state.lock();
        if let Some(failure) = state.account_failures.pop_front() {
            return Err(failure.into_error("account.get"));
        }
        Ok(ExchangeAccountSnapshot {
            balances: state.balances.values().cloned().collect(),
            positions: state.positions.values().cloned().collect(),
            timestamp: Utc::now(),
        })
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrderStatus>, ExchangeError> {
        let state = self.state.lock();
        Ok(state
            .orders
            .values()
            .filter(|o| !o.state.is_terminal())
            .filter(|o| symbol.is_none_or(|s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn query_order(
        &self,
        _symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<ExchangeOrderStatus>, ExchangeError> {
        Ok(self.state.lock().orders.get(client_order_id).cloned())
    }

    async fn subscribe_user_stream(
        &self,
    ) -> Result<mpsc::Receiver<UserStreamEvent>, ExchangeError> {
        let (tx, rx) = mpsc::channel(1024);
        let _ = tx.send(UserStreamEvent::Connected).await;
        self.state.lock().subscribers.push(tx);
        Ok(rx)
    }
}
