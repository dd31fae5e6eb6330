//! Order execution engine.
//!
//! The submission pipeline runs the stages in a fixed order, each of which
//! may short-circuit into a rejected order row:
//!
//! 1. normalize (attach the idempotency key, refuse duplicates)
//! 2. halt gate (emergency stop)
//! 3. symbol-rule validation
//! 4. risk precheck
//! 5. rate limiter
//! 6. circuit breaker
//! 7. venue submission with bounded retry
//!
//! An order whose venue outcome is unknown stays in `NEW` marked
//! `pending_reconcile`; [`reconcile::OrderReconciler`] resolves it. Every
//! legal transition publishes an [`OrderUpdateEvent`] on the bus.

pub mod reconcile;
pub mod store;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::account::AccountMonitor;
use crate::bus::{EventBus, OrderUpdateEvent};
use crate::domain::alert::{Alert, AlertKind};
use crate::domain::fill::Fill;
use crate::domain::order::{Order, OrderError, OrderState};
use crate::domain::signal::{ClientOrderIdSource, OrderSignal};
use crate::domain::symbol_rules::SymbolRules;
use crate::exchange::{ExchangeError, ExchangePort, PlaceOrderRequest, UserStreamEvent};
use crate::resilience::{BackoffCalculator, BreakerRegistry, RateLimiterRegistry, RetryPolicy};
use crate::risk::{EmergencyStop, MetricSet, RiskManager, RiskVerdict};

pub use reconcile::{OrderReconciler, ReconcileConfig};
pub use store::{OrderStore, StoreError};

use std::collections::HashMap;

/// Stable rejection reason codes.
pub mod reasons {
    /// Failed symbol-rule validation.
    pub const VALIDATION: &str = "VALIDATION";
    /// Unknown or disabled symbol.
    pub const UNKNOWN_SYMBOL: &str = "UNKNOWN_SYMBOL";
    /// A risk policy blocked the order.
    pub const RISK_BLOCKED: &str = "RISK_BLOCKED";
    /// Emergency stop is engaged.
    pub const HALTED: &str = "HALTED";
    /// The rate limiter refused the call.
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    /// The circuit breaker is open.
    pub const BREAKER_OPEN: &str = "BREAKER_OPEN";
    /// The venue refused the order.
    pub const EXCHANGE_REJECTED: &str = "EXCHANGE_REJECTED";
    /// Outcome unknown pending reconciliation.
    pub const INDETERMINATE: &str = "INDETERMINATE";
    /// Reconciliation window elapsed without resolution.
    pub const AMBIGUOUS_TIMEOUT: &str = "ambiguous_timeout";
    /// Reconciliation determined the venue never saw the order.
    pub const NOT_PLACED: &str = "not_placed";
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Account shard this engine trades for.
    pub account: String,
    /// Deadline for one venue submission attempt.
    pub submit_deadline: Duration,
    /// How long a submission may wait for limiter tokens. `None` fails
    /// fast with `RATE_LIMITED`.
    pub limiter_wait: Option<Duration>,
    /// Retry policy for venue mutations.
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            account: "main".to_string(),
            submit_deadline: Duration::from_secs(5),
            limiter_wait: None,
            retry: RetryPolicy::mutations(),
        }
    }
}

/// Result of a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    /// The order id (existing id for duplicate submissions).
    pub order_id: String,
    /// Whether the order was accepted into the working set.
    pub accepted: bool,
    /// Rejection reason code, when not accepted.
    pub reason: Option<String>,
}

/// Result of a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Cancel request accepted.
    Ok,
    /// No such order.
    NotFound,
    /// The order is not in a cancelable state.
    AlreadyTerminal,
}

/// The order execution engine.
pub struct OrderExecutionEngine {
    settings: EngineSettings,
    store: OrderStore,
    exchange: Arc<dyn ExchangePort>,
    risk: Arc<RiskManager>,
    stop: Arc<EmergencyStop>,
    limiters: Arc<RateLimiterRegistry>,
    breakers: Arc<BreakerRegistry>,
    bus: Arc<EventBus>,
    monitor: Arc<AccountMonitor>,
    rules: RwLock<HashMap<String, SymbolRules>>,
    id_source: ClientOrderIdSource,
    stream_connected: AtomicBool,
    fatal: AtomicBool,
}

impl OrderExecutionEngine {
    /// Create the engine.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: EngineSettings,
        exchange: Arc<dyn ExchangePort>,
        risk: Arc<RiskManager>,
        stop: Arc<EmergencyStop>,
        limiters: Arc<RateLimiterRegistry>,
        breakers: Arc<BreakerRegistry>,
        bus: Arc<EventBus>,
        monitor: Arc<AccountMonitor>,
        rules: HashMap<String, SymbolRules>,
    ) -> Self {
        Self {
            settings,
            store: OrderStore::new(),
            exchange,
            risk,
            stop,
            limiters,
            breakers,
            bus,
            monitor,
            rules: RwLock::new(rules),
            id_source: ClientOrderIdSource::new(),
            stream_connected: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
        }
    }

    /// Replace the symbol rule set (trading-pair config change).
    pub fn reload_rules(&self, rules: HashMap<String, SymbolRules>) {
        tracing::info!(count = rules.len(), "symbol rules reloaded");
        *self.rules.write() = rules;
    }

    /// Whether the user-data stream is currently connected.
    #[must_use]
    pub fn stream_connected(&self) -> bool {
        self.stream_connected.load(Ordering::SeqCst)
    }

    /// Whether a fatal venue error (signing, clock skew) was observed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// The order store (admin queries, reconciler).
    #[must_use]
    pub fn store(&self) -> &OrderStore {
        &self.store
    }

    /// Query an order snapshot.
    #[must_use]
    pub fn query(&self, order_id: &str) -> Option<Order> {
        self.store
            .get(order_id)
            .or_else(|| self.store.get_by_client_id(order_id))
    }

    // ========================================================================
    // Submission pipeline
    // ========================================================================

    /// Submit a strategy signal. Idempotent on `client_order_id`.
    pub async fn submit(&self, signal: OrderSignal) -> SubmitOutcome {
        let started = Instant::now();
        let outcome = self.submit_inner(signal).await;
        metrics::histogram!("submit_latency_us").record(started.elapsed().as_micros() as f64);
        metrics::counter!(
            "submissions",
            "outcome" => if outcome.accepted { "accepted" } else { "rejected" }
        )
        .increment(1);
        outcome
    }

    async fn submit_inner(&self, signal: OrderSignal) -> SubmitOutcome {
        let client_order_id = signal.resolve_client_order_id(&self.id_source);

        // Idempotency: a repeat of a known key returns the existing order.
        if let Some(existing) = self.store.get_by_client_id(&client_order_id) {
            return SubmitOutcome {
                accepted: !matches!(existing.state, OrderState::Rejected),
                order_id: existing.order_id,
                reason: Some("duplicate_submission".to_string()),
            };
        }

        let order = self.build_order(&signal, client_order_id.clone());
        let order_id = order.order_id.clone();
        if let Err(e) = self.store.insert(order) {
            // Lost a race on the same key; fall back to the winner.
            tracing::debug!(error = %e, "submission raced on client order id");
            if let Some(existing) = self.store.get_by_client_id(&client_order_id) {
                return SubmitOutcome {
                    accepted: !matches!(existing.state, OrderState::Rejected),
                    order_id: existing.order_id,
                    reason: Some("duplicate_submission".to_string()),
                };
            }
            return SubmitOutcome {
                order_id,
                accepted: false,
                reason: Some(reasons::VALIDATION.to_string()),
            };
        }
        self.publish_update(&order_id, Some("created"));

        // Halt gate.
        if self.stop.is_halted() {
            return self.reject(&order_id, reasons::HALTED, "emergency stop engaged");
        }

        // Symbol-rule validation.
        let rules = self.rules.read().get(&signal.symbol).cloned();
        let Some(rules) = rules else {
            return self.reject(
                &order_id,
                reasons::UNKNOWN_SYMBOL,
                &format!("no trading rules for {}", signal.symbol),
            );
        };
        if let Err(violation) = rules.validate(&signal) {
            return self.reject(&order_id, reasons::VALIDATION, &violation.to_string());
        }

        // Risk precheck.
        match self.risk.evaluate(&self.precheck_metrics(&signal)) {
            RiskVerdict::Allow | RiskVerdict::Warn { .. } => {}
            RiskVerdict::Deny { reason, .. } => {
                return self.reject(&order_id, reasons::RISK_BLOCKED, &reason);
            }
            RiskVerdict::Halt { policy_id, reason } => {
                self.engage_halt(&policy_id, &reason).await;
                return self.reject(&order_id, reasons::HALTED, &reason);
            }
        }

        // Rate limit.
        let limiter = self
            .limiters
            .limiter("order.place", &self.settings.account);
        let admitted = match self.settings.limiter_wait {
            Some(wait) => limiter.acquire_until(Instant::now() + wait).await,
            None => limiter.try_acquire(),
        };
        if !admitted {
            metrics::counter!("submissions_rate_limited").increment(1);
            return self.reject(&order_id, reasons::RATE_LIMITED, "rate limit exceeded");
        }

        // Circuit breaker.
        let breaker = self
            .breakers
            .breaker("order.place", &self.settings.account);
        if !breaker.try_acquire() {
            metrics::counter!("submissions_breaker_open").increment(1);
            return self.reject(&order_id, reasons::BREAKER_OPEN, "circuit breaker open");
        }

        // Venue submission with bounded retry. The client order id makes
        // retries idempotent on the venue side.
        let request = {
            // The snapshot exists; we just inserted it.
            let Some(order) = self.store.get(&order_id) else {
                return SubmitOutcome {
                    order_id,
                    accepted: false,
                    reason: Some(reasons::INDETERMINATE.to_string()),
                };
            };
            PlaceOrderRequest::from_order(&order)
        };
        let mut backoff = BackoffCalculator::new(&self.settings.retry);
        let mut attempted = false;

        loop {
            if attempted && !breaker.try_acquire() {
                break;
            }
            attempted = true;

            match tokio::time::timeout(
                self.settings.submit_deadline,
                self.exchange.place_order(&request),
            )
            .await
            {
                Ok(Ok(ack)) => {
                    breaker.record_success();
                    let transition = self
                        .store
                        .mutate(&order_id, |o| o.mark_submitted(ack.exchange_order_id.clone()));
                    match transition {
                        Ok(_) => {
                            self.publish_update(&order_id, Some("submitted"));
                            return SubmitOutcome {
                                order_id,
                                accepted: true,
                                reason: None,
                            };
                        }
                        Err(e) => {
                            // The stream beat us to a terminal state.
                            tracing::debug!(order_id, error = %e, "ack raced stream update");
                            return SubmitOutcome {
                                order_id,
                                accepted: true,
                                reason: None,
                            };
                        }
                    }
                }
                Ok(Err(ExchangeError::Rejected { code, message })) => {
                    breaker.record_success();
                    return self.reject(
                        &order_id,
                        reasons::EXCHANGE_REJECTED,
                        &format!("{message} (code {code})"),
                    );
                }
                Ok(Err(e @ ExchangeError::Auth(_))) => {
                    breaker.record_failure();
                    self.fatal.store(true, Ordering::SeqCst);
                    tracing::error!(error = %e, "fatal venue auth failure");
                    return self.reject(&order_id, reasons::EXCHANGE_REJECTED, &e.to_string());
                }
                Ok(Err(e)) => {
                    breaker.record_failure();
                    tracing::warn!(order_id, error = %e, "submission attempt failed");
                    if !e.is_retryable() {
                        break;
                    }
                    let Some(delay) = backoff.next_backoff() else {
                        break;
                    };
                    tokio::time::sleep(delay).await;
                }
                Err(_elapsed) => {
                    breaker.record_failure();
                    tracing::warn!(order_id, "submission attempt hit local deadline");
                    let Some(delay) = backoff.next_backoff() else {
                        break;
                    };
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // Retry budget exhausted: the venue may or may not have the order.
        let _ = self.store.mutate(&order_id, |o| {
            o.pending_reconcile = true;
            Ok::<(), OrderError>(())
        });
        self.publish_update(&order_id, Some(reasons::INDETERMINATE));
        metrics::counter!("submissions_indeterminate").increment(1);
        SubmitOutcome {
            order_id,
            accepted: false,
            reason: Some(reasons::INDETERMINATE.to_string()),
        }
    }

    fn build_order(&self, signal: &OrderSignal, client_order_id: String) -> Order {
        let now = Utc::now();
        Order {
            order_id: uuid::Uuid::new_v4().to_string(),
            client_order_id,
            exchange_order_id: None,
            symbol: signal.symbol.clone(),
            side: signal.side,
            order_type: signal.order_type,
            time_in_force: signal.time_in_force,
            quantity: signal.quantity,
            price: signal.price,
            stop_price: signal.stop_price,
            filled_quantity: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            fees_total: Decimal::ZERO,
            state: OrderState::New,
            reduce_only: signal.reduce_only,
            post_only: signal.post_only,
            strategy_id: signal.strategy_id.clone(),
            state_reason: None,
            pending_reconcile: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn precheck_metrics(&self, signal: &OrderSignal) -> MetricSet {
        let position = self.monitor.position(&signal.symbol);
        let position_quantity = position.as_ref().map_or(Decimal::ZERO, |p| p.quantity);
        let order_notional = signal
            .price
            .map_or(Decimal::ZERO, |p| p * signal.quantity);

        MetricSet::new()
            .for_symbol(&signal.symbol)
            .for_strategy(&signal.strategy_id)
            .with("order_quantity", signal.quantity)
            .with("order_notional", order_notional)
            .with("position_quantity", position_quantity)
            .with(
                "open_order_count",
                Decimal::from(self.store.open_order_count(&signal.strategy_id)),
            )
    }

    fn reject(&self, order_id: &str, code: &str, detail: &str) -> SubmitOutcome {
        let reason = format!("{code}: {detail}");
        let result = self.store.mutate(order_id, |o| o.mark_rejected(reason.clone()));
        if result.is_ok() {
            self.publish_update(order_id, Some(code));
        }
        metrics::counter!("submissions_rejected", "code" => code.to_string()).increment(1);
        SubmitOutcome {
            order_id: order_id.to_string(),
            accepted: false,
            reason: Some(code.to_string()),
        }
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel by order id or client order id.
    ///
    /// Limiter/breaker refusals and exhausted retries surface as errors;
    /// the order itself is untouched in those cases.
    pub async fn cancel(&self, id: &str) -> Result<CancelOutcome, crate::error::EngineError> {
        let Some(order) = self.query(id) else {
            return Ok(CancelOutcome::NotFound);
        };
        if !order.state.is_cancelable() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }
        let Some(exchange_order_id) = order.exchange_order_id.clone() else {
            return Ok(CancelOutcome::AlreadyTerminal);
        };

        let limiter = self
            .limiters
            .limiter("order.cancel", &self.settings.account);
        if !limiter.try_acquire() {
            return Err(crate::error::EngineError::rate_limited("order.cancel"));
        }
        let breaker = self
            .breakers
            .breaker("order.cancel", &self.settings.account);
        if !breaker.try_acquire() {
            return Err(crate::error::EngineError::breaker_open("order.cancel"));
        }

        let mut backoff = BackoffCalculator::new(&self.settings.retry);
        loop {
            match self
                .exchange
                .cancel_order(&order.symbol, &exchange_order_id)
                .await
            {
                Ok(()) => {
                    breaker.record_success();
                    let transition = self
                        .store
                        .mutate(&order.order_id, |o| o.mark_canceled("user_requested"));
                    if transition.is_ok() {
                        self.publish_update(&order.order_id, Some("canceled"));
                    }
                    return Ok(CancelOutcome::Ok);
                }
                Err(ExchangeError::Rejected { code: -2011, .. }) => {
                    // Unknown on the venue: already terminal there, let
                    // reconciliation converge the local copy.
                    breaker.record_success();
                    return Ok(CancelOutcome::AlreadyTerminal);
                }
                Err(e) if e.is_retryable() => {
                    breaker.record_failure();
                    let Some(delay) = backoff.next_backoff() else {
                        tracing::warn!(order_id = %order.order_id, error = %e, "cancel retries exhausted");
                        return Err(crate::error::EngineError::new(
                            crate::error::ErrorKind::Transient,
                            format!("cancel retries exhausted: {e}"),
                        ));
                    };
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    breaker.record_success();
                    tracing::warn!(order_id = %order.order_id, error = %e, "cancel rejected");
                    return Err(crate::error::EngineError::new(
                        crate::error::ErrorKind::ExchangeRejected,
                        e.to_string(),
                    ));
                }
            }
        }
    }

    /// Cancel every open order (emergency-stop drain, stream-loss safety).
    /// Returns the number of orders whose cancel was accepted.
    pub async fn drain_open_orders(&self, reason: &str) -> u32 {
        let open = self.store.active_orders();
        let mut canceled = 0;
        for order in open {
            if !order.state.is_cancelable() {
                continue;
            }
            tracing::info!(order_id = %order.order_id, reason, "draining open order");
            if matches!(self.cancel(&order.order_id).await, Ok(CancelOutcome::Ok)) {
                canceled += 1;
            }
        }
        metrics::counter!("orders_drained").increment(u64::from(canceled));
        canceled
    }

    async fn engage_halt(&self, trigger: &str, reason: &str) {
        let snapshot = serde_json::to_value(self.monitor.snapshot()).ok();
        if self.stop.engage(trigger, reason, "risk-sweep", snapshot) {
            self.bus.publish_alert(
                Alert::new(AlertKind::EmergencyStop, reason.to_string())
                    .with_subject(trigger.to_string()),
            );
            self.drain_open_orders("emergency_stop").await;
        }
    }

    // ========================================================================
    // User-stream ingestion
    // ========================================================================

    /// Consume the user-data stream until cancelled.
    pub async fn run_user_stream(self: Arc<Self>, cancel: CancellationToken) {
        let mut stream = match self.exchange.subscribe_user_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "user stream subscription failed");
                self.fatal.store(true, Ordering::SeqCst);
                return;
            }
        };

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("user stream consumer stopped");
                    return;
                }
                event = stream.recv() => {
                    match event {
                        Some(event) => self.handle_user_event(event),
                        None => {
                            tracing::warn!("user stream channel closed");
                            self.stream_connected.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Apply one user-stream event. Exposed for tests and the reconciler.
    pub fn handle_user_event(&self, event: UserStreamEvent) {
        match event {
            UserStreamEvent::Connected => {
                self.stream_connected.store(true, Ordering::SeqCst);
                metrics::counter!("user_stream_connects").increment(1);
            }
            UserStreamEvent::Disconnected => {
                self.stream_connected.store(false, Ordering::SeqCst);
                metrics::counter!("user_stream_disconnects").increment(1);
            }
            UserStreamEvent::BalanceUpdate { asset, free, locked } => {
                self.monitor.update_balance(&asset, free, locked);
            }
            UserStreamEvent::OrderUpdate {
                exchange_order_id,
                client_order_id,
                state,
                reason,
                ..
            } => {
                self.apply_order_update(&exchange_order_id, &client_order_id, state, reason);
            }
            UserStreamEvent::Fill(fill) => self.apply_stream_fill(fill),
        }
    }

    fn apply_order_update(
        &self,
        exchange_order_id: &str,
        client_order_id: &str,
        state: OrderState,
        reason: Option<String>,
    ) {
        let Some(order) = self
            .store
            .get_by_client_id(client_order_id)
            .or_else(|| self.store.get_by_exchange_id(exchange_order_id))
        else {
            tracing::warn!(client_order_id, exchange_order_id, "update for unknown order");
            return;
        };

        let order_id = order.order_id.clone();
        let exchange_id = exchange_order_id.to_string();
        let result = match state {
            OrderState::Submitted => self.store.mutate(&order_id, |o| {
                if o.state == OrderState::New {
                    o.mark_submitted(exchange_id)
                } else {
                    Ok(()) // late ack after the REST response already landed
                }
            }),
            OrderState::Canceled => self.store.mutate(&order_id, |o| {
                if o.state.is_cancelable() {
                    o.mark_canceled(reason.unwrap_or_else(|| "venue_canceled".to_string()))
                } else {
                    Ok(()) // duplicate of our own cancel ack
                }
            }),
            OrderState::Rejected => self.store.mutate(&order_id, |o| {
                if o.state == OrderState::New {
                    o.mark_rejected(reason.unwrap_or_else(|| "venue_rejected".to_string()))
                } else {
                    Ok(())
                }
            }),
            OrderState::Expired => self.store.mutate(&order_id, |o| {
                if o.state == OrderState::Submitted {
                    o.mark_expired()
                } else {
                    Ok(())
                }
            }),
            // Fill-driven states change only through fills.
            OrderState::New | OrderState::PartiallyFilled | OrderState::Filled => {
                return;
            }
        };

        match result {
            Ok(_) => self.publish_update(&order_id, Some("venue_update")),
            Err(e) => {
                tracing::warn!(order_id, error = %e, "stream update not applicable");
            }
        }
    }

    fn apply_stream_fill(&self, venue_fill: Fill) {
        if !self.store.record_fill_id(&venue_fill.fill_id) {
            tracing::debug!(fill_id = %venue_fill.fill_id, "duplicate fill dropped");
            return;
        }

        // The venue reports its own order id; map to ours.
        let Some(order) = self
            .store
            .get_by_exchange_id(&venue_fill.order_id)
            .or_else(|| self.store.get_by_client_id(&venue_fill.order_id))
        else {
            tracing::warn!(fill_id = %venue_fill.fill_id, venue_order = %venue_fill.order_id, "fill for unknown order");
            return;
        };

        let mut fill = venue_fill;
        fill.order_id = order.order_id.clone();

        let applied = self.store.mutate(&order.order_id, |o| o.apply_fill(&fill));
        match applied {
            Ok(_) => {
                if let Some(episode) = self.monitor.apply_fill(&fill) {
                    self.bus.publish_episode(episode);
                }
                self.bus.publish_fill(fill);
                self.publish_update(&order.order_id, Some("fill"));
            }
            Err(StoreError::Order(OrderError::FillOverflow { .. })) => {
                // Never clamp: halt the key and raise a fatal alert.
                self.store.halt_key(&order.order_id);
                self.bus.publish_alert(
                    Alert::new(
                        AlertKind::InvariantViolation,
                        format!(
                            "fill {} overflows order {}: venue reported more than the order quantity",
                            fill.fill_id, order.order_id
                        ),
                    )
                    .with_subject(order.order_id.clone()),
                );
            }
            Err(e) => {
                tracing::warn!(order_id = %order.order_id, error = %e, "fill not applied");
            }
        }
    }

    /// Listen for emergency-stop transitions and drain on engage.
    pub async fn run_halt_listener(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.stop.subscribe();
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                event = events.recv() => {
                    match event {
                        Ok(crate::risk::HaltEvent::Engaged(record)) => {
                            tracing::warn!(trigger = %record.trigger, "halt engaged, draining open orders");
                            self.drain_open_orders("emergency_stop").await;
                        }
                        Ok(crate::risk::HaltEvent::Released { .. }) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
            }
        }
    }

    fn publish_update(&self, order_id: &str, reason: Option<&str>) {
        if let Some(order) = self.store.get(order_id) {
            self.bus.publish_order_update(OrderUpdateEvent {
                order,
                reason: reason.map(str::to_string),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::account::AccountThresholds;
    use crate::domain::order::{OrderSide, OrderType, TimeInForce};
    use crate::domain::policy::{PolicyAction, PolicyOperator, PolicyScope, RiskPolicy};
    use crate::exchange::MockExchange;
    use crate::exchange::mock::ScriptedFailure;
    use crate::marketdata::MarketDataBus;
    use crate::resilience::{BreakerConfig, RateLimitConfig};

    struct Fixture {
        engine: Arc<OrderExecutionEngine>,
        exchange: Arc<MockExchange>,
        stop: Arc<EmergencyStop>,
    }

    fn rules() -> HashMap<String, SymbolRules> {
        let mut map = HashMap::new();
        map.insert(
            "BTCUSDT".to_string(),
            SymbolRules {
                symbol: "BTCUSDT".to_string(),
                min_qty: dec!(0.001),
                max_qty: dec!(10),
                step_size: dec!(0.001),
                tick_size: dec!(0.01),
                min_notional: dec!(10),
                enabled: true,
            },
        );
        map
    }

    fn fixture_with(
        settings: EngineSettings,
        limiter: RateLimitConfig,
        breaker: BreakerConfig,
        policies: Vec<RiskPolicy>,
    ) -> Fixture {
        let bus = Arc::new(EventBus::with_defaults());
        let marketdata = Arc::new(MarketDataBus::default());
        let monitor = Arc::new(AccountMonitor::new(
            Arc::clone(&bus),
            Arc::clone(&marketdata),
            AccountThresholds::default(),
        ));
        let exchange = MockExchange::new();
        let stop = Arc::new(EmergencyStop::new());
        let engine = Arc::new(OrderExecutionEngine::new(
            settings,
            Arc::clone(&exchange) as Arc<dyn ExchangePort>,
            Arc::new(RiskManager::new(policies)),
            Arc::clone(&stop),
            Arc::new(RateLimiterRegistry::new(limiter)),
            Arc::new(BreakerRegistry::new(breaker)),
            bus,
            monitor,
            rules(),
        ));
        Fixture {
            engine,
            exchange,
            stop,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            EngineSettings {
                retry: RetryPolicy {
                    max_attempts: 0,
                    ..RetryPolicy::mutations()
                },
                ..Default::default()
            },
            RateLimitConfig {
                tokens_per_second: 1_000.0,
                burst: 1_000,
                per_second_cap: 0,
                per_minute_cap: 0,
            },
            BreakerConfig::default(),
            vec![],
        )
    }

    fn signal(client_order_id: &str) -> OrderSignal {
        OrderSignal {
            strategy_id: "alpha".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: dec!(0.001),
            price: Some(dec!(45000)),
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            post_only: false,
            client_order_id: Some(client_order_id.to_string()),
        }
    }

    #[tokio::test]
    async fn happy_path_submits_and_tracks() {
        let f = fixture();
        let outcome = f.engine.submit(signal("c1")).await;

        assert!(outcome.accepted);
        let order = f.engine.query(&outcome.order_id).unwrap();
        assert_eq!(order.state, OrderState::Submitted);
        assert!(order.exchange_order_id.is_some());
    }

    #[tokio::test]
    async fn resubmit_returns_existing_order() {
        let f = fixture();
        let first = f.engine.submit(signal("c1")).await;
        let second = f.engine.submit(signal("c1")).await;

        assert_eq!(first.order_id, second.order_id);
        assert!(second.accepted);
        assert_eq!(f.engine.store().count(), 1);
        assert_eq!(f.exchange.place_calls(), 1);
    }

    #[tokio::test]
    async fn validation_rejects_without_venue_call() {
        let f = fixture();
        let mut bad = signal("c1");
        bad.quantity = dec!(0.0005); // below min_qty

        let outcome = f.engine.submit(bad).await;
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason.as_deref(), Some(reasons::VALIDATION));
        assert_eq!(f.exchange.place_calls(), 0);

        let order = f.engine.query(&outcome.order_id).unwrap();
        assert_eq!(order.state, OrderState::Rejected);
    }

    #[tokio::test]
    async fn unknown_symbol_rejected() {
        let f = fixture();
        let mut unknown = signal("c1");
        unknown.symbol = "DOGEUSDT".to_string();

        let outcome = f.engine.submit(unknown).await;
        assert_eq!(outcome.reason.as_deref(), Some(reasons::UNKNOWN_SYMBOL));
    }

    #[tokio::test]
    async fn risk_block_rejects() {
        let f = fixture_with(
            EngineSettings::default(),
            RateLimitConfig::default(),
            BreakerConfig::default(),
            vec![RiskPolicy {
                id: "max-notional".to_string(),
                name: "max order notional".to_string(),
                metric: "order_notional".to_string(),
                operator: PolicyOperator::Gt,
                threshold: dec!(10),
                scope: PolicyScope::Global,
                scope_id: None,
                action: PolicyAction::Block,
                priority: 0,
                enabled: true,
                version: 1,
            }],
        );

        let outcome = f.engine.submit(signal("c1")).await;
        assert_eq!(outcome.reason.as_deref(), Some(reasons::RISK_BLOCKED));
        assert_eq!(f.exchange.place_calls(), 0);
    }

    #[tokio::test]
    async fn halted_engine_rejects_submissions() {
        let f = fixture();
        f.stop.engage("manual", "test", "ops", None);

        let outcome = f.engine.submit(signal("c1")).await;
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason.as_deref(), Some(reasons::HALTED));
        assert_eq!(f.exchange.place_calls(), 0);

        f.stop.release("ops");
        let after = f.engine.submit(signal("c2")).await;
        assert!(after.accepted);
    }

    #[tokio::test]
    async fn rate_limited_storm_rejects_overflow() {
        let f = fixture_with(
            EngineSettings::default(),
            RateLimitConfig {
                tokens_per_second: 10.0,
                burst: 10,
                per_second_cap: 0,
                per_minute_cap: 0,
            },
            BreakerConfig::default(),
            vec![],
        );

        let mut accepted = 0;
        let mut limited = 0;
        for i in 0..15 {
            let outcome = f.engine.submit(signal(&format!("c{i}"))).await;
            if outcome.accepted {
                accepted += 1;
            } else if outcome.reason.as_deref() == Some(reasons::RATE_LIMITED) {
                limited += 1;
            }
        }
        assert_eq!(accepted, 10);
        assert_eq!(limited, 5);

        // After refill the rejected five go through.
        tokio::time::sleep(Duration::from_secs(1)).await;
        for i in 15..20 {
            assert!(f.engine.submit(signal(&format!("c{i}"))).await.accepted);
        }
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures() {
        let f = fixture_with(
            EngineSettings {
                retry: RetryPolicy {
                    max_attempts: 0,
                    ..RetryPolicy::mutations()
                },
                ..Default::default()
            },
            RateLimitConfig {
                tokens_per_second: 1_000.0,
                burst: 1_000,
                per_second_cap: 0,
                per_minute_cap: 0,
            },
            BreakerConfig {
                failure_threshold: 5,
                failure_window: Duration::from_secs(60),
                cooldown: Duration::from_millis(50),
                half_open_probes: 1,
            },
            vec![],
        );
        f.exchange.fail_next_places(
            std::iter::repeat_with(|| ScriptedFailure::Transient).take(5),
        );

        for i in 0..5 {
            let outcome = f.engine.submit(signal(&format!("c{i}"))).await;
            assert_eq!(outcome.reason.as_deref(), Some(reasons::INDETERMINATE));
        }
        assert_eq!(f.exchange.place_calls(), 0);

        // Sixth submission fails fast without touching the venue.
        let sixth = f.engine.submit(signal("c5")).await;
        assert_eq!(sixth.reason.as_deref(), Some(reasons::BREAKER_OPEN));

        // After cooldown one probe is admitted and success closes the
        // breaker.
        tokio::time::sleep(Duration::from_millis(80)).await;
        let probe = f.engine.submit(signal("c6")).await;
        assert!(probe.accepted);
        let after = f.engine.submit(signal("c7")).await;
        assert!(after.accepted);
    }

    #[tokio::test]
    async fn venue_rejection_is_definitive() {
        let f = fixture();
        f.exchange.fail_next_places([ScriptedFailure::Rejected {
            code: -2010,
            message: "insufficient balance".to_string(),
        }]);

        let outcome = f.engine.submit(signal("c1")).await;
        assert_eq!(outcome.reason.as_deref(), Some(reasons::EXCHANGE_REJECTED));
        let order = f.engine.query(&outcome.order_id).unwrap();
        assert_eq!(order.state, OrderState::Rejected);
        assert!(!order.pending_reconcile);
    }

    #[tokio::test]
    async fn timeout_marks_pending_reconcile() {
        let f = fixture();
        f.exchange.lose_next_place_response();

        let outcome = f.engine.submit(signal("c1")).await;
        assert_eq!(outcome.reason.as_deref(), Some(reasons::INDETERMINATE));

        let order = f.engine.query(&outcome.order_id).unwrap();
        assert_eq!(order.state, OrderState::New);
        assert!(order.pending_reconcile);
    }

    #[tokio::test]
    async fn cancel_lifecycle() {
        let f = fixture();
        let outcome = f.engine.submit(signal("c1")).await;

        assert_eq!(
            f.engine.cancel(&outcome.order_id).await.unwrap(),
            CancelOutcome::Ok
        );
        assert_eq!(
            f.engine.query(&outcome.order_id).unwrap().state,
            OrderState::Canceled
        );

        // Second cancel is a no-op.
        assert_eq!(
            f.engine.cancel(&outcome.order_id).await.unwrap(),
            CancelOutcome::AlreadyTerminal
        );
        assert_eq!(
            f.engine.cancel("missing").await.unwrap(),
            CancelOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn cancel_by_client_order_id() {
        let f = fixture();
        f.engine.submit(signal("c1")).await;
        assert_eq!(f.engine.cancel("c1").await.unwrap(), CancelOutcome::Ok);
    }

    #[tokio::test]
    async fn fills_flow_into_order_and_position() {
        let f = fixture();
        let mut stream = f.exchange.subscribe_user_stream().await.unwrap();
        let outcome = f.engine.submit(signal("c1")).await;

        f.exchange.fill_order("c1", dec!(0.001), dec!(45000)).await;
        // Drain the events the mock queued for this subscriber.
        while let Ok(event) = stream.try_recv() {
            f.engine.handle_user_event(event);
        }

        let order = f.engine.query(&outcome.order_id).unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.filled_quantity, dec!(0.001));
    }

    #[tokio::test]
    async fn duplicate_fill_is_ignored() {
        let f = fixture();
        let outcome = f.engine.submit(signal("c1")).await;
        let order = f.engine.query(&outcome.order_id).unwrap();
        let exchange_id = order.exchange_order_id.clone().unwrap();

        let fill = Fill {
            fill_id: "f1".to_string(),
            order_id: exchange_id,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            price: dec!(45000),
            quantity: dec!(0.0005),
            fee: dec!(0.01),
            fee_asset: "USDT".to_string(),
            is_maker: false,
            timestamp: Utc::now(),
        };
        f.engine.handle_user_event(UserStreamEvent::Fill(fill.clone()));
        f.engine.handle_user_event(UserStreamEvent::Fill(fill));

        let order = f.engine.query(&outcome.order_id).unwrap();
        assert_eq!(order.filled_quantity, dec!(0.0005));
        assert_eq!(order.state, OrderState::PartiallyFilled);
    }

    #[tokio::test]
    async fn overflow_fill_halts_the_key() {
        let f = fixture();
        let outcome = f.engine.submit(signal("c1")).await;
        let order = f.engine.query(&outcome.order_id).unwrap();
        let exchange_id = order.exchange_order_id.clone().unwrap();

        let make_fill = |id: &str, qty: Decimal| Fill {
            fill_id: id.to_string(),
            order_id: exchange_id.clone(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            price: dec!(45000),
            quantity: qty,
            fee: dec!(0.01),
            fee_asset: "USDT".to_string(),
            is_maker: false,
            timestamp: Utc::now(),
        };

        f.engine
            .handle_user_event(UserStreamEvent::Fill(make_fill("f1", dec!(0.002))));

        assert!(f.engine.store().is_key_halted(&outcome.order_id));
        // Further mutations are refused until resume.
        f.engine
            .handle_user_event(UserStreamEvent::Fill(make_fill("f2", dec!(0.0005))));
        let order = f.engine.query(&outcome.order_id).unwrap();
        assert_eq!(order.filled_quantity, Decimal::ZERO);
    }

    #[tokio::test]
    async fn drain_cancels_all_open_orders() {
        let f = fixture();
        f.engine.submit(signal("c1")).await;
        f.engine.submit(signal("c2")).await;
        f.engine.submit(signal("c3")).await;

        let drained = f.engine.drain_open_orders("test").await;
        assert_eq!(drained, 3);
        assert!(f.engine.store().active_orders().is_empty());
    }
}
