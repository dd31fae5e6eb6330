//! Resolution of indeterminate submissions.
//!
//! An order whose venue response was lost stays in `NEW` with
//! `pending_reconcile` set. On each tick the reconciler asks the venue for
//! the order's idempotency key:
//!
//! - found → the order reached the venue; adopt the venue view.
//! - definitively absent → the order was never placed; reject it as
//!   `not_placed` (no automatic resubmission).
//! - query keeps failing past the ambiguity window → reject as
//!   `ambiguous_timeout` and raise an alert.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{OrderExecutionEngine, reasons};
use crate::domain::alert::{Alert, AlertKind};
use crate::domain::order::OrderState;

/// Reconciler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Interval between resolution sweeps.
    pub interval: Duration,
    /// How long an unresolved order may stay ambiguous before it is
    /// force-rejected.
    pub ambiguity_window: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            ambiguity_window: Duration::from_secs(60),
        }
    }
}

/// Background resolver for `pending_reconcile` orders.
pub struct OrderReconciler {
    config: ReconcileConfig,
    engine: Arc<OrderExecutionEngine>,
}

impl OrderReconciler {
    /// Create a reconciler over the engine's store.
    #[must_use]
    pub fn new(config: ReconcileConfig, engine: Arc<OrderExecutionEngine>) -> Self {
        Self { config, engine }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("order reconciler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.resolve_pending().await;
                }
            }
        }
    }

    /// One resolution sweep. Exposed for tests.
    pub async fn resolve_pending(&self) {
        let pending = self.engine.store().pending_reconcile_orders();
        if pending.is_empty() {
            return;
        }
        tracing::debug!(count = pending.len(), "resolving pending submissions");

        for order in pending {
            match self
                .engine
                .exchange()
                .query_order(&order.symbol, &order.client_order_id)
                .await
            {
                Ok(Some(venue)) => {
                    // The venue has it: the submission landed.
                    let exchange_id = venue.exchange_order_id.clone();
                    let result = self.engine.store().mutate(&order.order_id, |o| {
                        o.pending_reconcile = false;
                        if o.state == OrderState::New {
                            o.mark_submitted(exchange_id)
                        } else {
                            Ok(())
                        }
                    });
                    match result {
                        Ok(_) => {
                            tracing::info!(
                                order_id = %order.order_id,
                                venue_state = %venue.state,
                                "indeterminate submission resolved as placed"
                            );
                            metrics::counter!("reconcile_resolved", "outcome" => "placed")
                                .increment(1);
                            self.engine.publish_order(&order.order_id, "reconciled");
                        }
                        Err(e) => {
                            tracing::warn!(order_id = %order.order_id, error = %e, "resolution raced another update");
                        }
                    }
                }
                Ok(None) => {
                    // Definitively absent: never placed. Policy is not to
                    // resubmit automatically.
                    let _ = self.engine.store().mutate(&order.order_id, |o| {
                        o.pending_reconcile = false;
                        o.mark_rejected(reasons::NOT_PLACED)
                    });
                    tracing::info!(
                        order_id = %order.order_id,
                        "indeterminate submission resolved as not placed"
                    );
                    metrics::counter!("reconcile_resolved", "outcome" => "not_placed")
                        .increment(1);
                    self.engine.publish_order(&order.order_id, reasons::NOT_PLACED);
                }
                Err(e) => {
                    let age = Utc::now().signed_duration_since(order.updated_at);
                    let window = chrono::Duration::from_std(self.config.ambiguity_window)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    if age > window {
                        let _ = self.engine.store().mutate(&order.order_id, |o| {
                            o.pending_reconcile = false;
                            o.mark_rejected(reasons::AMBIGUOUS_TIMEOUT)
                        });
                        self.engine.bus().publish_alert(
                            Alert::new(
                                AlertKind::AmbiguousOrder,
                                format!(
                                    "order {} unresolved after {}s, forced to REJECTED",
                                    order.order_id,
                                    window.num_seconds()
                                ),
                            )
                            .with_subject(order.order_id.clone()),
                        );
                        metrics::counter!("reconcile_resolved", "outcome" => "ambiguous_timeout")
                            .increment(1);
                        self.engine
                            .publish_order(&order.order_id, reasons::AMBIGUOUS_TIMEOUT);
                    } else {
                        tracing::debug!(
                            order_id = %order.order_id,
                            error = %e,
                            "order still ambiguous, retrying next sweep"
                        );
                    }
                }
            }
        }
    }
}

// Small accessors the reconciler needs from the engine.
impl OrderExecutionEngine {
    pub(crate) fn exchange(&self) -> &Arc<dyn crate::exchange::ExchangePort> {
        &self.exchange
    }

    pub(crate) fn bus(&self) -> &Arc<crate::bus::EventBus> {
        &self.bus
    }

    pub(crate) fn publish_order(&self, order_id: &str, reason: &str) {
        if let Some(order) = self.store().get(order_id) {
            self.bus.publish_order_update(crate::bus::OrderUpdateEvent {
                order,
                reason: Some(reason.to_string()),
            });
        }
    }
}
