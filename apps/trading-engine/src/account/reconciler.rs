//! Periodic account reconciliation against the exchange.
//!
//! Each tick fetches the venue snapshot, computes per-entity drift, and for
//! drifts beyond tolerance emits an alert and replaces the local value (the
//! exchange is authoritative). Sub-tolerance drifts are counted but
//! otherwise ignored. A failed fetch advances nothing; the next tick
//! retries.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::AccountMonitor;
use crate::domain::alert::{Alert, AlertKind};
use crate::exchange::{ExchangeError, ExchangePort};

/// Reconciler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Interval between reconciliation runs.
    pub interval: Duration,
    /// Absolute tolerance for balance drift.
    pub balance_tolerance: Decimal,
    /// Absolute tolerance for position drift.
    pub position_tolerance: Decimal,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            balance_tolerance: Decimal::new(1, 6),  // 0.000001
            position_tolerance: Decimal::new(1, 6), // 0.000001
        }
    }
}

/// Outcome of one reconciliation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Balance drifts beyond tolerance (corrected).
    pub balance_drifts: u32,
    /// Position drifts beyond tolerance (corrected).
    pub position_drifts: u32,
    /// Drifts within tolerance (ignored).
    pub ignored_drifts: u32,
    /// Run duration in milliseconds.
    pub duration_ms: u64,
}

impl ReconcileReport {
    /// Whether the run corrected anything.
    #[must_use]
    pub const fn corrected_anything(&self) -> bool {
        self.balance_drifts > 0 || self.position_drifts > 0
    }
}

/// Periodic reconciliation loop.
pub struct AccountReconciler {
    config: ReconcilerConfig,
    monitor: Arc<AccountMonitor>,
    exchange: Arc<dyn ExchangePort>,
    store: Option<Arc<crate::persistence::TradingStore>>,
}

impl AccountReconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        config: ReconcilerConfig,
        monitor: Arc<AccountMonitor>,
        exchange: Arc<dyn ExchangePort>,
    ) -> Self {
        Self {
            config,
            monitor,
            exchange,
            store: None,
        }
    }

    /// Record run reports into the time-series table.
    #[must_use]
    pub fn with_store(mut self, store: Arc<crate::persistence::TradingStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("account reconciler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.reconcile_once().await {
                        Ok(report) => {
                            tracing::debug!(
                                balance_drifts = report.balance_drifts,
                                position_drifts = report.position_drifts,
                                ignored = report.ignored_drifts,
                                duration_ms = report.duration_ms,
                                "reconciliation complete"
                            );
                            if let Some(store) = &self.store
                                && let Err(e) = store.save_reconciliation_run(&report).await
                            {
                                tracing::warn!(error = %e, "reconciliation report persist failed");
                            }
                        }
                        Err(e) => {
                            // Local state does not advance on failure.
                            tracing::warn!(error = %e, "reconciliation failed, retrying next tick");
                            metrics::counter!("reconciliation_failures").increment(1);
                        }
                    }
                }
            }
        }
    }

    /// One reconciliation pass.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, ExchangeError> {
        let started = std::time::Instant::now();
        let snapshot = self.exchange.get_account().await?;
        let mut report = ReconcileReport::default();

        for venue_balance in &snapshot.balances {
            let local_total = self
                .monitor
                .balance(&venue_balance.asset)
                .map_or(Decimal::ZERO, |b| b.total());
            let venue_total = venue_balance.free + venue_balance.locked;
            let drift = venue_total - local_total;

            if drift.abs() > self.config.balance_tolerance {
                report.balance_drifts += 1;
                self.monitor.alert_emitter().emit(
                    Alert::new(
                        AlertKind::BalanceDrift,
                        format!(
                            "{} balance drift {drift}: local {local_total}, exchange {venue_total}",
                            venue_balance.asset
                        ),
                    )
                    .with_subject(venue_balance.asset.clone()),
                );
                self.monitor.correct_balance(
                    &venue_balance.asset,
                    venue_balance.free,
                    venue_balance.locked,
                );
            } else if !drift.is_zero() {
                report.ignored_drifts += 1;
            }
        }

        for venue_position in &snapshot.positions {
            let local_quantity = self
                .monitor
                .position(&venue_position.symbol)
                .map_or(Decimal::ZERO, |p| p.quantity);
            let drift = venue_position.quantity - local_quantity;

            if drift.abs() > self.config.position_tolerance {
                report.position_drifts += 1;
                self.monitor.alert_emitter().emit(
                    Alert::new(
                        AlertKind::PositionDrift,
                        format!(
                            "{} position drift {drift}: local {local_quantity}, exchange {}",
                            venue_position.symbol, venue_position.quantity
                        ),
                    )
                    .with_subject(venue_position.symbol.clone()),
                );
                self.monitor.correct_position(
                    &venue_position.symbol,
                    venue_position.quantity,
                    venue_position.entry_price,
                );
            } else if !drift.is_zero() {
                report.ignored_drifts += 1;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        metrics::histogram!("reconciliation_duration_ms").record(report.duration_ms as f64);
        metrics::counter!("reconciliation_runs").increment(1);
        Ok(report)
    }
}
