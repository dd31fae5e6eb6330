//! Application wiring.
//!
//! Builds every component from [`EngineConfig`], restores durable state,
//! and runs the background tasks: user-stream consumer, halt listener,
//! account and order reconcilers, risk sweep, config watcher, persistence
//! writer, stream-loss watchdog, and the HTTP server.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::account::{AccountMonitor, AccountReconciler};
use crate::bus::EventBus;
use crate::config::{EngineConfig, ExchangeKind};
use crate::configstore::{ConfigStore, ConfigType};
use crate::domain::alert::{Alert, AlertKind};
use crate::exchange::{ExchangePort, MockExchange, RestExchangeClient};
use crate::marketdata::MarketDataBus;
use crate::oee::{OrderExecutionEngine, OrderReconciler};
use crate::persistence::{PersistenceWriter, TradingStore};
use crate::resilience::{BreakerRegistry, RateLimiterRegistry};
use crate::risk::{EmergencyStop, MetricSet, RiskManager, RiskVerdict};
use crate::server::{AppState, create_router, serve};

/// Interval of the background risk sweep over account metrics.
const RISK_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// The composed trading engine application.
pub struct TradingApp {
    config: EngineConfig,
    engine: Arc<OrderExecutionEngine>,
    monitor: Arc<AccountMonitor>,
    risk: Arc<RiskManager>,
    stop: Arc<EmergencyStop>,
    configstore: Arc<ConfigStore>,
    bus: Arc<EventBus>,
    marketdata: Arc<MarketDataBus>,
    store: Arc<TradingStore>,
}

impl TradingApp {
    /// Build all components and restore durable state.
    pub async fn build(config: EngineConfig) -> anyhow::Result<Self> {
        let bus = Arc::new(EventBus::with_defaults());
        let marketdata = Arc::new(MarketDataBus::default());
        let configstore = Arc::new(ConfigStore::new());
        let stop = Arc::new(EmergencyStop::new());

        let exchange: Arc<dyn ExchangePort> = match config.exchange.kind {
            ExchangeKind::Mock => MockExchange::new(),
            ExchangeKind::Rest => {
                Arc::new(RestExchangeClient::new(config.exchange.rest_config())?)
            }
        };

        let monitor = Arc::new(AccountMonitor::new(
            Arc::clone(&bus),
            Arc::clone(&marketdata),
            config.account.thresholds(),
        ));
        let risk = Arc::new(RiskManager::new(configstore.risk_policies()));
        let engine = Arc::new(OrderExecutionEngine::new(
            config.engine.settings(),
            Arc::clone(&exchange),
            Arc::clone(&risk),
            Arc::clone(&stop),
            Arc::new(RateLimiterRegistry::new(config.limits.rate_limit())),
            Arc::new(BreakerRegistry::new(config.limits.breaker())),
            Arc::clone(&bus),
            Arc::clone(&monitor),
            configstore.symbol_rules(),
        ));

        let store = Arc::new(TradingStore::open(&config.persistence.db_path).await?);

        // Crash recovery: reload non-terminal orders; NEW ones come back
        // marked pending_reconcile and the order reconciler resolves them.
        for order in store.load_open_orders().await? {
            if let Err(e) = engine.store().insert(order) {
                tracing::warn!(error = %e, "skipping unrecoverable order row");
            }
        }

        Ok(Self {
            config,
            engine,
            monitor,
            risk,
            stop,
            configstore,
            bus,
            marketdata,
            store,
        })
    }

    /// The engine (tests and embedding).
    #[must_use]
    pub fn engine(&self) -> Arc<OrderExecutionEngine> {
        Arc::clone(&self.engine)
    }

    /// The configuration store (tests and embedding).
    #[must_use]
    pub fn configstore(&self) -> Arc<ConfigStore> {
        Arc::clone(&self.configstore)
    }

    /// Run all tasks until the cancellation token fires.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let reconciler = Arc::new(
            AccountReconciler::new(
                self.config.reconciliation.account_reconciler(),
                Arc::clone(&self.monitor),
                self.engine.exchange_port(),
            )
            .with_store(Arc::clone(&self.store)),
        );

        let mut tasks = tokio::task::JoinSet::new();

        tasks.spawn(Arc::clone(&self.engine).run_user_stream(cancel.child_token()));
        tasks.spawn(Arc::clone(&self.engine).run_halt_listener(cancel.child_token()));
        tasks.spawn(Arc::clone(&reconciler).run(cancel.child_token()));
        tasks.spawn(
            OrderReconciler::new(
                self.config.reconciliation.order_reconciler(),
                Arc::clone(&self.engine),
            )
            .run(cancel.child_token()),
        );
        tasks.spawn(
            PersistenceWriter::new(Arc::clone(&self.store), Arc::clone(&self.bus))
                .run(cancel.child_token()),
        );
        tasks.spawn(risk_sweep(
            Arc::clone(&self.monitor),
            Arc::clone(&self.risk),
            Arc::clone(&self.stop),
            cancel.child_token(),
        ));
        tasks.spawn(config_watcher(
            Arc::clone(&self.configstore),
            Arc::clone(&self.engine),
            Arc::clone(&self.risk),
            Arc::clone(&self.bus),
            cancel.child_token(),
        ));
        if self.config.safety.mass_cancel_on_stream_loss {
            tasks.spawn(stream_loss_watchdog(
                Arc::clone(&self.engine),
                Arc::clone(&self.bus),
                Duration::from_secs(self.config.safety.grace_period_secs),
                cancel.child_token(),
            ));
        }

        let state = AppState {
            engine: Arc::clone(&self.engine),
            monitor: Arc::clone(&self.monitor),
            risk: Arc::clone(&self.risk),
            configstore: Arc::clone(&self.configstore),
            stop: Arc::clone(&self.stop),
            bus: Arc::clone(&self.bus),
            marketdata: Arc::clone(&self.marketdata),
            reconciler,
            admin_token: self.config.server.admin_token.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let router = create_router(state);
        let http_port = self.config.server.http_port;
        let http_cancel = cancel.child_token();
        tasks.spawn(async move {
            if let Err(e) = serve(router, http_port, http_cancel).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        });

        tracing::info!("trading engine ready");
        cancel.cancelled().await;
        tracing::info!("shutdown requested, stopping tasks");
        tasks.shutdown().await;
        Ok(())
    }
}

impl OrderExecutionEngine {
    /// Clone the exchange port for sibling components.
    #[must_use]
    pub fn exchange_port(&self) -> Arc<dyn ExchangePort> {
        Arc::clone(self.exchange())
    }
}

/// Periodic evaluation of account-level metrics against risk policies.
async fn risk_sweep(
    monitor: Arc<AccountMonitor>,
    risk: Arc<RiskManager>,
    stop: Arc<EmergencyStop>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(RISK_SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let snapshot = monitor.check_thresholds();
                let metrics = MetricSet::new()
                    .with("equity", snapshot.equity)
                    .with("drawdown_pct", snapshot.drawdown_pct)
                    .with("margin_ratio", snapshot.margin_ratio)
                    .with("unrealized_pnl", snapshot.unrealized_pnl);

                if let RiskVerdict::Halt { policy_id, reason } = risk.evaluate(&metrics) {
                    let account = serde_json::to_value(&snapshot).ok();
                    stop.engage(&format!("policy:{policy_id}"), &reason, "risk-sweep", account);
                }
            }
        }
    }
}

/// Applies configuration changes to live components and mirrors them onto
/// the bus.
async fn config_watcher(
    configstore: Arc<ConfigStore>,
    engine: Arc<OrderExecutionEngine>,
    risk: Arc<RiskManager>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
) {
    let mut changes = configstore.watch();
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            change = changes.recv() => {
                match change {
                    Ok(event) => {
                        match event.config_type.as_str() {
                            t if t == ConfigType::TradingPair.as_str() => {
                                engine.reload_rules(configstore.symbol_rules());
                            }
                            t if t == ConfigType::RiskLimit.as_str() => {
                                risk.reload(configstore.risk_policies());
                            }
                            _ => {}
                        }
                        bus.publish_config_change(event);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "config watcher lagged, reloading everything");
                        engine.reload_rules(configstore.symbol_rules());
                        risk.reload(configstore.risk_policies());
                    }
                }
            }
        }
    }
}

/// Cancels open orders if the user-data stream stays down past the grace
/// period. Re-arms after reconnect.
async fn stream_loss_watchdog(
    engine: Arc<OrderExecutionEngine>,
    bus: Arc<EventBus>,
    grace_period: Duration,
    cancel: CancellationToken,
) {
    let mut disconnected_since: Option<std::time::Instant> = None;
    let mut fired = false;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if engine.stream_connected() {
                    disconnected_since = None;
                    fired = false;
                    continue;
                }
                let since = *disconnected_since.get_or_insert_with(std::time::Instant::now);
                if !fired && since.elapsed() >= grace_period {
                    fired = true;
                    tracing::warn!(
                        grace_secs = grace_period.as_secs(),
                        "user stream lost past grace period, mass-canceling open orders"
                    );
                    bus.publish_alert(Alert::new(
                        AlertKind::StreamDisconnected,
                        format!(
                            "user stream disconnected for {}s, mass cancel engaged",
                            grace_period.as_secs()
                        ),
                    ));
                    engine.drain_open_orders("stream_loss").await;
                }
            }
        }
    }
}
