//! End-to-end scenarios through the public engine API against the
//! in-memory venue.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use trading_engine::account::{AccountMonitor, AccountThresholds};
use trading_engine::bus::EventBus;
use trading_engine::configstore::{ConfigStore, ConfigType};
use trading_engine::domain::signal::OrderSignal;
use trading_engine::domain::symbol_rules::SymbolRules;
use trading_engine::exchange::{ExchangePort, MockExchange};
use trading_engine::marketdata::MarketDataBus;
use trading_engine::oee::{EngineSettings, OrderExecutionEngine, reasons};
use trading_engine::resilience::{
    BreakerConfig, BreakerRegistry, RateLimitConfig, RateLimiterRegistry, RetryPolicy,
};
use trading_engine::risk::{EmergencyStop, MetricSet, RiskManager, RiskVerdict};
use trading_engine::{OrderSide, OrderState, OrderType, TimeInForce};

struct World {
    engine: Arc<OrderExecutionEngine>,
    exchange: Arc<MockExchange>,
    monitor: Arc<AccountMonitor>,
    risk: Arc<RiskManager>,
    stop: Arc<EmergencyStop>,
    configstore: Arc<ConfigStore>,
}

fn btc_rules() -> HashMap<String, SymbolRules> {
    let mut rules = HashMap::new();
    rules.insert(
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
    rules
}

fn build_world() -> World {
    let bus = Arc::new(EventBus::with_defaults());
    let marketdata = Arc::new(MarketDataBus::default());
    let configstore = Arc::new(ConfigStore::new());
    let monitor = Arc::new(AccountMonitor::new(
        Arc::clone(&bus),
        Arc::clone(&marketdata),
        AccountThresholds::default(),
    ));
    let exchange = MockExchange::new();
    let stop = Arc::new(EmergencyStop::new());
    let risk = Arc::new(RiskManager::new(configstore.risk_policies()));

    let engine = Arc::new(OrderExecutionEngine::new(
        EngineSettings {
            retry: RetryPolicy {
                max_attempts: 0,
                ..RetryPolicy::mutations()
            },
            ..Default::default()
        },
        Arc::clone(&exchange) as Arc<dyn ExchangePort>,
        Arc::clone(&risk),
        Arc::clone(&stop),
        Arc::new(RateLimiterRegistry::new(RateLimitConfig {
            tokens_per_second: 1_000.0,
            burst: 1_000,
            per_second_cap: 0,
            per_minute_cap: 0,
        })),
        Arc::new(BreakerRegistry::new(BreakerConfig::default())),
        bus,
        Arc::clone(&monitor),
        btc_rules(),
    ));

    World {
        engine,
        exchange,
        monitor,
        risk,
        stop,
        configstore,
    }
}

fn limit_buy(client_order_id: &str, qty: Decimal, price: Decimal) -> OrderSignal {
    OrderSignal {
        strategy_id: "alpha".to_string(),
        symbol: "BTCUSDT".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Limit,
        quantity: qty,
        price: Some(price),
        stop_price: None,
        time_in_force: TimeInForce::Gtc,
        reduce_only: false,
        post_only: false,
        client_order_id: Some(client_order_id.to_string()),
    }
}

/// Pump every queued user-stream event into the engine.
async fn pump(
    world: &World,
    stream: &mut tokio::sync::mpsc::Receiver<trading_engine::exchange::UserStreamEvent>,
) {
    while let Ok(event) = stream.try_recv() {
        world.engine.handle_user_event(event);
    }
}

#[tokio::test]
async fn happy_limit_order_flows_to_position_and_balance() {
    let world = build_world();
    let mut stream = world.exchange.subscribe_user_stream().await.unwrap();

    // Starting balance reported by the venue.
    world.engine.handle_user_event(
        trading_engine::exchange::UserStreamEvent::BalanceUpdate {
            asset: "USDT".to_string(),
            free: dec!(1000),
            locked: Decimal::ZERO,
        },
    );

    let outcome = world
        .engine
        .submit(limit_buy("c1", dec!(0.001), dec!(45000)))
        .await;
    assert!(outcome.accepted);
    assert_eq!(
        world.engine.query(&outcome.order_id).unwrap().state,
        OrderState::Submitted
    );

    // The venue fills the order and reports the balance change.
    world
        .exchange
        .fill_order("c1", dec!(0.001), dec!(45000))
        .await;
    let fee = dec!(0.045); // 0.1% of 45 notional
    world
        .exchange
        .emit(trading_engine::exchange::UserStreamEvent::BalanceUpdate {
            asset: "USDT".to_string(),
            free: dec!(1000) - dec!(45) - fee,
            locked: Decimal::ZERO,
        })
        .await;
    pump(&world, &mut stream).await;

    let order = world.engine.query(&outcome.order_id).unwrap();
    assert_eq!(order.state, OrderState::Filled);
    assert_eq!(order.filled_quantity, dec!(0.001));
    assert_eq!(order.avg_price, dec!(45000));

    let position = world.monitor.position("BTCUSDT").unwrap();
    assert_eq!(position.quantity, dec!(0.001));
    assert_eq!(position.avg_entry_price, dec!(45000));

    let balance = world.monitor.balance("USDT").unwrap();
    assert_eq!(balance.free, dec!(1000) - dec!(45) - fee);
}

#[tokio::test]
async fn resubmit_same_client_order_id_is_idempotent() {
    let world = build_world();

    let first = world
        .engine
        .submit(limit_buy("c1", dec!(0.001), dec!(45000)))
        .await;
    let second = world
        .engine
        .submit(limit_buy("c1", dec!(0.001), dec!(45000)))
        .await;

    assert_eq!(first.order_id, second.order_id);
    assert_eq!(world.engine.store().count(), 1);
    assert_eq!(world.exchange.place_calls(), 1);
}

#[tokio::test]
async fn emergency_stop_on_drawdown_policy() {
    let world = build_world();

    // Policy straight from the configuration store, the way the risk
    // manager receives it in production.
    world
        .configstore
        .create(
            "risk.max-drawdown",
            ConfigType::RiskLimit,
            serde_json::json!({
                "name": "max drawdown",
                "metric": "drawdown_pct",
                "operator": ">",
                "threshold": "10",
                "scope": "global",
                "action": "emergency_stop"
            }),
            "ops",
            "e2e",
        )
        .unwrap();
    world.risk.reload(world.configstore.risk_policies());

    // Two working orders that the halt must drain.
    let a = world
        .engine
        .submit(limit_buy("c1", dec!(0.001), dec!(45000)))
        .await;
    let b = world
        .engine
        .submit(limit_buy("c2", dec!(0.001), dec!(44000)))
        .await;
    assert!(a.accepted && b.accepted);

    // Equity peaks at 1000, then falls to 895: drawdown 10.5%.
    world.monitor.update_balance("USDT", dec!(1000), Decimal::ZERO);
    world.monitor.snapshot();
    world.monitor.update_balance("USDT", dec!(895), Decimal::ZERO);

    // One sweep iteration, exactly as the background task runs it.
    let snapshot = world.monitor.check_thresholds();
    assert!(snapshot.drawdown_pct > dec!(10));
    let metrics = MetricSet::new().with("drawdown_pct", snapshot.drawdown_pct);
    let verdict = world.risk.evaluate(&metrics);
    let RiskVerdict::Halt { policy_id, reason } = verdict else {
        panic!("expected halt verdict, got {verdict:?}");
    };
    assert_eq!(policy_id, "risk.max-drawdown");

    assert!(world.stop.engage(
        &format!("policy:{policy_id}"),
        &reason,
        "risk-sweep",
        serde_json::to_value(&snapshot).ok(),
    ));
    world.engine.drain_open_orders("emergency_stop").await;

    // Open orders canceled, new submissions refused.
    assert_eq!(
        world.engine.query(&a.order_id).unwrap().state,
        OrderState::Canceled
    );
    assert_eq!(
        world.engine.query(&b.order_id).unwrap().state,
        OrderState::Canceled
    );
    let refused = world
        .engine
        .submit(limit_buy("c3", dec!(0.001), dec!(45000)))
        .await;
    assert_eq!(refused.reason.as_deref(), Some(reasons::HALTED));

    // The halt record captured the account snapshot.
    assert!(world.stop.record().unwrap().account_snapshot.is_some());

    // Explicit resume re-enables submissions.
    assert!(world.stop.release("ops"));
    let after = world
        .engine
        .submit(limit_buy("c4", dec!(0.001), dec!(45000)))
        .await;
    assert!(after.accepted);
}

#[tokio::test]
async fn partial_fills_accumulate_weighted_average() {
    let world = build_world();
    let mut stream = world.exchange.subscribe_user_stream().await.unwrap();

    let outcome = world
        .engine
        .submit(limit_buy("c1", dec!(0.004), dec!(45000)))
        .await;

    world
        .exchange
        .fill_order("c1", dec!(0.001), dec!(44900))
        .await;
    pump(&world, &mut stream).await;
    assert_eq!(
        world.engine.query(&outcome.order_id).unwrap().state,
        OrderState::PartiallyFilled
    );

    world
        .exchange
        .fill_order("c1", dec!(0.003), dec!(45100))
        .await;
    pump(&world, &mut stream).await;

    let order = world.engine.query(&outcome.order_id).unwrap();
    assert_eq!(order.state, OrderState::Filled);
    assert_eq!(order.filled_quantity, dec!(0.004));
    assert_eq!(order.avg_price, dec!(45050));
}

#[tokio::test]
async fn canceled_order_keeps_partial_fill_and_position() {
    let world = build_world();
    let mut stream = world.exchange.subscribe_user_stream().await.unwrap();

    let outcome = world
        .engine
        .submit(limit_buy("c1", dec!(0.004), dec!(45000)))
        .await;
    world
        .exchange
        .fill_order("c1", dec!(0.001), dec!(45000))
        .await;
    pump(&world, &mut stream).await;

    assert_eq!(
        world.engine.cancel(&outcome.order_id).await.unwrap(),
        trading_engine::CancelOutcome::Ok
    );
    pump(&world, &mut stream).await;

    let order = world.engine.query(&outcome.order_id).unwrap();
    assert_eq!(order.state, OrderState::Canceled);
    assert_eq!(order.filled_quantity, dec!(0.001));
    assert_eq!(world.monitor.position("BTCUSDT").unwrap().quantity, dec!(0.001));
}
