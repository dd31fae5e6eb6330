//! Subscriber protocol integration tests against a real WebSocket server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::Duration;

use chrono::Utc;
use dashboard_gateway::{
    Aggregator, FeedRecord, GatewayState, ServerMessage, SessionConfig, create_router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn spawn_gateway(aggregator: Arc<Aggregator>, session: SessionConfig) -> String {
    let state = GatewayState {
        aggregator,
        session_config: session,
        upstream_connected: Arc::new(AtomicBool::new(true)),
        active_sessions: Arc::new(AtomicUsize::new(0)),
        version: "test".to_string(),
    };
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("ws://{addr}/ws")
}

fn record(subject: &str, payload: serde_json::Value) -> FeedRecord {
    FeedRecord {
        subject: subject.to_string(),
        schema_version: 1,
        timestamp: Utc::now(),
        payload,
    }
}

async fn connect(url: &str) -> WsClient {
    let (client, _) = connect_async(url).await.unwrap();
    client
}

async fn next_server_message(client: &mut WsClient) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("socket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(payload) => {
                let _ = client.send(Message::Pong(payload)).await;
            }
            _ => {}
        }
    }
}

fn fast_session() -> SessionConfig {
    SessionConfig {
        default_rate_limit: Duration::from_millis(20),
        min_rate_limit: Duration::from_millis(10),
        max_pending: 64,
        heartbeat_interval: Duration::from_secs(15),
        heartbeat_timeout: Duration::from_secs(45),
    }
}

#[tokio::test]
async fn subscribe_returns_snapshot_then_deltas() {
    let aggregator = Aggregator::new();
    aggregator.ingest(&record(
        "trading.account.balances",
        json!({"asset": "USDT", "free": "1000", "locked": "0"}),
    ));

    let url = spawn_gateway(Arc::clone(&aggregator), fast_session()).await;
    let mut client = connect(&url).await;

    client
        .send(Message::Text(
            json!({"type": "subscribe", "channels": ["balances", "positions"]})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    let ServerMessage::Snapshot { seq, data } = next_server_message(&mut client).await else {
        panic!("expected snapshot first");
    };
    assert_eq!(seq, 1);
    assert_eq!(data["balances"]["USDT"]["free"], "1000");

    aggregator.ingest(&record(
        "trading.account.positions",
        json!({"symbol": "BTCUSDT", "quantity": "0.001"}),
    ));

    let ServerMessage::Delta { seq, changes } = next_server_message(&mut client).await else {
        panic!("expected delta");
    };
    assert_eq!(seq, 2);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].key, "BTCUSDT");
}

#[tokio::test]
async fn seq_is_strictly_monotonic_per_subscription() {
    let aggregator = Aggregator::new();
    let url = spawn_gateway(Arc::clone(&aggregator), fast_session()).await;
    let mut client = connect(&url).await;

    client
        .send(Message::Text(
            json!({"type": "subscribe", "channels": ["orders"]})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    let ServerMessage::Snapshot { seq: mut last, .. } = next_server_message(&mut client).await
    else {
        panic!("expected snapshot");
    };

    for i in 0..20 {
        aggregator.ingest(&record(
            "trading.orders.updates",
            json!({"order": {"order_id": format!("o{i}"), "symbol": "BTCUSDT"}, "reason": null}),
        ));
        // Space updates out so several flushes occur.
        if i % 5 == 4 {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    }

    let mut seen = 0;
    while seen < 20 {
        let ServerMessage::Delta { seq, changes } = next_server_message(&mut client).await else {
            panic!("expected delta");
        };
        assert!(seq > last, "seq {seq} not monotonic after {last}");
        last = seq;
        seen += changes.len();
    }
}

#[tokio::test]
async fn deltas_coalesce_same_entity() {
    let aggregator = Aggregator::new();
    let url = spawn_gateway(
        Arc::clone(&aggregator),
        SessionConfig {
            default_rate_limit: Duration::from_millis(100),
            ..fast_session()
        },
    )
    .await;
    let mut client = connect(&url).await;

    client
        .send(Message::Text(
            json!({"type": "subscribe", "channels": ["positions"]})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    let _ = next_server_message(&mut client).await; // snapshot

    // Three updates to the same symbol inside one flush window.
    for qty in ["1", "2", "3"] {
        aggregator.ingest(&record(
            "trading.account.positions",
            json!({"symbol": "BTCUSDT", "quantity": qty}),
        ));
    }

    let ServerMessage::Delta { changes, .. } = next_server_message(&mut client).await else {
        panic!("expected delta");
    };
    assert_eq!(changes.len(), 1, "updates to one entity must coalesce");
    assert_eq!(changes[0].value["quantity"], "3");
}

#[tokio::test]
async fn symbol_filter_limits_updates() {
    let aggregator = Aggregator::new();
    let url = spawn_gateway(Arc::clone(&aggregator), fast_session()).await;
    let mut client = connect(&url).await;

    client
        .send(Message::Text(
            json!({
                "type": "subscribe",
                "channels": ["positions"],
                "symbols": ["BTCUSDT"]
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();
    let _ = next_server_message(&mut client).await; // snapshot

    aggregator.ingest(&record(
        "trading.account.positions",
        json!({"symbol": "ETHUSDT", "quantity": "9"}),
    ));
    aggregator.ingest(&record(
        "trading.account.positions",
        json!({"symbol": "BTCUSDT", "quantity": "1"}),
    ));

    let ServerMessage::Delta { changes, .. } = next_server_message(&mut client).await else {
        panic!("expected delta");
    };
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].key, "BTCUSDT");
}

#[tokio::test]
async fn app_level_ping_gets_pong() {
    let aggregator = Aggregator::new();
    let url = spawn_gateway(aggregator, fast_session()).await;
    let mut client = connect(&url).await;

    client
        .send(Message::Text(json!({"type": "ping"}).to_string().into()))
        .await
        .unwrap();

    assert!(matches!(
        next_server_message(&mut client).await,
        ServerMessage::Pong
    ));
}

#[tokio::test]
async fn bad_frame_yields_error_not_disconnect() {
    let aggregator = Aggregator::new();
    let url = spawn_gateway(aggregator, fast_session()).await;
    let mut client = connect(&url).await;

    client
        .send(Message::Text(
            json!({"type": "mystery"}).to_string().into(),
        ))
        .await
        .unwrap();
    assert!(matches!(
        next_server_message(&mut client).await,
        ServerMessage::Error { .. }
    ));

    // Session still alive.
    client
        .send(Message::Text(json!({"type": "ping"}).to_string().into()))
        .await
        .unwrap();
    assert!(matches!(
        next_server_message(&mut client).await,
        ServerMessage::Pong
    ));
}

#[tokio::test]
async fn slow_consumer_is_closed_without_affecting_others() {
    let aggregator = Aggregator::new();
    let url = spawn_gateway(
        Arc::clone(&aggregator),
        SessionConfig {
            // Tiny buffer and a long flush interval so the buffer fills.
            default_rate_limit: Duration::from_secs(30),
            min_rate_limit: Duration::from_secs(30),
            max_pending: 4,
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
        },
    )
    .await;

    let mut slow = connect(&url).await;
    slow.send(Message::Text(
        json!({"type": "subscribe", "channels": ["orders"]})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();
    let _ = next_server_message(&mut slow).await; // snapshot

    // More distinct entities than the buffer holds.
    for i in 0..10 {
        aggregator.ingest(&record(
            "trading.orders.updates",
            json!({"order": {"order_id": format!("o{i}"), "symbol": "BTCUSDT"}, "reason": null}),
        ));
    }

    let message = next_server_message(&mut slow).await;
    let ServerMessage::Close { reason } = message else {
        panic!("expected close, got {message:?}");
    };
    assert_eq!(reason, "slow_consumer");

    // A new subscriber connects fine and gets a full snapshot.
    let mut fresh = connect(&url).await;
    fresh
        .send(Message::Text(
            json!({"type": "subscribe", "channels": ["orders"]})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    let ServerMessage::Snapshot { data, .. } = next_server_message(&mut fresh).await else {
        panic!("expected snapshot");
    };
    assert_eq!(data["orders"].as_object().unwrap().len(), 10);
}
