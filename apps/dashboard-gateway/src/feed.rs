//! Upstream feed: self-describing records from the trading engine.
//!
//! The gateway is decoupled from the engine by the wire format: every
//! record carries its subject and schema version, and the payload is
//! opaque JSON that the projection indexes by entity key. The production
//! feed is a WebSocket client with reconnect; tests use [`InMemoryFeed`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// A record from the engine's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRecord {
    /// Bus subject (`trading.orders.updates`, `market.ticks.<symbol>`, ...).
    pub subject: String,
    /// Payload schema version.
    pub schema_version: u32,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
    /// Subject-specific payload.
    pub payload: serde_json::Value,
}

/// Source of feed records.
#[async_trait]
pub trait FeedPort: Send + Sync {
    /// Open the feed. Records arrive in source order per connection.
    async fn subscribe(&self) -> mpsc::Receiver<FeedRecord>;
}

/// Test feed backed by a channel.
#[derive(Debug)]
pub struct InMemoryFeed {
    senders: parking_lot::Mutex<Vec<mpsc::Sender<FeedRecord>>>,
}

impl InMemoryFeed {
    /// Create an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            senders: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Push a record to all subscribers.
    pub async fn push(&self, record: FeedRecord) {
        let senders: Vec<_> = self.senders.lock().clone();
        for sender in senders {
            let _ = sender.send(record.clone()).await;
        }
    }
}

impl Default for InMemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedPort for InMemoryFeed {
    async fn subscribe(&self) -> mpsc::Receiver<FeedRecord> {
        let (tx, rx) = mpsc::channel(1024);
        self.senders.lock().push(tx);
        rx
    }
}

/// Reconnecting WebSocket feed from the engine's `/stream` endpoint.
pub struct WsFeed {
    url: String,
    connected: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl WsFeed {
    /// Create a feed for the given stream URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connected: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Shared connectivity flag for readiness checks.
    #[must_use]
    pub fn connected_flag(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        std::sync::Arc::clone(&self.connected)
    }

    /// Run the feed, forwarding records until cancelled. Reconnects with
    /// exponential backoff and jitter on every disconnect.
    pub async fn run(self, tx: mpsc::Sender<FeedRecord>, cancel: CancellationToken) {
        let mut delay = Duration::from_secs(1);
        const MAX_DELAY: Duration = Duration::from_secs(64);

        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.run_connection(&tx, &cancel).await {
                ConnectionEnd::Shutdown => return,
                ConnectionEnd::Dropped { reason, connected } => {
                    if connected {
                        // A healthy connection resets the backoff.
                        delay = Duration::from_secs(1);
                    }
                    let jittered = jitter(delay);
                    tracing::warn!(
                        reason = %reason,
                        delay_ms = jittered.as_millis() as u64,
                        "upstream feed disconnected, reconnecting"
                    );
                    metrics::counter!("upstream_reconnects").increment(1);
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(jittered) => {}
                    }
                    delay = (delay * 2).min(MAX_DELAY);
                }
            }
        }
    }

    async fn run_connection(
        &self,
        tx: &mpsc::Sender<FeedRecord>,
        cancel: &CancellationToken,
    ) -> ConnectionEnd {
        let (ws, _) = match connect_async(&self.url).await {
            Ok(ok) => ok,
            Err(e) => {
                return ConnectionEnd::Dropped {
                    reason: e.to_string(),
                    connected: false,
                };
            }
        };
        tracing::info!(url = %self.url, "upstream feed connected");
        self.connected.store(true, std::sync::atomic::Ordering::SeqCst);
        let result = self.drive_socket(ws, tx, cancel).await;
        self.connected
            .store(false, std::sync::atomic::Ordering::SeqCst);
        result
    }

    async fn drive_socket(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        tx: &mpsc::Sender<FeedRecord>,
        cancel: &CancellationToken,
    ) -> ConnectionEnd {
        let (_, mut stream) = ws.split();

        loop {
            tokio::select! {
                () = cancel.cancelled() => return ConnectionEnd::Shutdown,
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<FeedRecord>(&text) {
                                Ok(record) => {
                                    if tx.send(record).await.is_err() {
                                        return ConnectionEnd::Shutdown;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "unparseable feed record");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return ConnectionEnd::Dropped {
                                reason: "closed".to_string(),
                                connected: true,
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return ConnectionEnd::Dropped {
                                reason: e.to_string(),
                                connected: true,
                            };
                        }
                    }
                }
            }
        }
    }
}

enum ConnectionEnd {
    Shutdown,
    Dropped { reason: String, connected: bool },
}

fn jitter(delay: Duration) -> Duration {
    let base = delay.as_millis() as f64;
    let range = base * 0.1;
    let mut rng = rand::rng();
    let offset: f64 = rng.random_range(-range..=range);
    Duration::from_millis(((base + offset).max(1.0)) as u64)
}
