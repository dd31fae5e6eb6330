//! One WebSocket subscriber session.
//!
//! The session owns a bounded coalescing buffer between the projection's
//! update stream and the socket. While the buffer is non-empty,
//! consecutive updates to the same entity collapse to the latest value
//! (last-writer-wins per entity per flush). Overflow disconnects this
//! subscriber with `slow_consumer` and never blocks other sessions or the
//! producers.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::broadcast;
use tokio::time::{Instant, interval_at};

use crate::projection::{Aggregator, StateUpdate};
use crate::protocol::{Channel, ClientMessage, DeltaChange, ServerMessage};

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Delta flush interval when the client does not request one.
    pub default_rate_limit: Duration,
    /// Floor for client-requested rate limits.
    pub min_rate_limit: Duration,
    /// Coalescing buffer capacity; overflow drops the subscriber.
    pub max_pending: usize,
    /// Ping interval.
    pub heartbeat_interval: Duration,
    /// Close the session when no pong/traffic arrives within this window.
    pub heartbeat_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_rate_limit: Duration::from_millis(250),
            min_rate_limit: Duration::from_millis(50),
            max_pending: 4_096,
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
        }
    }
}

/// Bounded last-writer-wins buffer of entity changes.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    entries: HashMap<(Channel, String), DeltaChange>,
    max_seq: u64,
}

impl PendingBuffer {
    /// Insert an update, replacing any pending value for the same entity.
    /// Returns `false` when the buffer would exceed `capacity`.
    pub fn push(&mut self, update: StateUpdate, capacity: usize) -> bool {
        let key = (update.channel, update.key.clone());
        if !self.entries.contains_key(&key) && self.entries.len() >= capacity {
            return false;
        }
        self.max_seq = self.max_seq.max(update.seq);
        self.entries.insert(
            key,
            DeltaChange {
                channel: update.channel,
                key: update.key,
                value: update.value,
            },
        );
        true
    }

    /// Whether anything is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain into a delta frame, leaving the buffer empty.
    pub fn drain(&mut self) -> Option<ServerMessage> {
        if self.entries.is_empty() {
            return None;
        }
        let changes: Vec<DeltaChange> = self.entries.drain().map(|(_, v)| v).collect();
        Some(ServerMessage::Delta {
            seq: self.max_seq,
            changes,
        })
    }
}

#[derive(Debug, Default)]
struct Subscription {
    channels: HashSet<Channel>,
    symbols: Option<Vec<String>>,
}

impl Subscription {
    fn wants(&self, update: &StateUpdate) -> bool {
        if !self.channels.contains(&update.channel) {
            return false;
        }
        match (&self.symbols, &update.symbol) {
            (Some(filter), Some(symbol)) => filter.iter().any(|s| s == symbol),
            _ => true,
        }
    }
}

/// Drive one subscriber socket to completion.
pub async fn run_session(mut socket: WebSocket, aggregator: &Aggregator, config: SessionConfig) {
    let session_id = uuid::Uuid::new_v4();
    tracing::info!(%session_id, "subscriber connected");
    metrics::counter!("subscribers_connected").increment(1);

    let mut updates = aggregator.updates();
    let mut subscription = Subscription::default();
    let mut pending = PendingBuffer::default();
    let mut rate_limit = config.default_rate_limit;
    let mut last_sent_seq = 0u64;
    let mut last_activity = Instant::now();

    let mut flush = interval_at(Instant::now() + rate_limit, rate_limit);
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);

    let close_reason = loop {
        tokio::select! {
            message = socket.recv() => {
                let Some(Ok(message)) = message else { break None };
                last_activity = Instant::now();
                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Subscribe { channels, symbols, rate_limit_ms }) => {
                                subscription.channels = channels.iter().copied().collect();
                                subscription.symbols = symbols;
                                if let Some(ms) = rate_limit_ms {
                                    rate_limit =
                                        Duration::from_millis(ms).max(config.min_rate_limit);
                                    flush = interval_at(Instant::now() + rate_limit, rate_limit);
                                }

                                let ordered: Vec<Channel> = Channel::all()
                                    .iter()
                                    .copied()
                                    .filter(|c| subscription.channels.contains(c))
                                    .collect();
                                let (seq, data) = aggregator
                                    .snapshot(&ordered, subscription.symbols.as_deref());
                                last_sent_seq = seq;
                                if send(&mut socket, &ServerMessage::Snapshot { seq, data })
                                    .await
                                    .is_err()
                                {
                                    break None;
                                }
                            }
                            Ok(ClientMessage::Unsubscribe { channels }) => {
                                for channel in channels {
                                    subscription.channels.remove(&channel);
                                }
                            }
                            Ok(ClientMessage::Ping) => {
                                if send(&mut socket, &ServerMessage::Pong).await.is_err() {
                                    break None;
                                }
                            }
                            Err(e) => {
                                let error = ServerMessage::Error {
                                    code: "BAD_FRAME".to_string(),
                                    message: e.to_string(),
                                };
                                if send(&mut socket, &error).await.is_err() {
                                    break None;
                                }
                            }
                        }
                    }
                    Message::Close(_) => break None,
                    // Protocol-level ping/pong handled by axum; both count
                    // as liveness above.
                    _ => {}
                }
            }
            update = updates.recv() => {
                match update {
                    Ok(update) => {
                        if !subscription.wants(&update) {
                            continue;
                        }
                        if !pending.push(update, config.max_pending) {
                            break Some("slow_consumer");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%session_id, skipped, "subscriber lagged the update bus");
                        break Some("slow_consumer");
                    }
                    Err(broadcast::error::RecvError::Closed) => break None,
                }
            }
            _ = flush.tick() => {
                if let Some(delta) = pending.drain() {
                    if let ServerMessage::Delta { seq, .. } = &delta {
                        // Monotonic per subscription by construction.
                        debug_assert!(*seq >= last_sent_seq);
                        last_sent_seq = *seq;
                    }
                    if send(&mut socket, &delta).await.is_err() {
                        break None;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > config.heartbeat_timeout {
                    break Some("heartbeat_timeout");
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break None;
                }
            }
        }
    };

    if let Some(reason) = close_reason {
        tracing::warn!(%session_id, reason, "disconnecting subscriber");
        metrics::counter!("subscribers_dropped", "reason" => reason).increment(1);
        let _ = send(
            &mut socket,
            &ServerMessage::Close {
                reason: reason.to_string(),
            },
        )
        .await;
    }
    tracing::info!(%session_id, "subscriber disconnected");
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    // Serialization of protocol frames cannot fail.
    #[allow(clippy::expect_used)]
    let text = serde_json::to_string(message).expect("protocol frame serializes");
    socket.send(Message::Text(text.into())).await
}
