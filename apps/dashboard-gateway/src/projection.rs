//! In-memory projection of live trading state.
//!
//! Each applied record mutates one entity and increments a monotonic
//! sequence. Subscribers receive a snapshot at their current sequence,
//! then per-entity updates; keyed channels hold the latest value per
//! entity, while fills and alerts are bounded rings of recent records.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::feed::FeedRecord;
use crate::protocol::Channel;

/// How many recent fills/alerts the projection retains.
const RING_CAPACITY: usize = 256;

/// One entity change, as broadcast to subscriber sessions.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    /// Projection sequence after applying this change.
    pub seq: u64,
    /// Channel the entity belongs to.
    pub channel: Channel,
    /// Entity key.
    pub key: String,
    /// Latest value.
    pub value: Value,
    /// Symbol for symbol-filterable channels.
    pub symbol: Option<String>,
}

#[derive(Debug, Default)]
struct ProjectionState {
    seq: u64,
    market: HashMap<String, Value>,
    positions: HashMap<String, Value>,
    balances: HashMap<String, Value>,
    orders: HashMap<String, Value>,
    fills: VecDeque<(String, Value)>,
    alerts: VecDeque<(String, Value)>,
}

impl ProjectionState {
    fn apply(&mut self, record: &FeedRecord) -> Option<StateUpdate> {
        let (channel, key, value, symbol) = classify(record)?;

        match channel {
            Channel::Market => {
                self.market.insert(key.clone(), value.clone());
            }
            Channel::Positions => {
                self.positions.insert(key.clone(), value.clone());
            }
            Channel::Balances => {
                self.balances.insert(key.clone(), value.clone());
            }
            Channel::Orders => {
                self.orders.insert(key.clone(), value.clone());
            }
            Channel::Fills => {
                push_ring(&mut self.fills, key.clone(), value.clone());
            }
            Channel::Alerts => {
                push_ring(&mut self.alerts, key.clone(), value.clone());
            }
        }

        self.seq += 1;
        Some(StateUpdate {
            seq: self.seq,
            channel,
            key,
            value,
            symbol,
        })
    }

    fn snapshot(&self, channels: &[Channel], symbols: Option<&[String]>) -> Value {
        let matches_symbol = |value: &Value| -> bool {
            let Some(filter) = symbols else { return true };
            value
                .get("symbol")
                .and_then(Value::as_str)
                .is_none_or(|s| filter.iter().any(|f| f == s))
        };

        let mut data = serde_json::Map::new();
        for channel in channels {
            let section: Value = match channel {
                Channel::Market => keyed_section(&self.market, &matches_symbol),
                Channel::Positions => keyed_section(&self.positions, &matches_symbol),
                Channel::Balances => keyed_section(&self.balances, &|_| true),
                Channel::Orders => keyed_section(&self.orders, &matches_symbol),
                Channel::Fills => ring_section(&self.fills, &matches_symbol),
                Channel::Alerts => ring_section(&self.alerts, &|_| true),
            };
            data.insert(channel.as_str().to_string(), section);
        }
        Value::Object(data)
    }
}

fn keyed_section(map: &HashMap<String, Value>, keep: &dyn Fn(&Value) -> bool) -> Value {
    Value::Object(
        map.iter()
            .filter(|(_, v)| keep(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

fn ring_section(ring: &VecDeque<(String, Value)>, keep: &dyn Fn(&Value) -> bool) -> Value {
    Value::Array(ring.iter().filter(|(_, v)| keep(v)).map(|(_, v)| v.clone()).collect())
}

fn push_ring(ring: &mut VecDeque<(String, Value)>, key: String, value: Value) {
    ring.push_back((key, value));
    while ring.len() > RING_CAPACITY {
        ring.pop_front();
    }
}

/// Map a feed record to its channel, entity key, and stored value.
fn classify(record: &FeedRecord) -> Option<(Channel, String, Value, Option<String>)> {
    let payload = &record.payload;
    let text = |v: &Value, field: &str| v.get(field)?.as_str().map(str::to_string);

    if record.subject.starts_with("market.ticks") {
        let symbol = text(payload, "symbol")?;
        return Some((
            Channel::Market,
            symbol.clone(),
            payload.clone(),
            Some(symbol),
        ));
    }
    match record.subject.as_str() {
        "trading.orders.updates" => {
            // Payload is {order, reason}; the projection keeps the order.
            let order = payload.get("order")?.clone();
            let key = text(&order, "order_id")?;
            let symbol = text(&order, "symbol");
            Some((Channel::Orders, key, order, symbol))
        }
        "trading.fills" => {
            let key = text(payload, "fill_id")?;
            let symbol = text(payload, "symbol");
            Some((Channel::Fills, key, payload.clone(), symbol))
        }
        "trading.account.positions" => {
            let symbol = text(payload, "symbol")?;
            Some((
                Channel::Positions,
                symbol.clone(),
                payload.clone(),
                Some(symbol),
            ))
        }
        "trading.account.balances" => {
            let key = text(payload, "asset")?;
            Some((Channel::Balances, key, payload.clone(), None))
        }
        "trading.alerts" => {
            let key = text(payload, "id")?;
            Some((Channel::Alerts, key, payload.clone(), None))
        }
        // Config changes are not a subscriber channel.
        _ => None,
    }
}

/// Shared projection with update fan-out.
pub struct Aggregator {
    state: RwLock<ProjectionState>,
    updates_tx: broadcast::Sender<StateUpdate>,
}

impl Aggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(ProjectionState::default()),
            updates_tx: broadcast::channel(8_192).0,
        })
    }

    /// Apply one record.
    pub fn ingest(&self, record: &FeedRecord) {
        let update = self.state.write().apply(record);
        if let Some(update) = update {
            metrics::counter!("projection_updates", "channel" => update.channel.as_str())
                .increment(1);
            let _ = self.updates_tx.send(update);
        }
    }

    /// Current sequence.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.state.read().seq
    }

    /// Snapshot of the requested channels.
    #[must_use]
    pub fn snapshot(&self, channels: &[Channel], symbols: Option<&[String]>) -> (u64, Value) {
        let state = self.state.read();
        (state.seq, state.snapshot(channels, symbols))
    }

    /// Subscribe to entity updates.
    #[must_use]
    pub fn updates(&self) -> broadcast::Receiver<StateUpdate> {
        self.updates_tx.subscribe()
    }

    /// Drain the feed into the projection until cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut feed: mpsc::Receiver<FeedRecord>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                record = feed.recv() => {
                    match record {
                        Some(record) => self.ingest(&record),
                        None => {
                            tracing::warn!("feed channel closed");
                            return;
                        }
                    }
                }
            }
        }
    }
}
