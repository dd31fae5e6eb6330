//! WebSocket subscriber protocol.
//!
//! All frames are text JSON. `seq` is monotonic per subscription; a
//! reconnect restarts with a fresh snapshot.

use serde::{Deserialize, Serialize};

/// Subscribable channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Market ticks.
    Market,
    /// Position changes.
    Positions,
    /// Balance changes.
    Balances,
    /// Order transitions.
    Orders,
    /// Executions.
    Fills,
    /// Operational alerts.
    Alerts,
}

impl Channel {
    /// All channels.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Market,
            Self::Positions,
            Self::Balances,
            Self::Orders,
            Self::Fills,
            Self::Alerts,
        ]
    }

    /// Stable wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Positions => "positions",
            Self::Balances => "balances",
            Self::Orders => "orders",
            Self::Fills => "fills",
            Self::Alerts => "alerts",
        }
    }
}

/// Client → server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to channels, optionally filtered by symbols.
    Subscribe {
        /// Channels to receive.
        channels: Vec<Channel>,
        /// Symbol filter for market/positions/orders/fills.
        #[serde(default)]
        symbols: Option<Vec<String>>,
        /// Minimum milliseconds between delta flushes.
        #[serde(default)]
        rate_limit_ms: Option<u64>,
    },
    /// Drop channels from the subscription.
    Unsubscribe {
        /// Channels to drop.
        channels: Vec<Channel>,
    },
    /// Application-level keepalive.
    Ping,
}

/// One coalesced entity change inside a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaChange {
    /// Channel the entity belongs to.
    pub channel: Channel,
    /// Entity key (symbol, asset, order id, fill id, alert id).
    pub key: String,
    /// Latest value for the entity.
    pub value: serde_json::Value,
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full state of the subscribed channels.
    Snapshot {
        /// Projection sequence at snapshot time.
        seq: u64,
        /// Per-channel state.
        data: serde_json::Value,
    },
    /// Incremental changes since the previous frame.
    Delta {
        /// Projection sequence of the newest included change.
        seq: u64,
        /// Coalesced changes, last-writer-wins per entity.
        changes: Vec<DeltaChange>,
    },
    /// Keepalive response.
    Pong,
    /// Protocol or subscription error.
    Error {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// Server-initiated close.
    Close {
        /// Close reason (`slow_consumer`, `heartbeat_timeout`).
        reason: String,
    },
}
