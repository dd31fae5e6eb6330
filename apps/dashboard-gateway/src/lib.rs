// Allow unwrap/expect in tests - tests should panic on unexpected errors
#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::too_many_lines)
)]

//! Dashboard Gateway - State Fan-Out Service
//!
//! Consumes the trading engine's event stream (self-describing JSON
//! records over WebSocket), maintains an in-memory projection with a
//! monotonic sequence, and serves many WebSocket subscribers with
//! snapshot/delta semantics:
//!
//! - snapshot on subscribe, deltas thereafter at the subscriber's rate
//!   limit
//! - consecutive deltas for one entity coalesce to the latest value
//! - a subscriber that cannot keep up is disconnected (`slow_consumer`)
//!   rather than ever blocking producers
//! - heartbeat ping/pong with timeout-based disconnect

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod feed;
pub mod projection;
pub mod protocol;
pub mod server;
pub mod session;
pub mod settings;
pub mod telemetry;

pub use feed::{FeedPort, FeedRecord, InMemoryFeed, WsFeed};
pub use projection::{Aggregator, StateUpdate};
pub use protocol::{Channel, ClientMessage, DeltaChange, ServerMessage};
pub use server::{GatewayState, create_router};
pub use session::SessionConfig;
pub use settings::GatewaySettings;
