//! Logging, tracing, and metrics.

pub mod metrics;
pub mod telemetry;

pub use metrics::install_metrics;
pub use telemetry::{TelemetryGuard, init_telemetry};
