//! Prometheus metrics.
//!
//! Metric names are recorded throughout the crate via the `metrics` facade;
//! this module installs the exporter and registers descriptions.

use std::net::SocketAddr;

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter with an HTTP listener on the given port
/// and describe every metric the engine records.
pub fn install_metrics(port: u16) -> Result<(), BuildError> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    describe_counter!("submissions", "Order submissions by outcome");
    describe_counter!("submissions_rejected", "Rejected submissions by reason code");
    describe_counter!("submissions_rate_limited", "Submissions refused by the rate limiter");
    describe_counter!("submissions_breaker_open", "Submissions refused by an open breaker");
    describe_counter!("submissions_indeterminate", "Submissions left to reconciliation");
    describe_counter!("fills_applied", "Fills folded into positions");
    describe_counter!("orders_drained", "Open orders canceled by a drain");
    describe_counter!("risk_policy_fired", "Risk policy firings by action");
    describe_counter!("alerts_emitted", "Alerts published by kind");
    describe_counter!("alerts_suppressed", "Alerts swallowed by suppression windows");
    describe_counter!("reconciliation_runs", "Account reconciliation runs");
    describe_counter!("reconciliation_failures", "Account reconciliation failures");
    describe_counter!("reconcile_resolved", "Indeterminate submissions resolved by outcome");
    describe_counter!("user_stream_connects", "User-data stream connections");
    describe_counter!("user_stream_disconnects", "User-data stream disconnections");
    describe_histogram!("submit_latency_us", "Submission pipeline latency in microseconds");
    describe_histogram!("reconciliation_duration_ms", "Account reconciliation duration");

    tracing::info!(port, "Prometheus metrics listener installed");
    Ok(())
}
