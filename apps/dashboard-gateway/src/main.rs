//! Dashboard Gateway Binary
//!
//! # Usage
//!
//! ```bash
//! cargo run -p dashboard-gateway
//! ```
//!
//! # Environment Variables
//!
//! - `GATEWAY_HTTP_PORT`: WebSocket/health port (default: 8081)
//! - `GATEWAY_METRICS_PORT`: Prometheus port, 0 disables (default: 9091)
//! - `GATEWAY_UPSTREAM_URL`: engine event-stream URL
//! - `GATEWAY_*`: session tuning, see `settings`
//! - `RUST_LOG`: log filter (default: info)

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use dashboard_gateway::telemetry::init_telemetry;
use dashboard_gateway::{Aggregator, GatewaySettings, GatewayState, WsFeed, create_router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let _telemetry = init_telemetry();

    let settings = GatewaySettings::from_env();
    if settings.metrics_port > 0 {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
        if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
            tracing::warn!(error = %e, "metrics exporter not installed");
        }
    }

    tracing::info!(
        http_port = settings.http_port,
        upstream = %settings.upstream_url,
        "starting dashboard gateway"
    );

    let cancel = CancellationToken::new();
    let aggregator = Aggregator::new();

    // Upstream feed → projection.
    let feed = WsFeed::new(settings.upstream_url.clone());
    let upstream_connected = feed.connected_flag();
    let (records_tx, records_rx) = mpsc::channel(8_192);
    tokio::spawn(feed.run(records_tx, cancel.child_token()));
    tokio::spawn(Arc::clone(&aggregator).run(records_rx, cancel.child_token()));

    let state = GatewayState {
        aggregator,
        session_config: settings.session.clone(),
        upstream_connected,
        active_sessions: Arc::new(AtomicUsize::new(0)),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let router = create_router(state);

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cancel.cancel();
    });

    dashboard_gateway::server::serve(router, settings.http_port, cancel).await?;
    tracing::info!("dashboard gateway stopped");
    Ok(())
}

/// Wait for SIGTERM or ctrl-c.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received ctrl-c, initiating shutdown"),
        () = terminate => tracing::info!("received SIGTERM, initiating shutdown"),
    }
}
