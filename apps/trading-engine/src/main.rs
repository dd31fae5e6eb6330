//! Trading Engine Binary
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin trading-engine
//! ```
//!
//! # Environment Variables
//!
//! - `TRADING_CONFIG`: optional bootstrap config file (without extension)
//! - `TRADING__*`: per-field overrides (e.g. `TRADING__SERVER__HTTP_PORT`)
//! - `OTEL_ENABLED` / `OTEL_EXPORTER_OTLP_ENDPOINT`: tracing export
//! - `RUST_LOG`: log filter (default: info)

use tokio::signal;
use tokio_util::sync::CancellationToken;
use trading_engine::EngineConfig;
use trading_engine::TradingApp;
use trading_engine::observability::{init_telemetry, install_metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let _telemetry = init_telemetry();

    let config_file = std::env::var("TRADING_CONFIG").ok();
    let config = EngineConfig::load(config_file.as_deref())?;

    if config.server.metrics_port > 0
        && let Err(e) = install_metrics(config.server.metrics_port)
    {
        tracing::warn!(error = %e, "metrics exporter not installed");
    }

    tracing::info!(
        http_port = config.server.http_port,
        exchange = ?config.exchange.kind,
        account = %config.engine.account,
        "starting trading engine"
    );

    let app = TradingApp::build(config).await?;
    let cancel = CancellationToken::new();

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cancel.cancel();
    });

    app.run(cancel).await?;
    tracing::info!("trading engine stopped");
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
        () = ctrl_c => {
            tracing::info!("received ctrl-c, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }
}
