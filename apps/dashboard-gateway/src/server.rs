//! HTTP surface: the subscriber WebSocket endpoint and health checks.
//!
//! # Endpoints
//!
//! - `GET /ws` - WebSocket subscriber protocol
//! - `GET /health` - JSON health status
//! - `GET /healthz` - liveness (unconditional OK)
//! - `GET /readyz` - readiness (upstream feed connected)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::projection::Aggregator;
use crate::session::{SessionConfig, run_session};

/// Shared server state.
#[derive(Clone)]
pub struct GatewayState {
    /// The projection and update bus.
    pub aggregator: Arc<Aggregator>,
    /// Per-session tuning.
    pub session_config: SessionConfig,
    /// Upstream feed connectivity, for readiness.
    pub upstream_connected: Arc<AtomicBool>,
    /// Live subscriber count, for health output.
    pub active_sessions: Arc<AtomicUsize>,
    /// Crate version.
    pub version: String,
}

/// Build the router.
pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(subscribe))
        .route("/health", get(health))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(readiness))
        .with_state(state)
}

async fn subscribe(State(state): State<GatewayState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        state.active_sessions.fetch_add(1, Ordering::SeqCst);
        run_session(socket, &state.aggregator, state.session_config.clone()).await;
        state.active_sessions.fetch_sub(1, Ordering::SeqCst);
    })
}

async fn health(State(state): State<GatewayState>) -> Response {
    let upstream = state.upstream_connected.load(Ordering::SeqCst);
    let status = if upstream { "healthy" } else { "degraded" };
    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "version": state.version,
            "checks": {
                "upstream_connected": upstream,
                "active_sessions": state.active_sessions.load(Ordering::SeqCst),
                "projection_seq": state.aggregator.seq(),
            }
        })),
    )
        .into_response()
}

async fn readiness(State(state): State<GatewayState>) -> Response {
    if state.upstream_connected.load(Ordering::SeqCst) {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Serve the router until cancelled.
pub async fn serve(
    router: Router,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}
