//! Admin and operational HTTP surface.
//!
//! # Endpoints
//!
//! - `GET  /health` - aggregate health with per-check detail
//! - `GET  /healthz` - liveness (unconditional OK)
//! - `GET  /readyz` - readiness (user stream connected, no fatal error)
//! - `POST /api/v1/orders` - submit a signal (admin auth)
//! - `POST /api/v1/orders/{id}/cancel` - cancel (admin auth)
//! - `GET  /api/v1/orders/{id}` - order snapshot
//! - `GET  /api/v1/account` - account snapshot
//! - `GET  /api/v1/violations` - recorded risk violations
//! - `POST /api/v1/emergency-stop` - engage the halt (admin auth)
//! - `POST /api/v1/resume` - release the halt (admin auth)
//! - `POST /api/v1/reconcile` - run one account reconciliation (admin auth)
//! - `GET/POST/PUT /api/v1/config...` - configuration CRUD (writes need auth)
//! - `GET  /stream` - WebSocket bridge carrying the engine's bus subjects

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::account::{AccountMonitor, AccountReconciler};
use crate::bus::{EventBus, wire};
use crate::configstore::{ConfigError, ConfigStore, ConfigType};
use crate::domain::signal::OrderSignal;
use crate::error::{EngineError, ErrorKind};
use crate::marketdata::MarketDataBus;
use crate::oee::OrderExecutionEngine;
use crate::risk::{EmergencyStop, RiskManager};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Order execution engine.
    pub engine: Arc<OrderExecutionEngine>,
    /// Account monitor.
    pub monitor: Arc<AccountMonitor>,
    /// Risk manager.
    pub risk: Arc<RiskManager>,
    /// Configuration store.
    pub configstore: Arc<ConfigStore>,
    /// Emergency stop flag.
    pub stop: Arc<EmergencyStop>,
    /// Event bus (for the stream bridge).
    pub bus: Arc<EventBus>,
    /// Market data bus (for the stream bridge).
    pub marketdata: Arc<MarketDataBus>,
    /// Account reconciler, for the manual trigger.
    pub reconciler: Arc<AccountReconciler>,
    /// Static admin bearer token; empty disables admin mutations.
    pub admin_token: String,
    /// Crate version for health output.
    pub version: String,
}

/// Build the router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(readiness))
        .route("/api/v1/orders", post(submit_order))
        .route("/api/v1/orders/{id}", get(get_order))
        .route("/api/v1/orders/{id}/cancel", post(cancel_order))
        .route("/api/v1/account", get(account_snapshot))
        .route("/api/v1/violations", get(violations))
        .route("/api/v1/emergency-stop", post(emergency_stop))
        .route("/api/v1/resume", post(resume))
        .route("/api/v1/reconcile", post(reconcile_now))
        .route("/api/v1/config", get(list_config).post(create_config))
        .route("/api/v1/config/{key}", get(get_config))
        .route("/api/v1/config/{key}", put(update_config))
        .route("/api/v1/config/{key}/activate", post(activate_config))
        .route("/api/v1/config/{key}/rollback", post(rollback_config))
        .route("/api/v1/config/{key}/history", get(config_history))
        .route("/stream", get(stream_bridge))
        .with_state(state)
}

fn error_response(error: &EngineError) -> Response {
    let status = StatusCode::from_u16(error.kind().http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error.to_response())).into_response()
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    if state.admin_token.is_empty() {
        return Err(error_response(&EngineError::new(
            ErrorKind::Fatal,
            "admin mutations disabled: no admin token configured",
        )));
    }
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(state.admin_token.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"code": "UNAUTHORIZED", "message": "invalid admin token"})),
        )
            .into_response())
    }
}

// ============================================================================
// Health
// ============================================================================

async fn health(State(state): State<AppState>) -> Response {
    let stream_ok = state.engine.stream_connected();
    let fatal = state.engine.is_fatal();
    let halted = state.stop.is_halted();

    let status = if fatal {
        "unhealthy"
    } else if !stream_ok || halted {
        "degraded"
    } else {
        "healthy"
    };
    let code = if fatal {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(json!({
            "status": status,
            "version": state.version,
            "checks": {
                "user_stream_connected": stream_ok,
                "fatal_error": fatal,
                "emergency_stop": halted,
                "open_orders": state.engine.store().active_orders().len(),
            }
        })),
    )
        .into_response()
}

async fn readiness(State(state): State<AppState>) -> Response {
    if state.engine.stream_connected() && !state.engine.is_fatal() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

// ============================================================================
// Orders
// ============================================================================

async fn submit_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(signal): Json<OrderSignal>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let outcome = state.engine.submit(signal).await;
    let code = if outcome.accepted {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (code, Json(outcome)).into_response()
}

async fn cancel_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.engine.cancel(&id).await {
        Ok(outcome) => (StatusCode::OK, Json(json!({"result": outcome}))).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_order(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    state.engine.query(&id).map_or_else(
        || error_response(&EngineError::not_found("order", &id)),
        |order| (StatusCode::OK, Json(order)).into_response(),
    )
}

async fn account_snapshot(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.monitor.snapshot())).into_response()
}

async fn violations(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.risk.violations())).into_response()
}

// ============================================================================
// Emergency stop
// ============================================================================

#[derive(Debug, Deserialize)]
struct HaltRequest {
    reason: String,
}

/// Key of the halt-state entry mirrored into the configuration store so
/// sibling processes observe the stop across restarts.
const HALT_CONFIG_KEY: &str = "system.emergency_stop";

fn persist_halt_state(state: &AppState, halted: bool, reason: &str) {
    let value = json!({
        "halted": halted,
        "reason": reason,
        "changed_at": chrono::Utc::now().to_rfc3339(),
    });
    let result = match state.configstore.get(HALT_CONFIG_KEY) {
        Ok(entry) => state
            .configstore
            .update(HALT_CONFIG_KEY, entry.version, value, "admin", reason)
            .map(|_| ()),
        Err(_) => state
            .configstore
            .create(HALT_CONFIG_KEY, ConfigType::System, value, "admin", reason)
            .map(|_| ()),
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "halt state not persisted to config store");
    }
}

async fn emergency_stop(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<HaltRequest>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let snapshot = serde_json::to_value(state.monitor.snapshot()).ok();
    let engaged = state
        .stop
        .engage("manual", &request.reason, "admin", snapshot);
    persist_halt_state(&state, true, &request.reason);
    (
        StatusCode::OK,
        Json(json!({"engaged": engaged, "halted": true})),
    )
        .into_response()
}

async fn resume(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let released = state.stop.release("admin");
    persist_halt_state(&state, false, "operator resume");
    (
        StatusCode::OK,
        Json(json!({"released": released, "halted": false})),
    )
        .into_response()
}

async fn reconcile_now(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.reconciler.reconcile_once().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => error_response(&EngineError::new(ErrorKind::Transient, e.to_string())),
    }
}

// ============================================================================
// Configuration
// ============================================================================

fn config_error_response(error: &ConfigError) -> Response {
    let kind = match error {
        ConfigError::NotFound(_) | ConfigError::UnknownVersion { .. } => ErrorKind::NotFound,
        ConfigError::AlreadyExists(_)
        | ConfigError::VersionConflict { .. }
        | ConfigError::DuplicatePolicy(_) => ErrorKind::Conflict,
        ConfigError::Schema(_) => ErrorKind::Validation,
    };
    error_response(&EngineError::new(kind, error.to_string()))
}

#[derive(Debug, Deserialize)]
struct ListConfigQuery {
    #[serde(rename = "type")]
    config_type: ConfigType,
}

async fn list_config(
    State(state): State<AppState>,
    Query(query): Query<ListConfigQuery>,
) -> Response {
    (
        StatusCode::OK,
        Json(state.configstore.list(query.config_type)),
    )
        .into_response()
}

async fn get_config(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.configstore.get(&key) {
        Ok(entry) => (StatusCode::OK, Json(entry)).into_response(),
        Err(e) => config_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateConfigRequest {
    key: String,
    #[serde(rename = "type")]
    config_type: ConfigType,
    value: serde_json::Value,
    actor: String,
    #[serde(default)]
    reason: String,
}

async fn create_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateConfigRequest>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.configstore.create(
        &request.key,
        request.config_type,
        request.value,
        &request.actor,
        &request.reason,
    ) {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(e) => config_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateConfigRequest {
    expected_version: u64,
    value: serde_json::Value,
    actor: String,
    #[serde(default)]
    reason: String,
}

async fn update_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(request): Json<UpdateConfigRequest>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.configstore.update(
        &key,
        request.expected_version,
        request.value,
        &request.actor,
        &request.reason,
    ) {
        Ok(entry) => (StatusCode::OK, Json(entry)).into_response(),
        Err(e) => config_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct VersionRequest {
    version: u64,
}

async fn activate_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(request): Json<VersionRequest>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.configstore.activate(&key, request.version) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => config_error_response(&e),
    }
}

async fn rollback_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(request): Json<VersionRequest>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.configstore.rollback(&key, request.version) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => config_error_response(&e),
    }
}

async fn config_history(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.configstore.history(&key) {
        Ok(history) => (StatusCode::OK, Json(history)).into_response(),
        Err(e) => config_error_response(&e),
    }
}

// ============================================================================
// Event-stream bridge
// ============================================================================

async fn stream_bridge(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| run_bridge(socket, state))
}

/// Forward every produced bus subject as self-describing JSON records, one
/// frame per record. The dashboard gateway treats this endpoint as the
/// message bus.
async fn run_bridge(mut socket: WebSocket, state: AppState) {
    let mut orders = state.bus.orders_rx();
    let mut fills = state.bus.fills_rx();
    let mut positions = state.bus.positions_rx();
    let mut balances = state.bus.balances_rx();
    let mut alerts = state.bus.alerts_rx();
    let mut config = state.bus.config_rx();
    let mut ticks = state.marketdata.subscribe();

    tracing::info!("event-stream bridge subscriber connected");

    loop {
        let record = tokio::select! {
            event = orders.recv() => event.ok().map(|e| wire::order_update(&e)),
            fill = fills.recv() => fill.ok().map(|f| wire::fill(&f)),
            position = positions.recv() => position.ok().map(|p| wire::position(&p)),
            balance = balances.recv() => balance.ok().map(|b| wire::balance(&b)),
            alert = alerts.recv() => alert.ok().map(|a| wire::alert(&a)),
            change = config.recv() => change.ok().map(|c| wire::config_change(&c)),
            tick = ticks.recv() => tick.ok().map(|t| wire::market_tick(&t)),
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Close(_))) | None => break,
                    // Axum answers pings at the protocol layer.
                    _ => continue,
                }
            }
        };

        // A lagged broadcast receiver yields None here; skip and resume.
        let Some(record) = record else { continue };
        let Ok(text) = serde_json::to_string(&record) else {
            continue;
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    tracing::info!("event-stream bridge subscriber disconnected");
}

/// Serve the router until cancelled.
pub async fn serve(
    router: Router,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::account::{AccountThresholds, ReconcilerConfig};
    use crate::exchange::{ExchangePort, MockExchange};
    use crate::oee::EngineSettings;
    use crate::resilience::{BreakerConfig, BreakerRegistry, RateLimitConfig, RateLimiterRegistry};

    fn make_state() -> AppState {
        let bus = Arc::new(EventBus::with_defaults());
        let marketdata = Arc::new(MarketDataBus::default());
        let monitor = Arc::new(AccountMonitor::new(
            Arc::clone(&bus),
            Arc::clone(&marketdata),
            AccountThresholds::default(),
        ));
        let exchange = MockExchange::new();
        let stop = Arc::new(EmergencyStop::new());
        let risk = Arc::new(RiskManager::new(vec![]));
        let engine = Arc::new(OrderExecutionEngine::new(
            EngineSettings::default(),
            Arc::clone(&exchange) as Arc<dyn ExchangePort>,
            Arc::clone(&risk),
            Arc::clone(&stop),
            Arc::new(RateLimiterRegistry::new(RateLimitConfig::default())),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            Arc::clone(&bus),
            Arc::clone(&monitor),
            HashMap::new(),
        ));
        let reconciler = Arc::new(AccountReconciler::new(
            ReconcilerConfig::default(),
            Arc::clone(&monitor),
            exchange as Arc<dyn ExchangePort>,
        ));
        AppState {
            engine,
            monitor,
            risk,
            configstore: Arc::new(ConfigStore::new()),
            stop,
            bus,
            marketdata,
            reconciler,
            admin_token: "secret".to_string(),
            version: "test".to_string(),
        }
    }

    async fn spawn_server(state: AppState) -> String {
        let router = create_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn liveness_is_unconditional() {
        let base = spawn_server(make_state()).await;
        let response = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn readiness_requires_stream() {
        let base = spawn_server(make_state()).await;
        // No user stream running in this fixture.
        let response = reqwest::get(format!("{base}/readyz")).await.unwrap();
        assert_eq!(response.status(), 503);
    }

    #[tokio::test]
    async fn health_reports_degraded_when_halted() {
        let state = make_state();
        state.stop.engage("manual", "test", "ops", None);
        let base = spawn_server(state).await;

        let body: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["checks"]["emergency_stop"], true);
    }

    #[tokio::test]
    async fn admin_endpoints_require_token() {
        let base = spawn_server(make_state()).await;
        let client = reqwest::Client::new();

        let denied = client
            .post(format!("{base}/api/v1/emergency-stop"))
            .json(&json!({"reason": "test"}))
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status(), 401);

        let allowed = client
            .post(format!("{base}/api/v1/emergency-stop"))
            .bearer_auth("secret")
            .json(&json!({"reason": "test"}))
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status(), 200);
    }

    #[tokio::test]
    async fn resume_releases_halt() {
        let state = make_state();
        let stop = Arc::clone(&state.stop);
        let base = spawn_server(state).await;
        let client = reqwest::Client::new();

        stop.engage("manual", "test", "ops", None);
        let response = client
            .post(format!("{base}/api/v1/resume"))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(!stop.is_halted());
    }

    #[tokio::test]
    async fn halt_state_is_mirrored_into_config_store() {
        let state = make_state();
        let configstore = Arc::clone(&state.configstore);
        let base = spawn_server(state).await;
        let client = reqwest::Client::new();

        client
            .post(format!("{base}/api/v1/emergency-stop"))
            .bearer_auth("secret")
            .json(&json!({"reason": "drill"}))
            .send()
            .await
            .unwrap();
        let entry = configstore.get(HALT_CONFIG_KEY).unwrap();
        assert_eq!(entry.value["halted"], true);

        client
            .post(format!("{base}/api/v1/resume"))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        let entry = configstore.get(HALT_CONFIG_KEY).unwrap();
        assert_eq!(entry.value["halted"], false);
        assert_eq!(entry.version, 2);
    }

    #[tokio::test]
    async fn config_roundtrip_over_http() {
        let base = spawn_server(make_state()).await;
        let client = reqwest::Client::new();

        let created = client
            .post(format!("{base}/api/v1/config"))
            .bearer_auth("secret")
            .json(&json!({
                "key": "sys.poll",
                "type": "system",
                "value": {"interval_secs": 5},
                "actor": "ops"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), 201);

        let fetched: serde_json::Value = client
            .get(format!("{base}/api/v1/config/sys.poll"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(fetched["version"], 1);
        assert_eq!(fetched["value"]["interval_secs"], 5);
    }

    #[tokio::test]
    async fn unknown_order_is_404() {
        let base = spawn_server(make_state()).await;
        let response = reqwest::get(format!("{base}/api/v1/orders/missing"))
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }
}
