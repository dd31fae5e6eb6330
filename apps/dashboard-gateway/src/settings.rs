//! Gateway configuration, loaded from environment variables.

use std::time::Duration;

use crate::session::SessionConfig;

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// HTTP port serving `/ws` and the health endpoints.
    pub http_port: u16,
    /// Prometheus metrics port (0 disables the exporter).
    pub metrics_port: u16,
    /// Upstream engine event-stream URL.
    pub upstream_url: String,
    /// Per-subscriber session tuning.
    pub session: SessionConfig,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            http_port: 8081,
            metrics_port: 9091,
            upstream_url: "ws://127.0.0.1:8080/stream".to_string(),
            session: SessionConfig::default(),
        }
    }
}

impl GatewaySettings {
    /// Load settings from the environment, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            http_port: env_parse("GATEWAY_HTTP_PORT", defaults.http_port),
            metrics_port: env_parse("GATEWAY_METRICS_PORT", defaults.metrics_port),
            upstream_url: std::env::var("GATEWAY_UPSTREAM_URL")
                .unwrap_or(defaults.upstream_url),
            session: SessionConfig {
                default_rate_limit: Duration::from_millis(env_parse(
                    "GATEWAY_DEFAULT_RATE_LIMIT_MS",
                    250,
                )),
                min_rate_limit: Duration::from_millis(env_parse(
                    "GATEWAY_MIN_RATE_LIMIT_MS",
                    50,
                )),
                max_pending: env_parse("GATEWAY_MAX_PENDING", 4_096),
                heartbeat_interval: Duration::from_secs(env_parse(
                    "GATEWAY_HEARTBEAT_INTERVAL_SECS",
                    15,
                )),
                heartbeat_timeout: Duration::from_secs(env_parse(
                    "GATEWAY_HEARTBEAT_TIMEOUT_SECS",
                    45,
                )),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
