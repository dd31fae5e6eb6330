//! Engine configuration.
//!
//! Layered loading: defaults, then an optional bootstrap file, then
//! `TRADING__`-prefixed environment variables (`TRADING__SERVER__HTTP_PORT`
//! overrides `server.http_port`). The file is bootstrap only; the
//! configuration store is authoritative for trading-pair and risk entries
//! at runtime.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::account::{AccountThresholds, ReconcilerConfig};
use crate::exchange::RestExchangeConfig;
use crate::oee::{EngineSettings, ReconcileConfig};
use crate::resilience::{BreakerConfig, RateLimitConfig, RetryPolicy};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// HTTP and metrics ports, admin auth.
    pub server: ServerConfig,
    /// Venue connection.
    pub exchange: ExchangeConfig,
    /// Rate limiter and circuit breaker.
    pub limits: LimitsConfig,
    /// Submission pipeline settings.
    pub engine: EngineSection,
    /// Account and order reconciliation.
    pub reconciliation: ReconciliationConfig,
    /// Account alert thresholds.
    pub account: AccountConfig,
    /// Stream-loss safety.
    pub safety: SafetyConfig,
    /// Durable storage.
    pub persistence: PersistenceConfig,
}

/// Server ports and admin auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Admin/health HTTP port.
    pub http_port: u16,
    /// Prometheus metrics port (0 disables the exporter).
    pub metrics_port: u16,
    /// Static bearer token for admin endpoints. Empty disables admin
    /// mutations entirely.
    pub admin_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            metrics_port: 9090,
            admin_token: String::new(),
        }
    }
}

/// Which venue implementation to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    /// In-memory venue (paper trading, tests).
    #[default]
    Mock,
    /// Signed REST + user-stream WebSocket.
    Rest,
}

/// Venue connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Adapter implementation.
    pub kind: ExchangeKind,
    /// REST base URL.
    pub base_url: String,
    /// User-stream WebSocket base URL.
    pub ws_url: String,
    /// API key (environment override recommended).
    pub api_key: String,
    /// API secret (environment override recommended).
    pub api_secret: String,
    /// Per-request deadline in milliseconds.
    pub request_timeout_ms: u64,
    /// Listen-key refresh interval in seconds.
    pub listen_key_refresh_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            kind: ExchangeKind::Mock,
            base_url: "https://api.exchange.test".to_string(),
            ws_url: "wss://stream.exchange.test".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            request_timeout_ms: 5_000,
            listen_key_refresh_secs: 1_800,
        }
    }
}

impl ExchangeConfig {
    /// Build the REST adapter config.
    #[must_use]
    pub fn rest_config(&self) -> RestExchangeConfig {
        RestExchangeConfig {
            base_url: self.base_url.clone(),
            ws_url: self.ws_url.clone(),
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            listen_key_refresh: Duration::from_secs(self.listen_key_refresh_secs),
        }
    }
}

/// Rate limiter and breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Token bucket refill rate.
    pub tokens_per_second: f64,
    /// Token bucket capacity.
    pub burst: u32,
    /// Sliding one-second cap (0 disables).
    pub per_second_cap: u32,
    /// Sliding one-minute cap (0 disables).
    pub per_minute_cap: u32,
    /// Consecutive failures that open a breaker.
    pub breaker_failure_threshold: u32,
    /// Failure window in seconds.
    pub breaker_failure_window_secs: u64,
    /// Breaker cooldown in seconds.
    pub breaker_cooldown_secs: u64,
    /// Probe calls admitted in half-open.
    pub breaker_half_open_probes: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: 10.0,
            burst: 10,
            per_second_cap: 0,
            per_minute_cap: 1_200,
            breaker_failure_threshold: 5,
            breaker_failure_window_secs: 60,
            breaker_cooldown_secs: 30,
            breaker_half_open_probes: 1,
        }
    }
}

impl LimitsConfig {
    /// Build the rate limiter config.
    #[must_use]
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            tokens_per_second: self.tokens_per_second,
            burst: self.burst,
            per_second_cap: self.per_second_cap,
            per_minute_cap: self.per_minute_cap,
        }
    }

    /// Build the breaker config.
    #[must_use]
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            failure_window: Duration::from_secs(self.breaker_failure_window_secs),
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
            half_open_probes: self.breaker_half_open_probes,
        }
    }
}

/// Submission pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Account shard name.
    pub account: String,
    /// Per-attempt submission deadline in milliseconds.
    pub submit_deadline_ms: u64,
    /// Bounded limiter wait in milliseconds (0 = fail fast).
    pub limiter_wait_ms: u64,
    /// Retry attempts for venue mutations.
    pub retry_max_attempts: u32,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            account: "main".to_string(),
            submit_deadline_ms: 5_000,
            limiter_wait_ms: 0,
            retry_max_attempts: 2,
        }
    }
}

impl EngineSection {
    /// Build the engine settings.
    #[must_use]
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            account: self.account.clone(),
            submit_deadline: Duration::from_millis(self.submit_deadline_ms),
            limiter_wait: (self.limiter_wait_ms > 0)
                .then(|| Duration::from_millis(self.limiter_wait_ms)),
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                ..RetryPolicy::mutations()
            },
        }
    }
}

/// Reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Account reconciliation interval in seconds.
    pub account_interval_secs: u64,
    /// Absolute balance drift tolerance.
    pub balance_tolerance: Decimal,
    /// Absolute position drift tolerance.
    pub position_tolerance: Decimal,
    /// Order resolution sweep interval in seconds.
    pub order_interval_secs: u64,
    /// Ambiguity window in seconds.
    pub ambiguity_window_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            account_interval_secs: 30,
            balance_tolerance: Decimal::new(1, 6),
            position_tolerance: Decimal::new(1, 6),
            order_interval_secs: 5,
            ambiguity_window_secs: 60,
        }
    }
}

impl ReconciliationConfig {
    /// Build the account reconciler config.
    #[must_use]
    pub fn account_reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(self.account_interval_secs),
            balance_tolerance: self.balance_tolerance,
            position_tolerance: self.position_tolerance,
        }
    }

    /// Build the order reconciler config.
    #[must_use]
    pub fn order_reconciler(&self) -> ReconcileConfig {
        ReconcileConfig {
            interval: Duration::from_secs(self.order_interval_secs),
            ambiguity_window: Duration::from_secs(self.ambiguity_window_secs),
        }
    }
}

/// Account alert thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Asset equity is denominated in.
    pub quote_asset: String,
    /// Low-balance alert floor.
    pub low_balance_floor: Decimal,
    /// Drawdown alert limit in percent.
    pub drawdown_limit_pct: Decimal,
    /// Margin ratio alert limit.
    pub margin_ratio_limit: Decimal,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            quote_asset: "USDT".to_string(),
            low_balance_floor: Decimal::ZERO,
            drawdown_limit_pct: Decimal::from(100),
            margin_ratio_limit: Decimal::ONE,
        }
    }
}

impl AccountConfig {
    /// Build the account thresholds.
    #[must_use]
    pub fn thresholds(&self) -> AccountThresholds {
        AccountThresholds {
            quote_asset: self.quote_asset.clone(),
            low_balance_floor: self.low_balance_floor,
            drawdown_limit_pct: self.drawdown_limit_pct,
            margin_ratio_limit: self.margin_ratio_limit,
        }
    }
}

/// Stream-loss mass-cancel safety.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Whether to mass-cancel open orders after a stream loss.
    pub mass_cancel_on_stream_loss: bool,
    /// Grace period before the mass cancel fires, in seconds.
    pub grace_period_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            mass_cancel_on_stream_loss: true,
            grace_period_secs: 30,
        }
    }
}

/// Durable storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Database file path (`:memory:` for ephemeral runs).
    pub db_path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: "trading-engine.db".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults, optional file, environment overrides.
    pub fn load(file: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix("TRADING")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
