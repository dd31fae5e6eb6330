//! User-data stream supervisor.
//!
//! Owns the lifetime of the venue WebSocket: connects with the listen key,
//! refreshes the key on a timer, answers venue pings, and reconnects with
//! exponential backoff on disconnect. Each (re)connect emits
//! [`UserStreamEvent::Connected`] so consumers know a reconciliation
//! boundary passed; within one connection, events are forwarded in source
//! order.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::UserStreamEvent;

/// Settings for the user-data stream task.
#[derive(Debug, Clone)]
pub struct UserStreamConfig {
    /// WebSocket base URL (listen key appended as the path).
    pub ws_url: String,
    /// REST base URL for listen-key refresh.
    pub rest_url: String,
    /// API key for the refresh call.
    pub api_key: String,
    /// Listen-key refresh interval.
    pub listen_key_refresh: Duration,
}

/// Exponential backoff with jitter for reconnect attempts.
#[derive(Debug)]
pub struct ReconnectPolicy {
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            current_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(64),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ReconnectPolicy {
    /// Next delay, growing exponentially up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_delay;
        let scaled = base.as_millis() as f64 * self.multiplier;
        self.current_delay = Duration::from_millis(
            (scaled as u64).min(self.max_delay.as_millis() as u64),
        );
        self.apply_jitter(base)
    }

    /// Reset after a successful connection.
    pub const fn reset(&mut self) {
        self.current_delay = Duration::from_secs(1);
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return duration;
        }
        let base = duration.as_millis() as f64;
        let range = base * self.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-range..=range);
        Duration::from_millis(((base + jitter).max(1.0)) as u64)
    }
}

/// Long-running task keeping the user-data stream alive.
pub struct UserStreamTask {
    config: UserStreamConfig,
    listen_key: String,
    events: mpsc::Sender<UserStreamEvent>,
    policy: ReconnectPolicy,
    http: reqwest::Client,
}

impl UserStreamTask {
    /// Create the task. Call [`Self::run`] on a dedicated tokio task.
    #[must_use]
    pub fn new(
        config: UserStreamConfig,
        listen_key: String,
        events: mpsc::Sender<UserStreamEvent>,
    ) -> Self {
        Self {
            config,
            listen_key,
            events,
            policy: ReconnectPolicy::default(),
            http: reqwest::Client::new(),
        }
    }

    /// Run until the event receiver is dropped.
    pub async fn run(mut self) {
        loop {
            match self.run_connection().await {
                Ok(()) => {
                    // Receiver dropped; we are shutting down.
                    tracing::info!("user stream consumer gone, stopping");
                    return;
                }
                Err(e) => {
                    if self.events.send(UserStreamEvent::Disconnected).await.is_err() {
                        return;
                    }
                    let delay = self.policy.next_delay();
                    tracing::warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "user stream disconnected, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Drive one connection to completion. `Ok` means the consumer went
    /// away; `Err` means the socket dropped and we should reconnect.
    async fn run_connection(&mut self) -> Result<(), StreamError> {
        let url = format!("{}/ws/{}", self.config.ws_url, self.listen_key);
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        self.policy.reset();
        if self.events.send(UserStreamEvent::Connected).await.is_err() {
            return Ok(());
        }
        tracing::info!("user stream connected");

        let mut refresh = tokio::time::interval(self.config.listen_key_refresh);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<UserStreamEvent>(&text) {
                                Ok(event) => {
                                    if self.events.send(event).await.is_err() {
                                        return Ok(());
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "unparseable user stream frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            sink.send(Message::Pong(payload))
                                .await
                                .map_err(|e| StreamError::Socket(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(StreamError::Socket("closed by venue".to_string()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(StreamError::Socket(e.to_string())),
                    }
                }
                _ = refresh.tick() => {
                    if let Err(e) = self.refresh_listen_key().await {
                        // A failed refresh eventually invalidates the key;
                        // drop the socket and start over with a fresh one.
                        tracing::warn!(error = %e, "listen key refresh failed");
                        return Err(StreamError::Refresh(e));
                    }
                }
            }
        }
    }

    async fn refresh_listen_key(&self) -> Result<(), String> {
        let url = format!(
            "{}/api/v3/userDataStream?listenKey={}",
            self.config.rest_url, self.listen_key
        );
        let response = self
            .http
            .put(&url)
            .header("X-API-KEY", &self.config.api_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("http {}", response.status()))
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum StreamError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("listen key refresh failed: {0}")]
    Refresh(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut policy = ReconnectPolicy {
            jitter_factor: 0.0,
            ..Default::default()
        };

        assert_eq!(policy.next_delay(), Duration::from_secs(1));
        assert_eq!(policy.next_delay(), Duration::from_secs(2));
        assert_eq!(policy.next_delay(), Duration::from_secs(4));

        for _ in 0..10 {
            let _ = policy.next_delay();
        }
        assert_eq!(policy.next_delay(), Duration::from_secs(64));
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut policy = ReconnectPolicy {
            jitter_factor: 0.0,
            ..Default::default()
        };
        let _ = policy.next_delay();
        let _ = policy.next_delay();

        policy.reset();
        assert_eq!(policy.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_in_band() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::default();
            let delay = policy.next_delay().as_millis();
            assert!((900..=1100).contains(&delay), "delay {delay}ms outside band");
        }
    }
}
