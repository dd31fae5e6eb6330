//! Alert emission with per-kind suppression windows.
//!
//! Repeated occurrences of the same alert kind within the window are
//! counted but not re-published, which keeps a flapping condition from
//! storming the alert bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bus::EventBus;
use crate::domain::alert::{Alert, AlertKind};

/// Default suppression window applied to kinds without an override.
const DEFAULT_SUPPRESSION: Duration = Duration::from_secs(60);

/// Alert emitter with suppression.
pub struct AlertEmitter {
    bus: Arc<EventBus>,
    windows: HashMap<AlertKind, Duration>,
    last_emitted: Mutex<HashMap<AlertKind, Instant>>,
    suppressed_counts: Mutex<HashMap<AlertKind, u64>>,
}

impl AlertEmitter {
    /// Create an emitter with the default window for every kind.
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            windows: HashMap::new(),
            last_emitted: Mutex::new(HashMap::new()),
            suppressed_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Override the suppression window for one kind.
    #[must_use]
    pub fn with_window(mut self, kind: AlertKind, window: Duration) -> Self {
        self.windows.insert(kind, window);
        self
    }

    /// Emit an alert unless its kind is inside the suppression window.
    ///
    /// Returns `true` when the alert was published.
    pub fn emit(&self, alert: Alert) -> bool {
        let window = self
            .windows
            .get(&alert.kind)
            .copied()
            .unwrap_or(DEFAULT_SUPPRESSION);

        let now = Instant::now();
        {
            let mut last = self.last_emitted.lock();
            if let Some(previous) = last.get(&alert.kind) {
                if now.duration_since(*previous) < window {
                    *self
                        .suppressed_counts
                        .lock()
                        .entry(alert.kind)
                        .or_insert(0) += 1;
                    metrics::counter!("alerts_suppressed", "kind" => alert.kind.code())
                        .increment(1);
                    return false;
                }
            }
            last.insert(alert.kind, now);
        }

        tracing::warn!(
            kind = alert.kind.code(),
            severity = ?alert.severity,
            subject = alert.subject.as_deref().unwrap_or("-"),
            "{}",
            alert.message
        );
        metrics::counter!("alerts_emitted", "kind" => alert.kind.code()).increment(1);
        self.bus.publish_alert(alert);
        true
    }

    /// Alerts swallowed by suppression, per kind.
    #[must_use]
    pub fn suppressed_count(&self, kind: AlertKind) -> u64 {
        self.suppressed_counts.lock().get(&kind).copied().unwrap_or(0)
    }
}
