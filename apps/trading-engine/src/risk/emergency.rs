//! Emergency stop coordinator.
//!
//! A process-wide halt flag with announce/observe semantics. Engaging is
//! idempotent; releasing requires an explicit operator action. Observers
//! (the execution engine, the admin API, the bus bridge) subscribe for
//! transitions.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why and when the halt engaged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaltRecord {
    /// What triggered the halt (policy id or `manual`).
    pub trigger: String,
    /// Human-readable reason.
    pub reason: String,
    /// Who engaged it (policy sweep or operator name).
    pub actor: String,
    /// When it engaged.
    pub engaged_at: DateTime<Utc>,
    /// Account snapshot captured at engagement, for the incident record.
    pub account_snapshot: Option<serde_json::Value>,
}

/// Halt state transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HaltEvent {
    /// Trading halted.
    Engaged(HaltRecord),
    /// Trading resumed.
    Released {
        /// Operator who resumed.
        actor: String,
        /// When trading resumed.
        released_at: DateTime<Utc>,
    },
}

/// Process-wide emergency stop flag.
#[derive(Debug)]
pub struct EmergencyStop {
    halted: AtomicBool,
    record: RwLock<Option<HaltRecord>>,
    events_tx: broadcast::Sender<HaltEvent>,
}

impl EmergencyStop {
    /// Create in the released state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            halted: AtomicBool::new(false),
            record: RwLock::new(None),
            events_tx: broadcast::channel(16).0,
        }
    }

    /// Whether trading is halted.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Engage the halt. Idempotent: returns `false` if already engaged.
    pub fn engage(
        &self,
        trigger: &str,
        reason: &str,
        actor: &str,
        account_snapshot: Option<serde_json::Value>,
    ) -> bool {
        if self.halted.swap(true, Ordering::SeqCst) {
            return false;
        }
        let record = HaltRecord {
            trigger: trigger.to_string(),
            reason: reason.to_string(),
            actor: actor.to_string(),
            engaged_at: Utc::now(),
            account_snapshot,
        };
        *self.record.write() = Some(record.clone());
        tracing::error!(trigger, reason, actor, "EMERGENCY STOP engaged");
        let _ = self.events_tx.send(HaltEvent::Engaged(record));
        true
    }

    /// Release the halt. Returns `false` if it was not engaged.
    pub fn release(&self, actor: &str) -> bool {
        if !self.halted.swap(false, Ordering::SeqCst) {
            return false;
        }
        tracing::warn!(actor, "emergency stop released");
        let _ = self.events_tx.send(HaltEvent::Released {
            actor: actor.to_string(),
            released_at: Utc::now(),
        });
        true
    }

    /// The halt record, when engaged.
    #[must_use]
    pub fn record(&self) -> Option<HaltRecord> {
        self.record.read().clone()
    }

    /// Subscribe to halt transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HaltEvent> {
        self.events_tx.subscribe()
    }
}

impl Default for EmergencyStop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engage_is_idempotent() {
        let stop = EmergencyStop::new();
        assert!(!stop.is_halted());

        assert!(stop.engage("manual", "test", "ops", None));
        assert!(stop.is_halted());
        assert!(!stop.engage("manual", "again", "ops", None));

        // First record wins.
        assert_eq!(stop.record().unwrap().reason, "test");
    }

    #[test]
    fn release_requires_engaged() {
        let stop = EmergencyStop::new();
        assert!(!stop.release("ops"));

        stop.engage("manual", "test", "ops", None);
        assert!(stop.release("ops"));
        assert!(!stop.is_halted());
    }

    #[tokio::test]
    async fn observers_see_transitions() {
        let stop = EmergencyStop::new();
        let mut rx = stop.subscribe();

        stop.engage("policy:risk.dd", "drawdown 10.5% > 10%", "sweep", None);
        stop.release("ops");

        assert!(matches!(rx.recv().await.unwrap(), HaltEvent::Engaged(_)));
        assert!(matches!(rx.recv().await.unwrap(), HaltEvent::Released { .. }));
    }
}
