//! Versioned, auditable configuration store.
//!
//! Every write creates a new immutable version carrying actor, reason, and
//! timestamp; `is_active` is a movable pointer to one version per key.
//! Writes of typed entries are schema-validated atomically: an invalid
//! payload leaves no trace. Activation, rollback, and writes publish
//! [`ConfigChangeEvent`]s; consumers apply them by `(key, version)`
//! monotonicity, so out-of-order delivery is harmless.

pub mod schema;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::bus::ConfigChangeEvent;
use crate::domain::policy::RiskPolicy;
use crate::domain::symbol_rules::SymbolRules;

pub use schema::{ConfigType, RiskLimitConfig, SchemaError, StrategyConfig, TradingPairConfig};

/// One immutable version of a configuration entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigVersion {
    /// Monotonic version number, starting at 1.
    pub version: u64,
    /// Validated payload.
    pub value: serde_json::Value,
    /// Who wrote it.
    pub actor: String,
    /// Why it was written.
    pub reason: String,
    /// Write time.
    pub created_at: DateTime<Utc>,
}

/// Active view of one key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Configuration key.
    pub key: String,
    /// Configuration type.
    pub config_type: ConfigType,
    /// Active payload.
    pub value: serde_json::Value,
    /// Active version number.
    pub version: u64,
}

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unknown key.
    #[error("config key {0} not found")]
    NotFound(String),

    /// Key already exists on create.
    #[error("config key {0} already exists")]
    AlreadyExists(String),

    /// Optimistic lock failed.
    #[error("version conflict on {key}: expected {expected}, latest is {latest}")]
    VersionConflict {
        /// Key being updated.
        key: String,
        /// Version the caller based the write on.
        expected: u64,
        /// Latest version in the store.
        latest: u64,
    },

    /// Referenced version does not exist.
    #[error("config key {key} has no version {version}")]
    UnknownVersion {
        /// Key being activated.
        key: String,
        /// Missing version.
        version: u64,
    },

    /// Payload failed schema validation.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// An enabled risk policy with the same (scope, scope_id, metric,
    /// operator) tuple already exists.
    #[error("duplicate enabled risk policy for {0}")]
    DuplicatePolicy(String),
}

#[derive(Debug)]
struct KeyState {
    config_type: ConfigType,
    versions: Vec<ConfigVersion>,
    active_version: u64,
}

impl KeyState {
    fn latest_version(&self) -> u64 {
        self.versions.last().map_or(0, |v| v.version)
    }

    fn find(&self, version: u64) -> Option<&ConfigVersion> {
        self.versions.iter().find(|v| v.version == version)
    }

    fn active(&self) -> Option<&ConfigVersion> {
        self.find(self.active_version)
    }
}

/// In-memory authoritative configuration store.
#[derive(Debug)]
pub struct ConfigStore {
    entries: RwLock<HashMap<String, KeyState>>,
    changes_tx: broadcast::Sender<ConfigChangeEvent>,
}

impl ConfigStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            changes_tx: broadcast::channel(256).0,
        }
    }

    /// Create a key with its first version, which becomes active.
    pub fn create(
        &self,
        key: &str,
        config_type: ConfigType,
        value: serde_json::Value,
        actor: &str,
        reason: &str,
    ) -> Result<ConfigEntry, ConfigError> {
        let canonical = schema::validate(config_type, &value)?;
        self.check_policy_uniqueness(key, config_type, &canonical)?;

        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Err(ConfigError::AlreadyExists(key.to_string()));
        }

        let version = ConfigVersion {
            version: 1,
            value: canonical.clone(),
            actor: actor.to_string(),
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        entries.insert(
            key.to_string(),
            KeyState {
                config_type,
                versions: vec![version],
                active_version: 1,
            },
        );
        drop(entries);

        self.announce(key, config_type, 1, "create");
        Ok(ConfigEntry {
            key: key.to_string(),
            config_type,
            value: canonical,
            version: 1,
        })
    }

    /// Write a new version under an optimistic lock on the latest version.
    /// The new version becomes active.
    pub fn update(
        &self,
        key: &str,
        expected_version: u64,
        value: serde_json::Value,
        actor: &str,
        reason: &str,
    ) -> Result<ConfigEntry, ConfigError> {
        let (config_type, new_version) = {
            let entries = self.entries.read();
            let state = entries
                .get(key)
                .ok_or_else(|| ConfigError::NotFound(key.to_string()))?;
            let latest = state.latest_version();
            if latest != expected_version {
                return Err(ConfigError::VersionConflict {
                    key: key.to_string(),
                    expected: expected_version,
                    latest,
                });
            }
            (state.config_type, latest + 1)
        };

        let canonical = schema::validate(config_type, &value)?;
        self.check_policy_uniqueness(key, config_type, &canonical)?;

        let mut entries = self.entries.write();
        let state = entries
            .get_mut(key)
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))?;
        // Re-check under the write lock; a concurrent writer may have won.
        let latest = state.latest_version();
        if latest != expected_version {
            return Err(ConfigError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                latest,
            });
        }
        state.versions.push(ConfigVersion {
            version: new_version,
            value: canonical.clone(),
            actor: actor.to_string(),
            reason: reason.to_string(),
            created_at: Utc::now(),
        });
        state.active_version = new_version;
        drop(entries);

        self.announce(key, config_type, new_version, "update");
        Ok(ConfigEntry {
            key: key.to_string(),
            config_type,
            value: canonical,
            version: new_version,
        })
    }

    /// Move the active pointer to an existing version.
    pub fn activate(&self, key: &str, version: u64) -> Result<(), ConfigError> {
        self.repoint(key, version, "activate")
    }

    /// Roll the active pointer back to an earlier version.
    pub fn rollback(&self, key: &str, to_version: u64) -> Result<(), ConfigError> {
        self.repoint(key, to_version, "rollback")
    }

    fn repoint(&self, key: &str, version: u64, action: &str) -> Result<(), ConfigError> {
        let config_type = {
            let mut entries = self.entries.write();
            let state = entries
                .get_mut(key)
                .ok_or_else(|| ConfigError::NotFound(key.to_string()))?;
            if state.find(version).is_none() {
                return Err(ConfigError::UnknownVersion {
                    key: key.to_string(),
                    version,
                });
            }
            state.active_version = version;
            state.config_type
        };
        self.announce(key, config_type, version, action);
        Ok(())
    }

    /// Active entry for a key.
    pub fn get(&self, key: &str) -> Result<ConfigEntry, ConfigError> {
        let entries = self.entries.read();
        let state = entries
            .get(key)
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))?;
        let active = state
            .active()
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))?;
        Ok(ConfigEntry {
            key: key.to_string(),
            config_type: state.config_type,
            value: active.value.clone(),
            version: active.version,
        })
    }

    /// Active entries of one type.
    #[must_use]
    pub fn list(&self, config_type: ConfigType) -> Vec<ConfigEntry> {
        let entries = self.entries.read();
        let mut result: Vec<_> = entries
            .iter()
            .filter(|(_, state)| state.config_type == config_type)
            .filter_map(|(key, state)| {
                state.active().map(|active| ConfigEntry {
                    key: key.clone(),
                    config_type: state.config_type,
                    value: active.value.clone(),
                    version: active.version,
                })
            })
            .collect();
        result.sort_by(|a, b| a.key.cmp(&b.key));
        result
    }

    /// Full version history of a key, oldest first.
    pub fn history(&self, key: &str) -> Result<Vec<ConfigVersion>, ConfigError> {
        let entries = self.entries.read();
        entries
            .get(key)
            .map(|state| state.versions.clone())
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))
    }

    /// Subscribe to change events.
    #[must_use]
    pub fn watch(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.changes_tx.subscribe()
    }

    // ========================================================================
    // Typed views
    // ========================================================================

    /// Symbol rules from the active `trading_pair` entries, keyed by symbol.
    #[must_use]
    pub fn symbol_rules(&self) -> HashMap<String, SymbolRules> {
        self.list(ConfigType::TradingPair)
            .into_iter()
            .filter_map(|entry| {
                serde_json::from_value::<TradingPairConfig>(entry.value)
                    .ok()
                    .map(|pair| (pair.symbol.clone(), pair.into_rules()))
            })
            .collect()
    }

    /// Risk policies from the active `risk_limit` entries.
    #[must_use]
    pub fn risk_policies(&self) -> Vec<RiskPolicy> {
        self.list(ConfigType::RiskLimit)
            .into_iter()
            .filter_map(|entry| {
                let parsed: RiskLimitConfig = serde_json::from_value(entry.value).ok()?;
                Some(RiskPolicy {
                    id: entry.key,
                    name: parsed.name,
                    metric: parsed.metric,
                    operator: parsed.operator,
                    threshold: parsed.threshold,
                    scope: parsed.scope,
                    scope_id: parsed.scope_id,
                    action: parsed.action,
                    priority: parsed.priority,
                    enabled: parsed.enabled,
                    version: entry.version,
                })
            })
            .collect()
    }

    /// Enforce the at-most-one-enabled-policy invariant per
    /// (scope, scope_id, metric, operator) tuple.
    fn check_policy_uniqueness(
        &self,
        key: &str,
        config_type: ConfigType,
        value: &serde_json::Value,
    ) -> Result<(), ConfigError> {
        if config_type != ConfigType::RiskLimit {
            return Ok(());
        }
        let Ok(candidate) = serde_json::from_value::<RiskLimitConfig>(value.clone()) else {
            return Ok(()); // schema validation already rejected it
        };
        if !candidate.enabled {
            return Ok(());
        }

        for policy in self.risk_policies() {
            if policy.id != key
                && policy.enabled
                && policy.scope == candidate.scope
                && policy.scope_id == candidate.scope_id
                && policy.metric == candidate.metric
                && policy.operator == candidate.operator
            {
                return Err(ConfigError::DuplicatePolicy(format!(
                    "{:?}/{}/{}",
                    candidate.scope,
                    candidate.scope_id.as_deref().unwrap_or("-"),
                    candidate.metric
                )));
            }
        }
        Ok(())
    }

    fn announce(&self, key: &str, config_type: ConfigType, version: u64, action: &str) {
        let event = ConfigChangeEvent {
            key: key.to_string(),
            config_type: config_type.as_str().to_string(),
            version,
            action: action.to_string(),
        };
        tracing::info!(
            key = %event.key,
            config_type = %event.config_type,
            version = event.version,
            action = %event.action,
            "config change"
        );
        let _ = self.changes_tx.send(event);
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}
