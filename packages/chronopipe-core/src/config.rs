//! Layered runtime configuration.
//!
//! Supports loading from a YAML file with environment-variable overrides,
//! mirroring the precedence order used by the demonstration CLI: file <
//! environment variable < explicit CLI flag (applied by the caller after
//! [`ChronopipeConfig::load`] returns).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use serde::Deserialize;

use crate::error::ChronopipeResult;

/// Runtime-wide configuration for constructing a [`crate::pipeline::Pipeline`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChronopipeConfig {
    /// Number of OS-thread workers in the scheduler's pool.
    /// Override: `CHRONOPIPE_WORKER_THREADS`
    pub worker_threads: usize,

    /// Default bounded-queue capacity suggested to components that don't
    /// specify one explicitly.
    /// Override: `CHRONOPIPE_DEFAULT_QUEUE_CAPACITY`
    pub default_queue_capacity: usize,

    /// Diagnostics sampler configuration; absent disables diagnostics.
    pub diagnostics: Option<DiagnosticsConfig>,
}

impl Default for ChronopipeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            default_queue_capacity: 64,
            diagnostics: None,
        }
    }
}

impl ChronopipeConfig {
    /// Loads configuration from a YAML file (if given), then applies
    /// environment-variable overrides.
    pub fn load(path: Option<&Path>) -> ChronopipeResult<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CHRONOPIPE_WORKER_THREADS") {
            if let Ok(n) = val.parse() {
                self.worker_threads = n;
            }
        }
        if let Ok(val) = std::env::var("CHRONOPIPE_DEFAULT_QUEUE_CAPACITY") {
            if let Ok(n) = val.parse() {
                self.default_queue_capacity = n;
            }
        }
    }
}

/// Diagnostics sampler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Sampling interval, in milliseconds.
    pub sample_interval_ms: u64,
    /// How long (in milliseconds) rolling per-receiver histories are kept
    /// before being trimmed on each sampling tick.
    pub averaging_window_ms: u64,
    /// Whether to record message payload sizes (adds overhead).
    pub track_message_sizes: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1000,
            averaging_window_ms: 10_000,
            track_message_sizes: false,
        }
    }
}

/// The per-pipeline key/value store referenced by the data model as
/// `Pipeline.config_store`: arbitrary typed values components can stash and
/// retrieve by name, scoped to one pipeline instance.
#[derive(Debug, Default)]
pub struct ConfigStore {
    values: Mutex<HashMap<String, serde_yaml::Value>>,
}

impl ConfigStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, serializing it to YAML's value model.
    pub fn set<T: serde::Serialize>(&self, key: impl Into<String>, value: &T) -> ChronopipeResult<()> {
        let serialized = serde_yaml::to_value(value)?;
        self.values.lock().unwrap().insert(key.into(), serialized);
        Ok(())
    }

    /// Retrieves and deserializes the value stored under `key`, if present.
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> ChronopipeResult<Option<T>> {
        match self.values.lock().unwrap().get(key) {
            Some(v) => Ok(Some(serde_yaml::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    /// True if `key` has a stored value.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().unwrap().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_store_round_trips_typed_values() {
        let store = ConfigStore::new();
        store.set("capacity", &42u32).unwrap();
        assert_eq!(store.get::<u32>("capacity").unwrap(), Some(42));
        assert_eq!(store.get::<u32>("missing").unwrap(), None);
    }

    #[test]
    fn default_config_has_sane_worker_count() {
        let config = ChronopipeConfig::default();
        assert!(config.worker_threads >= 1);
        assert!(config.diagnostics.is_none());
    }
}
