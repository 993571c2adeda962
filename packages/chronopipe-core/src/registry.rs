//! Explicit source-component registry.
//!
//! Components that drive a pipeline on their own schedule are looked up by
//! name and constructed from a [`ChronopipeConfig`] snapshot at wiring time,
//! replacing runtime type introspection with a registry handed to the
//! runtime at construction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::ChronopipeConfig;
use crate::element::Source;
use crate::error::{ChronopipeError, ChronopipeResult};

/// Builds a boxed [`Source`] from a configuration snapshot.
pub type SourceFactory = Arc<dyn Fn(&ChronopipeConfig) -> ChronopipeResult<Box<dyn Source>> + Send + Sync>;

/// Maps component names to the factories that construct them.
///
/// A runtime is handed one registry at construction; wiring code looks up
/// components by the name recorded in a pipeline description instead of
/// discovering them via attributes or reflection.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    factories: Arc<Mutex<HashMap<String, SourceFactory>>>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing any existing entry. The
    /// factory is invoked lazily at `create` time, once per requested
    /// instance.
    pub fn register(&self, name: impl Into<String>, factory: SourceFactory) {
        self.factories.lock().unwrap().insert(name.into(), factory);
    }

    /// Constructs a new source instance by name, using `config` as the
    /// construction-time snapshot.
    pub fn create(&self, name: &str, config: &ChronopipeConfig) -> ChronopipeResult<Box<dyn Source>> {
        let factory = self
            .factories
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ChronopipeError::StoreNotFound(format!("no source registered under '{name}'")))?;
        factory(config)
    }

    /// Names of every registered factory, for diagnostics and `--list`-style
    /// CLI surfaces.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Instant;

    struct StubSource;
    impl Source for StubSource {
        fn start(&mut self, notify_completion_time: Box<dyn Fn(Instant) + Send>) {
            notify_completion_time(Instant::MAX);
        }
        fn stop(&mut self, _final_time: Instant, notify_completed: Box<dyn FnOnce() + Send>) {
            notify_completed();
        }
    }

    #[test]
    fn register_then_create_round_trips() {
        let registry = SourceRegistry::new();
        registry.register("stub", Arc::new(|_config| Ok(Box::new(StubSource) as Box<dyn Source>)));
        assert_eq!(registry.names(), vec!["stub".to_string()]);
        let source = registry.create("stub", &ChronopipeConfig::default());
        assert!(source.is_ok());
    }

    #[test]
    fn create_unknown_name_fails() {
        let registry = SourceRegistry::new();
        let result = registry.create("missing", &ChronopipeConfig::default());
        assert!(matches!(result, Err(ChronopipeError::StoreNotFound(_))));
    }
}
