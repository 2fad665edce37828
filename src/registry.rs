//! Model plugin registry.
//!
//! Maps model-type keys to [`ModelPlugin`] factories so the reconstruction
//! architecture can be swapped without touching the engine. The registry is
//! an explicit owned object (built at configuration time, shareable via
//! `Arc`), never ambient global state, which keeps plugin resolution
//! testable.

use crate::error::{Error, Result};
use crate::model::{DensePlugin, ModelPlugin};

pub struct ModelRegistry {
    plugins: Vec<Box<dyn ModelPlugin>>,
}

impl ModelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// Create a registry pre-loaded with the built-in plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(DensePlugin));
        registry
    }

    /// Register a plugin. Re-registering an existing key replaces the old
    /// entry.
    pub fn register(&mut self, plugin: Box<dyn ModelPlugin>) {
        if let Some(existing) = self
            .plugins
            .iter_mut()
            .find(|p| p.name() == plugin.name())
        {
            *existing = plugin;
        } else {
            self.plugins.push(plugin);
        }
    }

    /// Resolve a plugin by key, failing with [`Error::UnknownPlugin`] when
    /// absent. Called at configuration time, before any background work.
    pub fn resolve(&self, name: &str) -> Result<&dyn ModelPlugin> {
        self.plugins
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
            .ok_or_else(|| Error::UnknownPlugin(name.to_string()))
    }

    /// Registered plugin keys, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::ReconstructionModel;

    struct FakePlugin {
        key: &'static str,
        note: &'static str,
    }

    impl ModelPlugin for FakePlugin {
        fn name(&self) -> &str {
            self.key
        }
        fn description(&self) -> &str {
            self.note
        }
        fn create(&self, _config: &ModelConfig) -> Result<Box<dyn ReconstructionModel>> {
            Err(Error::TaskFailed("not constructible".into()))
        }
        fn restore(&self, _weights: &[u8]) -> Result<Box<dyn ReconstructionModel>> {
            Err(Error::TaskFailed("not constructible".into()))
        }
    }

    #[test]
    fn builtins_include_dense() {
        let registry = ModelRegistry::with_builtins();
        assert!(registry.resolve("dense").is_ok());
    }

    #[test]
    fn unknown_key_fails() {
        let registry = ModelRegistry::with_builtins();
        match registry.resolve("unknownae") {
            Err(Error::UnknownPlugin(key)) => assert_eq!(key, "unknownae"),
            other => panic!("expected UnknownPlugin, got {:?}", other.map(|p| p.name())),
        }
    }

    #[test]
    fn reregistration_replaces() {
        let mut registry = ModelRegistry::new();
        registry.register(Box::new(FakePlugin {
            key: "custom",
            note: "first",
        }));
        registry.register(Box::new(FakePlugin {
            key: "custom",
            note: "second",
        }));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve("custom").unwrap().description(), "second");
    }
}
