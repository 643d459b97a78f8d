//! Name-to-constructor tables for providers and decision backends

use super::builtin::{ConsoleInput, LogOutput};
use super::input::InputProvider;
use super::output::OutputProvider;
use crate::decision::{BackendFactory, DecisionBackend, DecisionRouter, RuleBackend};
use crate::{MurmurError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds an input provider from its merged config
pub type InputFactory = Arc<dyn Fn(&Value) -> Result<Box<dyn InputProvider>> + Send + Sync>;

/// Builds an output provider from its merged config
pub type OutputFactory = Arc<dyn Fn(&Value) -> Result<Box<dyn OutputProvider>> + Send + Sync>;

/// Registration table populated at startup
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    inputs: BTreeMap<String, InputFactory>,
    outputs: BTreeMap<String, OutputFactory>,
    backends: BTreeMap<String, BackendFactory>,
    // Lowest config layer, keyed by registry name
    defaults: BTreeMap<String, Value>,
}

/// Optional `name` override in a provider config
fn configured_name(config: &Value, default: &str) -> String {
    config
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `console`, `log` and `rules`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_input(ConsoleInput::NAME, |config| {
            Ok(Box::new(ConsoleInput::new(configured_name(config, ConsoleInput::NAME))))
        });
        registry.register_output(LogOutput::NAME, |config| {
            Ok(Box::new(LogOutput::new(configured_name(config, LogOutput::NAME))))
        });
        registry.register_backend(RuleBackend::NAME, || Box::new(RuleBackend::default()));
        registry
    }

    pub fn register_input<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn InputProvider>> + Send + Sync + 'static,
    {
        self.inputs.insert(name.into(), Arc::new(factory));
    }

    pub fn register_output<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn OutputProvider>> + Send + Sync + 'static,
    {
        self.outputs.insert(name.into(), Arc::new(factory));
    }

    pub fn register_backend<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn DecisionBackend> + Send + Sync + 'static,
    {
        self.backends.insert(name.into(), Arc::new(factory));
    }

    /// Set the default config layer for a registered name
    pub fn set_defaults(&mut self, name: impl Into<String>, defaults: Value) {
        self.defaults.insert(name.into(), defaults);
    }

    pub fn defaults(&self, name: &str) -> Value {
        self.defaults.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn create_input(&self, name: &str, config: &Value) -> Result<Box<dyn InputProvider>> {
        let factory = self
            .inputs
            .get(name)
            .ok_or_else(|| MurmurError::ProviderNotFound(name.to_string()))?;
        factory(config)
    }

    pub fn create_output(&self, name: &str, config: &Value) -> Result<Box<dyn OutputProvider>> {
        let factory = self
            .outputs
            .get(name)
            .ok_or_else(|| MurmurError::ProviderNotFound(name.to_string()))?;
        factory(config)
    }

    /// Copy every backend factory into the router
    pub fn install_backends(&self, router: &DecisionRouter) {
        for (name, factory) in &self.backends {
            router.register_factory(name.clone(), Arc::clone(factory));
        }
    }

    pub fn input_names(&self) -> Vec<String> {
        self.inputs.keys().cloned().collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.keys().cloned().collect()
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::decision::RouterConfig;
    use serde_json::json;

    #[test]
    fn test_builtins_registered() {
        let registry = ProviderRegistry::with_builtins();
        assert_eq!(registry.input_names(), vec!["console"]);
        assert_eq!(registry.output_names(), vec!["log"]);
        assert_eq!(registry.backend_names(), vec!["rules"]);
    }

    #[test]
    fn test_create_with_name_override() {
        let registry = ProviderRegistry::with_builtins();
        let output = registry.create_output("log", &json!({"name": "captions"})).unwrap();
        assert_eq!(output.info().name, "captions");
    }

    #[test]
    fn test_unknown_provider() {
        let registry = ProviderRegistry::with_builtins();
        let err = registry.create_input("twitch", &Value::Null).err().unwrap();
        assert_eq!(err, MurmurError::ProviderNotFound("twitch".into()));
    }

    #[test]
    fn test_defaults_layer() {
        let mut registry = ProviderRegistry::with_builtins();
        assert_eq!(registry.defaults("rules"), Value::Null);
        registry.set_defaults("rules", json!({"fallback": "{text}"}));
        assert_eq!(registry.defaults("rules")["fallback"], json!("{text}"));
    }

    #[test]
    fn test_install_backends() {
        let registry = ProviderRegistry::with_builtins();
        let router = DecisionRouter::new(Arc::new(EventBus::default()), RouterConfig::default());
        registry.install_backends(&router);
        assert_eq!(router.backend_names(), vec!["rules"]);
    }
}
