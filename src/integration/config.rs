//! Configuration for the orchestration core
//!
//! Loaded from TOML. Every section has defaults, so an empty file is a valid
//! configuration. Provider and backend settings are merged in three layers:
//! registered defaults, the `[providers.global]` table, then the entry's own
//! `config` table.

use super::expression::ExpressionConfig;
use crate::cache::CacheConfig;
use crate::decision::RouterConfig;
use crate::events::BusConfig;
use crate::pipeline::PipelineConfig;
use crate::providers::LifecycleConfig;
use crate::{MurmurError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// A provider or backend selected by registry name
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Registry key
    pub name: String,
    /// Adapter-local overrides, highest priority
    #[serde(default)]
    pub config: Value,
}

impl ProviderEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Value::Null,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Which adapters to run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub inputs: Vec<ProviderEntry>,
    pub outputs: Vec<ProviderEntry>,
    pub backend: Option<ProviderEntry>,
    /// Overrides applied to every adapter before its local config
    pub global: Value,
}

/// Configuration for the complete core
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MurmurConfig {
    pub bus: BusConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub lifecycle: LifecycleConfig,
    pub router: RouterConfig,
    pub expressions: ExpressionConfig,
    pub providers: ProvidersConfig,

    /// Capacity of the orchestrator notification channel
    pub notification_buffer: usize,
}

impl Default for MurmurConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            cache: CacheConfig::default(),
            pipeline: PipelineConfig::default(),
            lifecycle: LifecycleConfig::default(),
            router: RouterConfig::default(),
            expressions: ExpressionConfig::default(),
            providers: ProvidersConfig::default(),
            notification_buffer: 256,
        }
    }
}

impl MurmurConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MurmurError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Select the decision backend
    pub fn with_backend(mut self, entry: ProviderEntry) -> Self {
        self.providers.backend = Some(entry);
        self
    }

    pub fn with_input(mut self, entry: ProviderEntry) -> Self {
        self.providers.inputs.push(entry);
        self
    }

    pub fn with_output(mut self, entry: ProviderEntry) -> Self {
        self.providers.outputs.push(entry);
        self
    }

    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.cache.validate().map_err(MurmurError::Config)?;
        self.pipeline.validate().map_err(MurmurError::Config)?;
        self.lifecycle.validate().map_err(MurmurError::Config)?;
        self.router.validate().map_err(MurmurError::Config)?;
        self.expressions.validate().map_err(MurmurError::Config)?;

        if self.notification_buffer == 0 {
            return Err(MurmurError::Config(
                "notification_buffer must be greater than zero".to_string(),
            ));
        }
        let names = self
            .providers
            .inputs
            .iter()
            .chain(&self.providers.outputs)
            .chain(self.providers.backend.as_ref());
        for entry in names {
            if entry.name.trim().is_empty() {
                return Err(MurmurError::Config("provider entry without a name".to_string()));
            }
        }
        if !matches!(self.providers.global, Value::Null | Value::Object(_)) {
            return Err(MurmurError::Config(
                "providers.global must be a table".to_string(),
            ));
        }
        Ok(())
    }
}

/// Merge adapter config layers; later layers win
///
/// Objects merge key by key, recursively. Any other value, including arrays,
/// replaces the earlier one. `null` layers are skipped.
pub fn merge_layers(defaults: &Value, global: &Value, local: &Value) -> Value {
    let mut merged = Value::Null;
    for layer in [defaults, global, local] {
        merge_into(&mut merged, layer);
    }
    merged
}

fn merge_into(base: &mut Value, layer: &Value) {
    match (base, layer) {
        (_, Value::Null) => {}
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                merge_into(base.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base, layer) => *base = layer.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = MurmurConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.router.drain_timeout_ms, 5000);
        assert_eq!(config.cache.default_ttl_ms, 300_000);
    }

    #[test]
    fn test_empty_document_is_valid() {
        let config = MurmurConfig::from_toml_str("").unwrap();
        assert_eq!(config, MurmurConfig::default());
    }

    #[test]
    fn test_parse_sections() {
        let config = MurmurConfig::from_toml_str(
            r#"
            notification_buffer = 16

            [router]
            drain_timeout_ms = 250

            [pipeline.content_filter]
            blocked_words = ["spam"]

            [providers.backend]
            name = "rules"
            config = { fallback = "{text}" }

            [[providers.inputs]]
            name = "console"

            [providers.global]
            locale = "en"
            "#,
        )
        .unwrap();

        assert_eq!(config.notification_buffer, 16);
        assert_eq!(config.router.drain_timeout_ms, 250);
        assert!(config.pipeline.content_filter.is_some());
        assert_eq!(config.providers.inputs[0].name, "console");
        let backend = config.providers.backend.unwrap();
        assert_eq!(backend.config["fallback"], json!("{text}"));
        assert_eq!(config.providers.global["locale"], json!("en"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = MurmurConfig::from_toml_str("[router]\ndrain_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, MurmurError::Config(_)));

        let err = MurmurConfig::from_toml_str("[cache]\nmax_entries = \"many\"").unwrap_err();
        assert!(matches!(err, MurmurError::Config(_)));
    }

    #[test]
    fn test_merge_layers() {
        let defaults = json!({"voice": "a", "rate": 1.0, "nested": {"x": 1, "y": 2}});
        let global = json!({"rate": 1.2, "nested": {"y": 3}});
        let local = json!({"voice": "b", "tags": ["x"]});

        let merged = merge_layers(&defaults, &global, &local);
        assert_eq!(
            merged,
            json!({"voice": "b", "rate": 1.2, "nested": {"x": 1, "y": 3}, "tags": ["x"]})
        );
        assert_eq!(merge_layers(&Value::Null, &Value::Null, &Value::Null), Value::Null);
    }
}
