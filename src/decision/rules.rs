//! Static keyword-rule decision backend

use super::backend::{DecisionBackend, DecisionReply};
use crate::events::EventBus;
use crate::messages::{CanonicalMessage, ProviderInfo};
use crate::{MurmurError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// One keyword rule; the first rule with a matching keyword wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub keywords: Vec<String>,
    /// Reply text; may carry `[emotion]` and `{action:target}` markers
    pub reply: String,
}

/// Configuration of [`RuleBackend`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    pub rules: Vec<Rule>,
    /// Reply when no rule matches; `{text}` is replaced with the message
    pub fallback: Option<String>,
}

/// Replies from a fixed table of keyword rules
#[derive(Debug, Default)]
pub struct RuleBackend {
    config: RuleConfig,
}

impl RuleBackend {
    pub const NAME: &'static str = "rules";

    pub fn new(config: RuleConfig) -> Self {
        Self { config }
    }

    fn words(text: &str) -> Vec<String> {
        text.split_whitespace()
            .map(|w| {
                w.to_lowercase()
                    .trim_matches(|c: char| c.is_ascii_punctuation())
                    .to_string()
            })
            .filter(|w| !w.is_empty())
            .collect()
    }

    fn matching_rule(&self, text: &str) -> Option<&Rule> {
        let words = Self::words(text);
        self.config.rules.iter().find(|rule| {
            rule.keywords
                .iter()
                .any(|k| words.iter().any(|w| w == &k.to_lowercase()))
        })
    }
}

#[async_trait]
impl DecisionBackend for RuleBackend {
    fn info(&self) -> ProviderInfo {
        ProviderInfo::new(Self::NAME)
            .with_description("Keyword rule table")
            .with_data_types(&["text"])
    }

    /// Replaces the rule table when `config` is a non-null object
    async fn setup(&mut self, _bus: Arc<EventBus>, config: &Value) -> Result<()> {
        if !config.is_null() {
            self.config = serde_json::from_value(config.clone())
                .map_err(|e| MurmurError::decision(Self::NAME, format!("invalid rules: {}", e)))?;
        }
        debug!("Rule backend loaded {} rules", self.config.rules.len());
        Ok(())
    }

    async fn decide(&self, message: &CanonicalMessage) -> Result<DecisionReply> {
        if let Some(rule) = self.matching_rule(&message.text) {
            return Ok(DecisionReply::new(rule.reply.clone(), Self::NAME));
        }
        match &self.config.fallback {
            Some(fallback) => Ok(DecisionReply::new(
                fallback.replace("{text}", &message.text),
                Self::NAME,
            )),
            None => Err(MurmurError::decision(Self::NAME, "no rule matched")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn backend(config: Value) -> RuleBackend {
        let mut backend = RuleBackend::default();
        backend
            .setup(Arc::new(EventBus::default()), &config)
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let backend = backend(json!({
            "rules": [
                {"keywords": ["hello", "hi"], "reply": "[happy] Hello!"},
                {"keywords": ["hi"], "reply": "unreachable"}
            ]
        }))
        .await;

        let reply = backend
            .decide(&CanonicalMessage::new("Hi, there", "chat"))
            .await
            .unwrap();
        assert_eq!(reply.text, "[happy] Hello!");
        assert_eq!(reply.backend, "rules");
    }

    #[tokio::test]
    async fn test_fallback_and_no_match() {
        let with_fallback = backend(json!({"fallback": "You said: {text}"})).await;
        let reply = with_fallback
            .decide(&CanonicalMessage::new("cats", "chat"))
            .await
            .unwrap();
        assert_eq!(reply.text, "You said: cats");

        let strict = backend(Value::Null).await;
        let err = strict
            .decide(&CanonicalMessage::new("cats", "chat"))
            .await
            .unwrap_err();
        assert!(matches!(err, MurmurError::Decision { .. }));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut backend = RuleBackend::default();
        let err = backend
            .setup(Arc::new(EventBus::default()), &json!({"rules": "nope"}))
            .await
            .unwrap_err();
        assert!(matches!(err, MurmurError::Decision { .. }));
    }
}
