//! Decision backend contract

use crate::events::EventBus;
use crate::messages::{CanonicalMessage, Metadata, ProviderInfo};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Raw reply of a decision backend, before intent interpretation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionReply {
    pub text: String,
    /// Name of the backend that produced the reply
    pub backend: String,
    pub metadata: Metadata,
}

impl DecisionReply {
    pub fn new(text: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            backend: backend.into(),
            metadata: Metadata::new(),
        }
    }
}

/// Turns a canonical message into a reply
///
/// `decide` takes `&self` so many decisions may run at once; `setup` and
/// `cleanup` run while the router holds the backend exclusively. Retrying a
/// failed decision is the backend's business, the router never retries.
#[async_trait]
pub trait DecisionBackend: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn setup(&mut self, bus: Arc<EventBus>, config: &Value) -> Result<()>;

    async fn decide(&self, message: &CanonicalMessage) -> Result<DecisionReply>;

    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Constructor registered under a backend name
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn DecisionBackend> + Send + Sync>;
