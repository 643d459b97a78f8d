//! Stage contract for the text pipeline

use crate::messages::Metadata;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of running one stage on a piece of text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Pass the (possibly rewritten) text to the next stage
    Continue(String),
    /// Discard the message; counted as a drop, not a failure
    Drop { reason: String },
    /// The stage could not process the text; handled by the stage's error policy
    Fail(String),
}

/// What the pipeline does when a stage fails or times out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log and carry on with the text as it was before the stage
    #[default]
    Continue,
    /// Abort with a pipeline error
    Stop,
    /// Discard the message
    Drop,
}

/// Per-stage scheduling and failure settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Lower runs earlier
    pub priority: i32,
    pub enabled: bool,
    pub timeout_ms: u64,
    pub error_policy: ErrorPolicy,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            priority: 100,
            enabled: true,
            timeout_ms: 5000,
            error_policy: ErrorPolicy::Continue,
        }
    }
}

impl StageConfig {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A text transform in the pipeline
///
/// Stages take `&mut self` so they can keep per-stage state (windows,
/// counters) without their own locking; the pipeline runs one message at a
/// time through the chain.
#[async_trait]
pub trait TextStage: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&mut self, text: String, metadata: &Metadata) -> StageOutcome;
}
