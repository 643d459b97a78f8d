//! Sliding-window rate limiting per source and globally

use super::stage::{StageOutcome, TextStage};
use crate::messages::Metadata;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Metadata key carrying the producer identity
pub const SOURCE_KEY: &str = "source";

/// Name of the rate limit stage
pub const RATE_LIMIT_STAGE: &str = "rate_limit";

/// Configuration for [`RateLimitStage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Messages allowed across all sources per window; `0` disables the limit
    pub global_limit: u32,
    /// Messages allowed per source per window; `0` disables the limit
    pub per_source_limit: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_limit: 100,
            per_source_limit: 20,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }
}

/// Drops messages that exceed the configured rates
pub struct RateLimitStage {
    config: RateLimitConfig,
    global: VecDeque<Instant>,
    per_source: HashMap<String, VecDeque<Instant>>,
}

impl RateLimitStage {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            global: VecDeque::new(),
            per_source: HashMap::new(),
        }
    }

    fn prune(window: &mut VecDeque<Instant>, cutoff: Instant) {
        while window.front().is_some_and(|t| *t <= cutoff) {
            window.pop_front();
        }
    }

    fn full(window: &VecDeque<Instant>, limit: u32) -> bool {
        limit > 0 && window.len() >= limit as usize
    }
}

#[async_trait]
impl TextStage for RateLimitStage {
    fn name(&self) -> &str {
        RATE_LIMIT_STAGE
    }

    async fn process(&mut self, text: String, metadata: &Metadata) -> StageOutcome {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.config.window()).unwrap_or(now);
        let source = metadata
            .get(SOURCE_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        Self::prune(&mut self.global, cutoff);
        if Self::full(&self.global, self.config.global_limit) {
            debug!(source = %source, "Global rate limit reached");
            return StageOutcome::Drop {
                reason: format!("global rate limit of {} reached", self.config.global_limit),
            };
        }

        let window = self.per_source.entry(source.clone()).or_default();
        Self::prune(window, cutoff);
        if Self::full(window, self.config.per_source_limit) {
            debug!(source = %source, "Source rate limit reached");
            return StageOutcome::Drop {
                reason: format!(
                    "rate limit of {} for '{}' reached",
                    self.config.per_source_limit, source
                ),
            };
        }

        window.push_back(now);
        self.global.push_back(now);
        // Forget sources that went quiet
        self.per_source.retain(|_, w| {
            Self::prune(w, cutoff);
            !w.is_empty()
        });

        StageOutcome::Continue(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn from(source: &str) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(SOURCE_KEY.to_string(), Value::from(source));
        metadata
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_source_limit_and_window() {
        let mut stage = RateLimitStage::new(RateLimitConfig {
            global_limit: 0,
            per_source_limit: 2,
            window_secs: 10,
        });
        let chat = from("chat");

        assert!(matches!(stage.process("a".into(), &chat).await, StageOutcome::Continue(_)));
        assert!(matches!(stage.process("b".into(), &chat).await, StageOutcome::Continue(_)));
        assert!(matches!(stage.process("c".into(), &chat).await, StageOutcome::Drop { .. }));

        // Other sources have their own window
        assert!(matches!(
            stage.process("d".into(), &from("game")).await,
            StageOutcome::Continue(_)
        ));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(stage.process("e".into(), &chat).await, StageOutcome::Continue(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_sources_are_forgotten() {
        let mut stage = RateLimitStage::new(RateLimitConfig {
            global_limit: 0,
            per_source_limit: 5,
            window_secs: 10,
        });

        stage.process("a".into(), &from("chat")).await;
        stage.process("b".into(), &from("game")).await;
        assert_eq!(stage.per_source.len(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        stage.process("c".into(), &from("voice")).await;
        assert_eq!(stage.per_source.len(), 1);
        assert!(stage.per_source.contains_key("voice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_limit() {
        let mut stage = RateLimitStage::new(RateLimitConfig {
            global_limit: 2,
            per_source_limit: 0,
            window_secs: 60,
        });

        assert!(matches!(stage.process("a".into(), &from("x")).await, StageOutcome::Continue(_)));
        assert!(matches!(stage.process("b".into(), &from("y")).await, StageOutcome::Continue(_)));
        assert!(matches!(stage.process("c".into(), &from("z")).await, StageOutcome::Drop { .. }));
    }
}
