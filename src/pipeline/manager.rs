//! Pipeline manager: runs text through the ordered stage chain
//!
//! ```text
//! text ─► [p=10 rate_limit] ─► [p=20 content_filter] ─► ... ─► Passed(text)
//!              │ Drop               │ Fail + policy
//!              ▼                    ▼
//!          Dropped             continue / stop / drop
//! ```

use super::content_filter::{ContentFilterConfig, ContentFilterStage, CONTENT_FILTER_STAGE};
use super::rate_limit::{RateLimitConfig, RateLimitStage, RATE_LIMIT_STAGE, SOURCE_KEY};
use super::stage::{ErrorPolicy, StageConfig, StageOutcome, TextStage};
use crate::events::{names, EventBus, EventPayload};
use crate::messages::Metadata;
use crate::utils::{LatencySummary, TimingTracker};
use crate::{MurmurError, Result};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const BUILTIN_STAGES: &[&str] = &[RATE_LIMIT_STAGE, CONTENT_FILTER_STAGE];

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Timeout applied to built-in stages
    pub stage_timeout_ms: u64,
    /// Enables the rate limit stage (priority 10) when set
    pub rate_limit: Option<RateLimitConfig>,
    /// Enables the content filter stage (priority 20) when set
    pub content_filter: Option<ContentFilterConfig>,
    /// Scheduling and error policy for a built-in stage, keyed by stage name
    ///
    /// An entry replaces the stage's whole [`StageConfig`]; unset fields take
    /// the `StageConfig` defaults.
    pub stages: BTreeMap<String, StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: 5000,
            rate_limit: None,
            content_filter: None,
            stages: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn with_content_filter(mut self, config: ContentFilterConfig) -> Self {
        self.content_filter = Some(config);
        self
    }

    /// Override the scheduling of a built-in stage
    pub fn with_stage(mut self, name: impl Into<String>, config: StageConfig) -> Self {
        self.stages.insert(name.into(), config);
        self
    }

    /// Stage config for a built-in stage: the override if any, else `priority`
    /// with the pipeline-wide timeout and the continue policy
    fn builtin_stage(&self, name: &str, priority: i32) -> StageConfig {
        self.stages.get(name).cloned().unwrap_or_else(|| {
            StageConfig::default()
                .with_timeout_ms(self.stage_timeout_ms)
                .with_priority(priority)
        })
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.stage_timeout_ms == 0 {
            return Err("pipeline.stage_timeout_ms must be greater than zero".to_string());
        }
        if let Some(name) = self.stages.keys().find(|name| !BUILTIN_STAGES.contains(&name.as_str())) {
            return Err(format!("pipeline.stages.{} is not a built-in stage", name));
        }
        Ok(())
    }
}

/// Final result of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Passed(String),
    Dropped { stage: String, reason: String },
}

/// Payload of `pipeline.message.dropped`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageDropped {
    pub stage: String,
    pub reason: String,
    pub source: String,
    pub text: String,
}

impl EventPayload for MessageDropped {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.stage.is_empty() {
            return Err("dropped message has no stage".to_string());
        }
        Ok(())
    }
}

/// Statistics for one stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStats {
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub processed: u64,
    pub dropped: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub latency: LatencySummary,
}

/// Aggregate pipeline statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub processed: u64,
    pub passed: u64,
    pub dropped: u64,
    pub failed: u64,
    pub stages: Vec<StageStats>,
}

struct StageSlot {
    name: String,
    stage: Box<dyn TextStage>,
    config: StageConfig,
    processed: u64,
    dropped: u64,
    errors: u64,
    timeouts: u64,
    timing: TimingTracker,
}

impl StageSlot {
    fn new(stage: Box<dyn TextStage>, config: StageConfig) -> Self {
        Self {
            name: stage.name().to_string(),
            stage,
            config,
            processed: 0,
            dropped: 0,
            errors: 0,
            timeouts: 0,
            timing: TimingTracker::default(),
        }
    }

    fn stats(&self) -> StageStats {
        StageStats {
            name: self.name.clone(),
            priority: self.config.priority,
            enabled: self.config.enabled,
            processed: self.processed,
            dropped: self.dropped,
            errors: self.errors,
            timeouts: self.timeouts,
            latency: self.timing.summary(),
        }
    }

    /// Run the stage once, folding timeouts and panics into a failure
    async fn run(&mut self, text: String, metadata: &Metadata) -> std::result::Result<StageOutcome, MurmurError> {
        let limit = Duration::from_millis(self.config.timeout_ms);
        let call = AssertUnwindSafe(self.stage.process(text, metadata)).catch_unwind();

        let outcome = if self.config.timeout_ms > 0 {
            match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.timeouts += 1;
                    return Err(MurmurError::StageTimeout {
                        stage: self.name.clone(),
                        timeout_ms: self.config.timeout_ms,
                    });
                }
            }
        } else {
            call.await
        };

        match outcome {
            Ok(StageOutcome::Fail(message)) => Err(MurmurError::pipeline(&self.name, message)),
            Ok(other) => Ok(other),
            Err(_) => Err(MurmurError::pipeline(&self.name, "stage panicked")),
        }
    }
}

#[derive(Default)]
struct PipelineState {
    stages: Vec<StageSlot>,
    processed: u64,
    passed: u64,
    dropped: u64,
    failed: u64,
}

impl PipelineState {
    fn insert(&mut self, slot: StageSlot) {
        let position = self
            .stages
            .partition_point(|s| s.config.priority <= slot.config.priority);
        self.stages.insert(position, slot);
    }

    async fn run(&mut self, text: String, metadata: &Metadata) -> Result<PipelineOutcome> {
        self.processed += 1;
        let mut current = text;

        for slot in self.stages.iter_mut().filter(|s| s.config.enabled) {
            let before = current.clone();
            let started = Instant::now();
            let result = slot.run(current, metadata).await;
            slot.timing.record(started.elapsed());
            slot.processed += 1;

            match result {
                Ok(StageOutcome::Continue(text)) => current = text,
                Ok(StageOutcome::Drop { reason }) => {
                    slot.dropped += 1;
                    self.dropped += 1;
                    debug!(stage = %slot.name, reason = %reason, "Message dropped");
                    return Ok(PipelineOutcome::Dropped {
                        stage: slot.name.clone(),
                        reason,
                    });
                }
                // Folded into an error by `StageSlot::run`
                Ok(StageOutcome::Fail(_)) => current = before,
                Err(err) => {
                    slot.errors += 1;
                    match slot.config.error_policy {
                        ErrorPolicy::Continue => {
                            warn!(stage = %slot.name, "Stage failed, continuing: {}", err);
                            current = before;
                        }
                        ErrorPolicy::Stop => {
                            warn!(stage = %slot.name, "Stage failed, stopping: {}", err);
                            self.failed += 1;
                            return Err(err);
                        }
                        ErrorPolicy::Drop => {
                            warn!(stage = %slot.name, "Stage failed, dropping message: {}", err);
                            slot.dropped += 1;
                            self.dropped += 1;
                            return Ok(PipelineOutcome::Dropped {
                                stage: slot.name.clone(),
                                reason: err.to_string(),
                            });
                        }
                    }
                }
            }
        }

        self.passed += 1;
        Ok(PipelineOutcome::Passed(current))
    }
}

/// Runs texts through an ordered chain of [`TextStage`]s
///
/// One message at a time holds the chain, so stages with mutable state never
/// see two texts interleaved.
pub struct PipelineManager {
    state: Mutex<PipelineState>,
    bus: Option<Arc<EventBus>>,
}

impl PipelineManager {
    /// Create an empty pipeline; drops are reported on `bus` when given
    pub fn new(bus: Option<Arc<EventBus>>) -> Result<Self> {
        if let Some(bus) = &bus {
            bus.register_event::<MessageDropped>(names::MESSAGE_DROPPED)?;
        }
        Ok(Self {
            state: Mutex::new(PipelineState::default()),
            bus,
        })
    }

    /// Create a pipeline with the built-in stages the config enables
    pub fn from_config(config: &PipelineConfig, bus: Option<Arc<EventBus>>) -> Result<Self> {
        config.validate().map_err(MurmurError::Config)?;
        let mut manager = Self::new(bus)?;
        let state = manager.state.get_mut();

        if let Some(rate_limit) = &config.rate_limit {
            state.insert(StageSlot::new(
                Box::new(RateLimitStage::new(rate_limit.clone())),
                config.builtin_stage(RATE_LIMIT_STAGE, 10),
            ));
        }
        if let Some(filter) = &config.content_filter {
            state.insert(StageSlot::new(
                Box::new(ContentFilterStage::new(filter.clone())),
                config.builtin_stage(CONTENT_FILTER_STAGE, 20),
            ));
        }
        Ok(manager)
    }

    /// Add a stage; equal priorities keep insertion order
    pub async fn add_stage(&self, stage: Box<dyn TextStage>, config: StageConfig) {
        let slot = StageSlot::new(stage, config);
        info!(stage = %slot.name, priority = slot.config.priority, "Adding pipeline stage");
        self.state.lock().await.insert(slot);
    }

    /// Remove every stage with the given name; returns whether any existed
    pub async fn remove_stage(&self, name: &str) -> bool {
        let mut state = self.state.lock().await;
        let before = state.stages.len();
        state.stages.retain(|s| s.name != name);
        state.stages.len() != before
    }

    /// Enable or disable a stage by name; returns whether it exists
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut state = self.state.lock().await;
        let mut found = false;
        for slot in state.stages.iter_mut().filter(|s| s.name == name) {
            slot.config.enabled = enabled;
            found = true;
        }
        found
    }

    /// Stage names in execution order
    pub async fn stage_names(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .stages
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// Run one text through the chain
    ///
    /// Drops are reported as [`PipelineOutcome::Dropped`]; only a failing
    /// stage with the `stop` policy returns an error.
    pub async fn process(&self, text: String, metadata: &Metadata) -> Result<PipelineOutcome> {
        let original = text.clone();
        let outcome = {
            let mut state = self.state.lock().await;
            state.run(text, metadata).await
        };

        if let Ok(PipelineOutcome::Dropped { stage, reason }) = &outcome {
            self.report_drop(stage, reason, original, metadata).await;
        }
        outcome
    }

    async fn report_drop(&self, stage: &str, reason: &str, text: String, metadata: &Metadata) {
        let Some(bus) = &self.bus else {
            return;
        };
        let source = metadata
            .get(SOURCE_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let payload = MessageDropped {
            stage: stage.to_string(),
            reason: reason.to_string(),
            source,
            text,
        };
        if let Err(e) = bus.emit(names::MESSAGE_DROPPED, payload, "pipeline").await {
            warn!("Failed to report dropped message: {}", e);
        }
    }

    pub async fn stats(&self) -> PipelineStats {
        let state = self.state.lock().await;
        PipelineStats {
            processed: state.processed,
            passed: state.passed,
            dropped: state.dropped,
            failed: state.failed,
            stages: state.stages.iter().map(StageSlot::stats).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Appends a marker so ordering is visible in the output
    struct Tag(&'static str);

    #[async_trait]
    impl TextStage for Tag {
        fn name(&self) -> &str {
            self.0
        }

        async fn process(&mut self, text: String, _metadata: &Metadata) -> StageOutcome {
            StageOutcome::Continue(format!("{}{}", text, self.0))
        }
    }

    struct Failing;

    #[async_trait]
    impl TextStage for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn process(&mut self, _text: String, _metadata: &Metadata) -> StageOutcome {
            StageOutcome::Fail("cannot enrich".into())
        }
    }

    struct Slow;

    #[async_trait]
    impl TextStage for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn process(&mut self, text: String, _metadata: &Metadata) -> StageOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            StageOutcome::Continue(text)
        }
    }

    struct Rejecting;

    #[async_trait]
    impl TextStage for Rejecting {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn process(&mut self, _text: String, _metadata: &Metadata) -> StageOutcome {
            StageOutcome::Drop {
                reason: "not interesting".into(),
            }
        }
    }

    async fn run(manager: &PipelineManager, text: &str) -> Result<PipelineOutcome> {
        manager.process(text.to_string(), &Metadata::new()).await
    }

    #[tokio::test]
    async fn test_stages_run_in_priority_order() {
        let manager = PipelineManager::new(None).unwrap();
        manager.add_stage(Box::new(Tag("b")), StageConfig::default().with_priority(20)).await;
        manager.add_stage(Box::new(Tag("a")), StageConfig::default().with_priority(10)).await;
        manager.add_stage(Box::new(Tag("c")), StageConfig::default().with_priority(20)).await;

        assert_eq!(manager.stage_names().await, vec!["a", "b", "c"]);
        assert_eq!(run(&manager, ">").await.unwrap(), PipelineOutcome::Passed(">abc".into()));
    }

    #[tokio::test]
    async fn test_continue_policy_keeps_pre_stage_text() {
        let manager = PipelineManager::new(None).unwrap();
        manager.add_stage(Box::new(Failing), StageConfig::default().with_priority(1)).await;
        manager.add_stage(Box::new(Tag("!")), StageConfig::default().with_priority(2)).await;

        assert_eq!(run(&manager, "hi").await.unwrap(), PipelineOutcome::Passed("hi!".into()));
        let stats = manager.stats().await;
        assert_eq!(stats.stages[0].errors, 1);
        assert_eq!(stats.passed, 1);
    }

    #[tokio::test]
    async fn test_stop_policy_returns_error() {
        let manager = PipelineManager::new(None).unwrap();
        manager
            .add_stage(Box::new(Failing), StageConfig::default().with_policy(ErrorPolicy::Stop))
            .await;

        let err = run(&manager, "hi").await.unwrap_err();
        assert!(matches!(err, MurmurError::Pipeline { ref stage, .. } if stage == "failing"));
        assert_eq!(manager.stats().await.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_drop_policy() {
        let manager = PipelineManager::new(None).unwrap();
        manager
            .add_stage(
                Box::new(Slow),
                StageConfig::default()
                    .with_timeout_ms(100)
                    .with_policy(ErrorPolicy::Drop),
            )
            .await;

        let outcome = run(&manager, "hi").await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::Dropped { ref stage, .. } if stage == "slow"));
        assert_eq!(manager.stats().await.stages[0].timeouts, 1);
    }

    #[tokio::test]
    async fn test_drop_short_circuits_and_is_reported() {
        let bus = Arc::new(EventBus::default());
        let manager = PipelineManager::new(Some(Arc::clone(&bus))).unwrap();
        manager.add_stage(Box::new(Rejecting), StageConfig::default().with_priority(1)).await;
        manager.add_stage(Box::new(Tag("x")), StageConfig::default().with_priority(2)).await;

        let outcome = run(&manager, "hi").await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::Dropped { .. }));

        let stats = manager.stats().await;
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.stages[1].processed, 0);
        assert_eq!(bus.counters(names::MESSAGE_DROPPED).unwrap().emitted, 1);
    }

    #[tokio::test]
    async fn test_disabled_stage_is_skipped() {
        let manager = PipelineManager::new(None).unwrap();
        manager.add_stage(Box::new(Rejecting), StageConfig::default()).await;
        assert!(manager.set_enabled("rejecting", false).await);

        assert_eq!(run(&manager, "hi").await.unwrap(), PipelineOutcome::Passed("hi".into()));
    }

    #[tokio::test]
    async fn test_from_config_builds_builtin_stages() {
        let config = PipelineConfig::default()
            .with_content_filter(ContentFilterConfig {
                blocked_words: vec!["spam".into()],
                max_length: 0,
            })
            .with_rate_limit(RateLimitConfig::default());
        let manager = PipelineManager::from_config(&config, None).unwrap();

        assert_eq!(manager.stage_names().await, vec!["rate_limit", "content_filter"]);
        let outcome = run(&manager, "no spam please").await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::Dropped { ref stage, .. } if stage == "content_filter"));
    }

    #[tokio::test]
    async fn test_builtin_stage_overrides_from_toml() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [content_filter]
            blocked_words = ["spam"]

            [rate_limit]

            [stages.content_filter]
            priority = 5
            error_policy = "stop"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());

        let manager = PipelineManager::from_config(&config, None).unwrap();
        assert_eq!(manager.stage_names().await, vec!["content_filter", "rate_limit"]);

        let stats = manager.stats().await;
        assert_eq!(stats.stages[0].priority, 5);
        assert_eq!(stats.stages[1].priority, 10);
    }

    #[test]
    fn test_unknown_stage_override_rejected() {
        let config = PipelineConfig::default().with_stage("spellcheck", StageConfig::default());
        assert!(config.validate().is_err());
        assert!(PipelineManager::from_config(&config, None).is_err());
    }
}
