//! Orchestrator for the end-to-end message flow
//!
//! Connects all components: Input -> Normalize -> Pipeline -> Decision ->
//! Intent -> Render parameters -> Output fan-out
//!
//! Input providers publish `perception.raw_data.generated`; the orchestrator
//! subscribes to it and runs each message through the flow on its own task,
//! so a slow decision never blocks an input provider's stream.

use super::config::{merge_layers, MurmurConfig};
use super::expression::ExpressionMapper;
use crate::cache::CacheStats;
use crate::context::CoreContext;
use crate::decision::{DecisionBackend, DecisionRouter, IntentParser, RouterStats};
use crate::events::{names, Event, SubscribeOptions, SubscriptionId};
use crate::messages::{CanonicalMessage, Intent, RawData};
use crate::pipeline::{normalize, PipelineManager, PipelineOutcome, PipelineStats};
use crate::providers::{
    InputProvider, InputProviderManager, LifecycleSummary, OutputProvider, OutputProviderManager,
    ProviderRegistry, RenderReport, StartReport,
};
use crate::utils::{LatencySummary, TimingTracker};
use crate::{MurmurError, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Source name the orchestrator emits its own events under
const SOURCE: &str = "orchestrator";

/// Events emitted by the orchestrator
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Providers are set up and inputs are running
    Started {
        inputs: usize,
        outputs: usize,
        backend: Option<String>,
    },

    /// A message passed the pipeline and is about to be decided on
    MessageReady(CanonicalMessage),

    /// A message was dropped before reaching the decision backend
    MessageDropped { stage: String, reason: String },

    /// The decision reply was interpreted
    IntentGenerated(Intent),

    /// Render fan-out finished
    Rendered { succeeded: usize, failed: usize },

    /// The active decision backend changed
    BackendSwitched { from: Option<String>, to: String },

    /// A message could not complete the flow
    Error(String),

    /// Orchestrator has shut down
    Stopped,
}

/// Where a message ended up
#[derive(Debug, Clone)]
pub enum FlowOutcome {
    Dropped { stage: String, reason: String },
    Rendered { intent: Intent, report: RenderReport },
}

/// Outcomes of `start`
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub inputs: StartReport,
    pub outputs: StartReport,
}

/// Counters for the flow and every component
#[derive(Debug, Clone)]
pub struct OrchestratorStats {
    pub processed: u64,
    pub dropped: u64,
    pub rendered: u64,
    pub errors: u64,
    /// Raw input to render completion
    pub flow_latency: LatencySummary,
    pub pipeline: PipelineStats,
    pub router: RouterStats,
    pub inputs: LifecycleSummary,
    pub outputs: LifecycleSummary,
    pub cache: CacheStats,
}

#[derive(Default)]
struct FlowCounters {
    processed: u64,
    dropped: u64,
    rendered: u64,
    errors: u64,
    timing: TimingTracker,
}

/// Everything a per-message task needs
struct Flow {
    ctx: CoreContext,
    pipeline: PipelineManager,
    router: DecisionRouter,
    outputs: OutputProviderManager,
    parser: IntentParser,
    mapper: ExpressionMapper,
    event_tx: Sender<OrchestratorEvent>,
    counters: Mutex<FlowCounters>,
}

impl Flow {
    fn notify(&self, event: OrchestratorEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!("Notification channel full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    async fn process_raw(&self, raw: RawData) -> Result<FlowOutcome> {
        let started = Instant::now();
        self.counters.lock().processed += 1;

        let result = self.run(raw).await;
        let mut counters = self.counters.lock();
        match &result {
            Ok(FlowOutcome::Dropped { .. }) => counters.dropped += 1,
            Ok(FlowOutcome::Rendered { .. }) => {
                counters.rendered += 1;
                counters.timing.record(started.elapsed());
            }
            Err(e) => {
                counters.errors += 1;
                drop(counters);
                warn!("Message flow failed: {}", e);
                self.notify(OrchestratorEvent::Error(e.user_message()));
            }
        }
        result
    }

    async fn run(&self, raw: RawData) -> Result<FlowOutcome> {
        let source = raw.source.clone();
        let mut normalized = normalize(&raw);

        if normalized.text.is_empty() {
            return Ok(self.dropped("normalize", "empty text"));
        }

        let outcome = self
            .pipeline
            .process(std::mem::take(&mut normalized.text), &normalized.metadata)
            .await?;
        let text = match outcome {
            PipelineOutcome::Passed(text) => text,
            PipelineOutcome::Dropped { stage, reason } => return Ok(self.dropped(&stage, &reason)),
        };
        normalized.text = text;

        let message = CanonicalMessage::from_normalized(normalized, source);
        debug!(source = %message.source, "Message ready: {}", message.text);
        self.ctx
            .bus
            .emit(names::MESSAGE_READY, message.clone(), SOURCE)
            .await?;
        self.notify(OrchestratorEvent::MessageReady(message.clone()));

        let reply = self.router.decide(&message).await?;
        let intent = self.parser.parse(&message, &reply);
        self.ctx
            .bus
            .emit(names::INTENT_GENERATED, intent.clone(), SOURCE)
            .await?;
        self.notify(OrchestratorEvent::IntentGenerated(intent.clone()));

        let parameters = self.mapper.map(&intent);
        self.ctx
            .bus
            .emit(names::PARAMETERS_GENERATED, parameters.clone(), SOURCE)
            .await?;

        let report = self.outputs.render_all(&parameters).await;
        self.notify(OrchestratorEvent::Rendered {
            succeeded: report.succeeded(),
            failed: report.failed(),
        });
        Ok(FlowOutcome::Rendered { intent, report })
    }

    fn dropped(&self, stage: &str, reason: &str) -> FlowOutcome {
        debug!(stage, reason, "Message dropped");
        self.notify(OrchestratorEvent::MessageDropped {
            stage: stage.to_string(),
            reason: reason.to_string(),
        });
        FlowOutcome::Dropped {
            stage: stage.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Collects providers and backends before the orchestrator is built
pub struct OrchestratorBuilder {
    config: MurmurConfig,
    registry: ProviderRegistry,
    inputs: Vec<Box<dyn InputProvider>>,
    outputs: Vec<Box<dyn OutputProvider>>,
}

impl OrchestratorBuilder {
    pub fn new(config: MurmurConfig) -> Self {
        Self {
            config,
            registry: ProviderRegistry::with_builtins(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Replace the registry the configured provider names are looked up in
    pub fn registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Add an input provider alongside the configured ones
    pub fn input(mut self, provider: Box<dyn InputProvider>) -> Self {
        self.inputs.push(provider);
        self
    }

    /// Add an output provider alongside the configured ones
    pub fn output(mut self, provider: Box<dyn OutputProvider>) -> Self {
        self.outputs.push(provider);
        self
    }

    /// Register a decision backend factory
    pub fn backend<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn DecisionBackend> + Send + Sync + 'static,
    {
        self.registry.register_backend(name, factory);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let Self {
            config,
            registry,
            mut inputs,
            mut outputs,
        } = self;
        config.validate()?;

        let ctx = CoreContext::new(config.bus.clone(), config.cache.clone())?;
        let global = &config.providers.global;

        for entry in &config.providers.inputs {
            let merged = merge_layers(&registry.defaults(&entry.name), global, &entry.config);
            inputs.push(registry.create_input(&entry.name, &merged)?);
        }
        for entry in &config.providers.outputs {
            let merged = merge_layers(&registry.defaults(&entry.name), global, &entry.config);
            outputs.push(registry.create_output(&entry.name, &merged)?);
        }

        let router = DecisionRouter::new(Arc::clone(&ctx.bus), config.router.clone());
        registry.install_backends(&router);
        if let Some(entry) = &config.providers.backend {
            if !router.backend_names().contains(&entry.name) {
                return Err(MurmurError::BackendNotFound(entry.name.clone()));
            }
        }

        let (event_tx, event_rx) = bounded(config.notification_buffer);
        let flow = Arc::new(Flow {
            pipeline: PipelineManager::from_config(&config.pipeline, Some(Arc::clone(&ctx.bus)))?,
            router,
            outputs: OutputProviderManager::new(ctx.clone(), config.lifecycle.clone()),
            parser: IntentParser::new(),
            mapper: ExpressionMapper::new(config.expressions.clone()),
            event_tx,
            counters: Mutex::new(FlowCounters::default()),
            ctx: ctx.clone(),
        });

        Ok(Orchestrator {
            inputs: InputProviderManager::new(ctx.clone(), config.lifecycle.clone()),
            ctx,
            flow,
            config,
            registry,
            pending_inputs: Mutex::new(inputs),
            pending_outputs: Mutex::new(outputs),
            tasks: TaskTracker::new(),
            sweeper_cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
            subscription: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            event_rx,
        })
    }
}

/// Composition root that owns every component
pub struct Orchestrator {
    config: MurmurConfig,
    registry: ProviderRegistry,
    ctx: CoreContext,
    flow: Arc<Flow>,
    inputs: InputProviderManager,
    pending_inputs: Mutex<Vec<Box<dyn InputProvider>>>,
    pending_outputs: Mutex<Vec<Box<dyn OutputProvider>>>,
    // Per-message tasks spawned from the raw data subscription
    tasks: TaskTracker,
    sweeper_cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    started: AtomicBool,
    stopped: AtomicBool,
    event_rx: Receiver<OrchestratorEvent>,
}

impl Orchestrator {
    pub fn builder(config: MurmurConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Build with the built-in registry and the configured providers only
    pub fn new(config: MurmurConfig) -> Result<Self> {
        OrchestratorBuilder::new(config).build()
    }

    /// Start every component
    ///
    /// The configured backend is activated first, so a bad backend fails
    /// the start before any input runs. Individual provider failures do not
    /// fail the start; they are reported per provider.
    pub async fn start(&self) -> Result<StartupReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MurmurError::Config("orchestrator already started".to_string()));
        }
        info!("Starting orchestrator");

        let backend = match &self.config.providers.backend {
            Some(entry) => {
                let merged = self.resolve(&entry.name, &entry.config);
                self.flow.router.configure(&entry.name, &merged).await?;
                Some(entry.name.clone())
            }
            None => {
                warn!("No decision backend configured; messages will fail until one is set");
                None
            }
        };

        let outputs = std::mem::take(&mut *self.pending_outputs.lock());
        let outputs = self.flow.outputs.setup_all(outputs).await;

        let flow = Arc::clone(&self.flow);
        let tasks = self.tasks.clone();
        let id = self.ctx.bus.subscribe_fn(
            names::RAW_DATA_GENERATED,
            "orchestrator.flow",
            SubscribeOptions::default(),
            move |event: Event<RawData>| {
                let flow = Arc::clone(&flow);
                let tasks = tasks.clone();
                async move {
                    let raw = RawData::clone(&event.payload);
                    tasks.spawn(async move {
                        let _ = flow.process_raw(raw).await;
                    });
                    Ok(())
                }
            },
        )?;
        *self.subscription.lock() = Some(id);
        *self.sweeper.lock() = Some(self.ctx.cache.spawn_sweeper(self.sweeper_cancel.clone()));

        let inputs = std::mem::take(&mut *self.pending_inputs.lock());
        let inputs = self.inputs.start_all(inputs).await;

        info!(
            inputs = inputs.running(),
            outputs = outputs.running(),
            "Orchestrator started"
        );
        self.flow.notify(OrchestratorEvent::Started {
            inputs: inputs.running(),
            outputs: outputs.running(),
            backend,
        });
        Ok(StartupReport { inputs, outputs })
    }

    /// Stop every component
    ///
    /// Inputs stop first, then in-flight messages finish, then outputs and
    /// the backend are released. Calling `stop` twice is a no-op.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) || self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping orchestrator");

        self.inputs.stop_all().await;
        if let Some(id) = self.subscription.lock().take() {
            self.ctx.bus.unsubscribe(names::RAW_DATA_GENERATED, id);
        }

        self.tasks.close();
        if !self.tasks.is_empty() {
            debug!(in_flight = self.tasks.len(), "Waiting for in-flight messages");
        }
        self.tasks.wait().await;

        self.flow.outputs.stop_all().await;
        self.flow.router.shutdown().await;

        self.sweeper_cancel.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                error!("Cache sweeper ended abnormally: {}", e);
            }
        }

        info!("Orchestrator stopped");
        self.flow.notify(OrchestratorEvent::Stopped);
    }

    /// Run one raw input through the flow directly, bypassing the bus
    pub async fn process_raw(&self, raw: RawData) -> Result<FlowOutcome> {
        self.flow.process_raw(raw).await
    }

    /// Hot-swap the decision backend
    ///
    /// `config` is the adapter-local layer; registry defaults and the global
    /// layer are merged under it.
    pub async fn switch_backend(&self, name: &str, config: &Value) -> Result<()> {
        let from = self.flow.router.current_backend_info().await.map(|a| a.name);
        let merged = self.resolve(name, config);

        match self.flow.router.switch_backend(name, &merged).await {
            Ok(()) => {
                self.flow.notify(OrchestratorEvent::BackendSwitched {
                    from,
                    to: name.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                error!(backend = %name, "Backend switch failed: {}", e);
                self.flow.notify(OrchestratorEvent::Error(e.user_message()));
                Err(e)
            }
        }
    }

    pub async fn stats(&self) -> OrchestratorStats {
        let (processed, dropped, rendered, errors, flow_latency) = {
            let counters = self.flow.counters.lock();
            (
                counters.processed,
                counters.dropped,
                counters.rendered,
                counters.errors,
                counters.timing.summary(),
            )
        };
        OrchestratorStats {
            processed,
            dropped,
            rendered,
            errors,
            flow_latency,
            pipeline: self.flow.pipeline.stats().await,
            router: self.flow.router.stats().await,
            inputs: self.inputs.stats(),
            outputs: self.flow.outputs.stats(),
            cache: self.ctx.cache.stats(),
        }
    }

    /// Receiver for orchestrator notifications
    pub fn events(&self) -> Receiver<OrchestratorEvent> {
        self.event_rx.clone()
    }

    /// Try to receive a notification without blocking
    pub fn try_recv_event(&self) -> Option<OrchestratorEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn context(&self) -> &CoreContext {
        &self.ctx
    }

    pub fn config(&self) -> &MurmurConfig {
        &self.config
    }

    pub fn inputs(&self) -> &InputProviderManager {
        &self.inputs
    }

    pub fn outputs(&self) -> &OutputProviderManager {
        &self.flow.outputs
    }

    pub fn router(&self) -> &DecisionRouter {
        &self.flow.router
    }

    pub fn pipeline(&self) -> &PipelineManager {
        &self.flow.pipeline
    }

    fn resolve(&self, name: &str, local: &Value) -> Value {
        merge_layers(
            &self.registry.defaults(name),
            &self.config.providers.global,
            local,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::RuleBackend;
    use crate::events::EventBus;
    use crate::integration::config::ProviderEntry;
    use crate::messages::{Emotion, ProviderInfo, RenderParameters};
    use crate::pipeline::ContentFilterConfig;
    use async_trait::async_trait;
    use serde_json::json;

    /// Collects rendered subtitles
    struct Capture {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl OutputProvider for Capture {
        fn info(&self) -> ProviderInfo {
            ProviderInfo::new("capture")
        }

        async fn setup(&mut self, _bus: Arc<EventBus>) -> Result<()> {
            Ok(())
        }

        async fn render(&mut self, parameters: &RenderParameters) -> Result<()> {
            self.seen.lock().push(parameters.subtitle_text.clone());
            Ok(())
        }
    }

    fn rules_config() -> MurmurConfig {
        MurmurConfig::default().with_backend(ProviderEntry::new(RuleBackend::NAME).with_config(
            json!({
                "rules": [{"keywords": ["hello"], "reply": "[happy] Hi there! {hotkey:wave}"}],
                "fallback": "You said: {text}"
            }),
        ))
    }

    async fn started(config: MurmurConfig) -> (Orchestrator, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = Orchestrator::builder(config)
            .output(Box::new(Capture { seen: Arc::clone(&seen) }))
            .build()
            .unwrap();
        orchestrator.start().await.unwrap();
        (orchestrator, seen)
    }

    #[tokio::test]
    async fn test_process_raw_end_to_end() {
        let (orchestrator, seen) = started(rules_config()).await;

        let outcome = orchestrator
            .process_raw(RawData::text("hello bot", "chat"))
            .await
            .unwrap();
        match outcome {
            FlowOutcome::Rendered { intent, report } => {
                assert_eq!(intent.emotion, Emotion::Happy);
                assert_eq!(intent.response_text, "Hi there!");
                assert_eq!(report.succeeded(), 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(*seen.lock(), vec!["Hi there!"]);

        let stats = orchestrator.stats().await;
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.rendered, 1);
        assert_eq!(stats.router.decisions, 1);
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_filtered_message_never_decided() {
        let mut config = rules_config();
        config.pipeline.content_filter = Some(ContentFilterConfig {
            blocked_words: vec!["spam".into()],
            ..Default::default()
        });
        let (orchestrator, seen) = started(config).await;

        let outcome = orchestrator
            .process_raw(RawData::text("buy spam now", "chat"))
            .await
            .unwrap();
        assert!(matches!(outcome, FlowOutcome::Dropped { ref stage, .. } if stage == "content_filter"));
        assert!(seen.lock().is_empty());
        assert_eq!(orchestrator.stats().await.router.decisions, 0);
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_empty_input_dropped() {
        let (orchestrator, _seen) = started(rules_config()).await;
        let outcome = orchestrator.process_raw(RawData::text("   ", "chat")).await.unwrap();
        assert!(matches!(outcome, FlowOutcome::Dropped { ref stage, .. } if stage == "normalize"));
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_no_backend_is_error() {
        let (orchestrator, _seen) = started(MurmurConfig::default()).await;
        let err = orchestrator
            .process_raw(RawData::text("hello", "chat"))
            .await
            .unwrap_err();
        assert_eq!(err, MurmurError::NoActiveBackend);

        let events: Vec<_> = orchestrator.events().try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, OrchestratorEvent::Error(_))));
        assert_eq!(orchestrator.stats().await.errors, 1);
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_backend_fails_build() {
        let config = MurmurConfig::default().with_backend(ProviderEntry::new("oracle"));
        let err = Orchestrator::new(config).err().unwrap();
        assert_eq!(err, MurmurError::BackendNotFound("oracle".into()));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let (orchestrator, _seen) = started(rules_config()).await;
        assert!(orchestrator.start().await.is_err());
        orchestrator.stop().await;
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_switch_backend_notifies() {
        let (orchestrator, seen) = started(rules_config()).await;
        orchestrator
            .switch_backend(RuleBackend::NAME, &json!({"fallback": "echo {text}"}))
            .await
            .unwrap();
        orchestrator
            .process_raw(RawData::text("hello", "chat"))
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec!["echo hello"]);

        let events: Vec<_> = orchestrator.events().try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            OrchestratorEvent::BackendSwitched { from: Some(from), to } if from == "rules" && to == "rules"
        )));
        orchestrator.stop().await;
    }
}
