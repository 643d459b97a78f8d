//! Output provider contract and render fan-out

use super::lifecycle::{
    LifecycleConfig, LifecycleSummary, LifecycleTracker, ProviderKind, ProviderState,
    ProviderStats, StartOutcome, StartReport,
};
use crate::context::CoreContext;
use crate::events::{names, EventBus, EventPayload};
use crate::messages::{ProviderInfo, RenderParameters};
use crate::{MurmurError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A renderer (speech, captions, avatar, overlay, ...)
#[async_trait]
pub trait OutputProvider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    /// Prepare for rendering; may subscribe to bus events
    async fn setup(&mut self, bus: Arc<EventBus>) -> Result<()>;

    async fn render(&mut self, parameters: &RenderParameters) -> Result<()>;

    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

type SharedOutput = Arc<tokio::sync::Mutex<Box<dyn OutputProvider>>>;

struct OutputSlot {
    provider: SharedOutput,
    tracker: Arc<LifecycleTracker>,
    cleaned_up: bool,
}

/// Result of one provider's render
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderResult {
    pub provider: String,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl RenderResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-provider results of one `render_all`; payload of `output.render.completed`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenderReport {
    pub results: Vec<RenderResult>,
    /// Providers not rendered to because they are disabled or not running
    pub skipped: Vec<String>,
}

impl RenderReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn result_for(&self, provider: &str) -> Option<&RenderResult> {
        self.results.iter().find(|r| r.provider == provider)
    }
}

impl EventPayload for RenderReport {}

/// Owns the output providers and fans render parameters out to them
pub struct OutputProviderManager {
    ctx: CoreContext,
    config: LifecycleConfig,
    slots: Mutex<BTreeMap<String, OutputSlot>>,
}

impl OutputProviderManager {
    pub fn new(ctx: CoreContext, config: LifecycleConfig) -> Self {
        Self {
            ctx,
            config,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    /// Set up every provider concurrently and wait for all outcomes
    pub async fn setup_all(&self, providers: Vec<Box<dyn OutputProvider>>) -> StartReport {
        let outcomes = join_all(providers.into_iter().map(|p| self.setup_one(p))).await;
        let report = StartReport { outcomes };
        info!(
            "Output providers set up: {} running, {} failed",
            report.running(),
            report.failed()
        );
        report
    }

    async fn setup_one(&self, provider: Box<dyn OutputProvider>) -> StartOutcome {
        let name = provider.info().name;
        let tracker = Arc::new(LifecycleTracker::new(
            name.clone(),
            ProviderKind::Output,
            Some(Arc::clone(&self.ctx.bus)),
        ));
        let shared: SharedOutput = Arc::new(tokio::sync::Mutex::new(provider));

        {
            let mut slots = self.slots.lock();
            if slots.contains_key(&name) {
                warn!(provider = %name, "Output provider already registered");
                return StartOutcome {
                    name: name.clone(),
                    state: slots[&name].tracker.state(),
                    error: Some(format!("output provider '{}' already registered", name)),
                };
            }
            slots.insert(
                name.clone(),
                OutputSlot {
                    provider: Arc::clone(&shared),
                    tracker: Arc::clone(&tracker),
                    cleaned_up: false,
                },
            );
        }

        tracker.transition(ProviderState::Starting).await;
        let bus = Arc::clone(&self.ctx.bus);
        let setup = {
            let mut provider = shared.lock().await;
            let setup = AssertUnwindSafe(provider.setup(bus)).catch_unwind();
            tokio::time::timeout(self.config.start_timeout(), setup).await
        };

        let error = match setup {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e.to_string()),
            Ok(Err(_)) => Some("setup panicked".to_string()),
            Err(_) => Some(format!("setup timed out after {}s", self.config.start_timeout_secs)),
        };

        match &error {
            None => {
                tracker.transition(ProviderState::Running).await;
                info!(provider = %name, "Output provider running");
            }
            Some(message) => {
                error!(provider = %name, "Output provider failed to set up: {}", message);
                tracker.fail(message.clone()).await;
            }
        }

        StartOutcome {
            name,
            state: tracker.state(),
            error,
        }
    }

    /// Render the same parameters on every enabled, running provider
    ///
    /// Renders run concurrently, each under the render timeout. A failure is
    /// recorded against its provider only; after too many consecutive
    /// failures the provider is marked failed and skipped from then on.
    pub async fn render_all(&self, parameters: &RenderParameters) -> RenderReport {
        let mut report = RenderReport::default();
        let mut targets = Vec::new();
        {
            let slots = self.slots.lock();
            for (name, slot) in slots.iter() {
                if slot.tracker.is_enabled() && slot.tracker.state().is_running() {
                    targets.push((name.clone(), Arc::clone(&slot.provider), Arc::clone(&slot.tracker)));
                } else {
                    report.skipped.push(name.clone());
                }
            }
        }

        let renders = targets
            .into_iter()
            .map(|(name, provider, tracker)| self.render_one(name, provider, tracker, parameters));
        report.results = join_all(renders).await;

        debug!(
            "Rendered to {} providers ({} failed, {} skipped)",
            report.results.len(),
            report.failed(),
            report.skipped.len()
        );

        if let Err(e) = self
            .ctx
            .bus
            .emit(names::RENDER_COMPLETED, report.clone(), "output")
            .await
        {
            warn!("Failed to publish render report: {}", e);
        }
        report
    }

    async fn render_one(
        &self,
        name: String,
        provider: SharedOutput,
        tracker: Arc<LifecycleTracker>,
        parameters: &RenderParameters,
    ) -> RenderResult {
        let started = Instant::now();
        let limit = self.config.render_timeout();

        let outcome = tokio::time::timeout(limit, async {
            let mut provider = provider.lock().await;
            AssertUnwindSafe(provider.render(parameters)).catch_unwind().await
        })
        .await;

        let error = match outcome {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e.to_string()),
            Ok(Err(_)) => Some("render panicked".to_string()),
            Err(_) => Some(format!("render timed out after {}ms", limit.as_millis())),
        };

        match &error {
            None => tracker.record_message(),
            Some(message) => {
                let consecutive = tracker.record_error(message.clone());
                warn!(provider = %name, "Render failed ({} in a row): {}", consecutive, message);
                if consecutive >= self.config.max_consecutive_failures {
                    error!(provider = %name, "Too many consecutive render failures, marking failed");
                    tracker
                        .fail(format!("{} consecutive render failures", consecutive))
                        .await;
                }
            }
        }

        RenderResult {
            provider: name,
            error,
            elapsed: started.elapsed(),
        }
    }

    /// Include a provider in render fan-out; returns false when unknown
    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    /// Exclude a provider from render fan-out; returns false when unknown
    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.slots.lock().get(name) {
            Some(slot) => {
                slot.tracker.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Clean up every provider, each bounded by the grace period
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.slots.lock().keys().cloned().collect();
        join_all(names.iter().map(|name| self.stop_one(name))).await;
        info!("All output providers stopped");
    }

    async fn stop_one(&self, name: &str) {
        let (provider, tracker) = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(name) else {
                return;
            };
            if slot.cleaned_up {
                return;
            }
            slot.cleaned_up = true;
            (Arc::clone(&slot.provider), Arc::clone(&slot.tracker))
        };

        if !tracker.state().is_terminal() {
            tracker.transition(ProviderState::Stopping).await;
        }

        let grace = self.config.stop_grace();
        match tokio::time::timeout(grace, async { provider.lock().await.cleanup().await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracker.record_error(e.to_string());
                warn!(provider = %name, "Cleanup errored: {}", e);
            }
            Err(_) => warn!(provider = %name, "Cleanup did not finish within {:?}", grace),
        }

        tracker.transition(ProviderState::Stopped).await;
    }

    /// Replace a stopped or failed provider with a fresh instance
    pub async fn restart(&self, provider: Box<dyn OutputProvider>) -> Result<StartOutcome> {
        let name = provider.info().name;
        let state = self
            .slots
            .lock()
            .get(&name)
            .map(|slot| slot.tracker.state())
            .ok_or_else(|| MurmurError::ProviderNotFound(name.clone()))?;

        if !state.is_terminal() {
            return Err(MurmurError::provider(
                &name,
                format!("cannot restart while {}", state),
            ));
        }

        self.stop_one(&name).await;
        self.slots.lock().remove(&name);
        info!(provider = %name, "Restarting output provider");
        Ok(self.setup_one(provider).await)
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.slots.lock().keys().cloned().collect()
    }

    pub fn state(&self, name: &str) -> Option<ProviderState> {
        self.slots.lock().get(name).map(|slot| slot.tracker.state())
    }

    pub fn provider_stats(&self, name: &str) -> Option<ProviderStats> {
        self.slots.lock().get(name).map(|slot| slot.tracker.stats())
    }

    pub fn stats(&self) -> LifecycleSummary {
        let stats = self
            .slots
            .lock()
            .values()
            .map(|slot| slot.tracker.stats())
            .collect();
        LifecycleSummary::from_stats(stats)
    }
}
