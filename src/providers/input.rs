//! Input provider contract and its lifecycle manager
//!
//! Each running provider gets its own task that pulls from the provider's
//! stream and publishes every item as `perception.raw_data.generated`.
//! Payloads above the inline threshold are placed in the data cache and the
//! event carries the ref.

use super::lifecycle::{
    LifecycleConfig, LifecycleSummary, LifecycleTracker, ProviderKind, ProviderState,
    ProviderStats, StartOutcome, StartReport,
};
use crate::cache::Tags;
use crate::context::CoreContext;
use crate::events::names;
use crate::messages::{Content, ProviderInfo, RawData};
use crate::pipeline::SIZE_KEY;
use crate::{MurmurError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{Stream, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lazy, unbounded sequence of raw data produced by an input provider
pub type RawDataStream = Pin<Box<dyn Stream<Item = Result<RawData>> + Send>>;

/// A source of raw data (chat, game, voice, ...)
///
/// The stream returned by `start` runs until `stop` is called or the source
/// ends. A provider is not restartable; restarting means a fresh instance.
#[async_trait]
pub trait InputProvider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn start(&mut self) -> Result<RawDataStream>;

    /// Ask the source to end its stream
    async fn stop(&mut self) -> Result<()>;

    /// Release resources; called once after the provider has stopped or failed
    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

type SharedInput = Arc<tokio::sync::Mutex<Box<dyn InputProvider>>>;

struct InputSlot {
    provider: SharedInput,
    tracker: Arc<LifecycleTracker>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    cleaned_up: bool,
}

/// Owns the input providers and their run tasks
pub struct InputProviderManager {
    ctx: CoreContext,
    config: LifecycleConfig,
    slots: Mutex<BTreeMap<String, InputSlot>>,
}

impl InputProviderManager {
    pub fn new(ctx: CoreContext, config: LifecycleConfig) -> Self {
        Self {
            ctx,
            config,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    /// Start every provider concurrently and wait for all start outcomes
    ///
    /// A provider that fails or times out is marked failed and cleaned up
    /// at stop; its siblings are unaffected. Names already managed are
    /// rejected.
    pub async fn start_all(&self, providers: Vec<Box<dyn InputProvider>>) -> StartReport {
        let starts = providers.into_iter().map(|provider| self.start_one(provider));
        let outcomes = join_all(starts).await;

        let report = StartReport { outcomes };
        info!(
            "Input providers started: {} running, {} failed",
            report.running(),
            report.failed()
        );
        report
    }

    async fn start_one(&self, provider: Box<dyn InputProvider>) -> StartOutcome {
        let name = provider.info().name;
        let tracker = Arc::new(LifecycleTracker::new(
            name.clone(),
            ProviderKind::Input,
            Some(Arc::clone(&self.ctx.bus)),
        ));
        let shared: SharedInput = Arc::new(tokio::sync::Mutex::new(provider));

        {
            let mut slots = self.slots.lock();
            if slots.contains_key(&name) {
                warn!(provider = %name, "Input provider already registered");
                return StartOutcome {
                    name: name.clone(),
                    state: slots[&name].tracker.state(),
                    error: Some(format!("input provider '{}' already registered", name)),
                };
            }
            slots.insert(
                name.clone(),
                InputSlot {
                    provider: Arc::clone(&shared),
                    tracker: Arc::clone(&tracker),
                    cancel: CancellationToken::new(),
                    task: None,
                    cleaned_up: false,
                },
            );
        }

        tracker.transition(ProviderState::Starting).await;
        let started = {
            let mut provider = shared.lock().await;
            let start = AssertUnwindSafe(provider.start()).catch_unwind();
            tokio::time::timeout(self.config.start_timeout(), start).await
        };

        let stream = match started {
            Ok(Ok(Ok(stream))) => stream,
            Ok(Ok(Err(e))) => return self.start_failed(&name, &tracker, e.to_string()).await,
            Ok(Err(_)) => {
                return self
                    .start_failed(&name, &tracker, "start panicked".to_string())
                    .await
            }
            Err(_) => {
                let message = format!("start timed out after {}s", self.config.start_timeout_secs);
                return self.start_failed(&name, &tracker, message).await;
            }
        };

        tracker.transition(ProviderState::Running).await;
        info!(provider = %name, "Input provider running");

        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&name) {
            let task = tokio::spawn(run_provider(
                name.clone(),
                stream,
                Arc::clone(&tracker),
                slot.cancel.clone(),
                self.ctx.clone(),
                self.config.inline_threshold_bytes,
            ));
            slot.task = Some(task);
        }

        StartOutcome {
            name,
            state: tracker.state(),
            error: None,
        }
    }

    async fn start_failed(
        &self,
        name: &str,
        tracker: &LifecycleTracker,
        message: String,
    ) -> StartOutcome {
        error!(provider = %name, "Input provider failed to start: {}", message);
        tracker.fail(message.clone()).await;
        StartOutcome {
            name: name.to_string(),
            state: tracker.state(),
            error: Some(message),
        }
    }

    /// Stop every provider: signal, wait out the grace period, then abort
    ///
    /// Each provider instance is stopped and cleaned up at most once.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.slots.lock().keys().cloned().collect();
        join_all(names.iter().map(|name| self.stop_one(name))).await;
        info!("All input providers stopped");
    }

    /// Stop one provider; returns false when it is not managed
    pub async fn stop(&self, name: &str) -> bool {
        if !self.slots.lock().contains_key(name) {
            return false;
        }
        self.stop_one(name).await;
        true
    }

    async fn stop_one(&self, name: &str) {
        let (provider, tracker, cancel, task) = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(name) else {
                return;
            };
            if slot.cleaned_up {
                return;
            }
            slot.cleaned_up = true;
            (
                Arc::clone(&slot.provider),
                Arc::clone(&slot.tracker),
                slot.cancel.clone(),
                slot.task.take(),
            )
        };

        if !tracker.state().is_terminal() {
            tracker.transition(ProviderState::Stopping).await;
        }

        let grace = self.config.stop_grace();
        let stopped = tokio::time::timeout(grace, async {
            if let Err(e) = provider.lock().await.stop().await {
                warn!(provider = %name, "Stop request errored: {}", e);
            }
        })
        .await;
        if stopped.is_err() {
            warn!(provider = %name, "Stop request did not return within grace period");
        }
        cancel.cancel();

        if let Some(mut task) = task {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!(provider = %name, "Run task did not exit within {:?}, aborting", grace);
                task.abort();
                let _ = task.await;
            }
        }

        match tokio::time::timeout(grace, async { provider.lock().await.cleanup().await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracker.record_error(e.to_string());
                warn!(provider = %name, "Cleanup errored: {}", e);
            }
            Err(_) => warn!(provider = %name, "Cleanup timed out"),
        }

        tracker.transition(ProviderState::Stopped).await;
        debug!(provider = %name, "Input provider stopped");
    }

    /// Replace a stopped or failed provider with a fresh instance and start it
    pub async fn restart(&self, provider: Box<dyn InputProvider>) -> Result<StartOutcome> {
        let name = provider.info().name;
        let state = self
            .slots
            .lock()
            .get(&name)
            .map(|slot| slot.tracker.state())
            .ok_or_else(|| MurmurError::ProviderNotFound(name.clone()))?;

        if state.is_failed() {
            self.stop_one(&name).await;
        } else if !state.is_terminal() {
            return Err(MurmurError::provider(
                &name,
                format!("cannot restart while {}", state),
            ));
        }

        self.slots.lock().remove(&name);
        info!(provider = %name, "Restarting input provider");
        Ok(self.start_one(provider).await)
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

/// Per-provider run loop; failures and panics stop here
async fn run_provider(
    name: String,
    stream: RawDataStream,
    tracker: Arc<LifecycleTracker>,
    cancel: CancellationToken,
    ctx: CoreContext,
    inline_threshold: usize,
) {
    let run = AssertUnwindSafe(pump(&name, stream, &tracker, &cancel, &ctx, inline_threshold));
    if run.catch_unwind().await.is_err() {
        error!(provider = %name, "Input provider panicked");
        tracker.fail("run loop panicked").await;
    }
}

async fn pump(
    name: &str,
    mut stream: RawDataStream,
    tracker: &LifecycleTracker,
    cancel: &CancellationToken,
    ctx: &CoreContext,
    inline_threshold: usize,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(provider = %name, "Run loop cancelled");
                return;
            }
            item = stream.next() => item,
        };

        match item {
            Some(Ok(raw)) => {
                tracker.record_message();
                let raw = offload(raw, ctx, inline_threshold);
                if let Err(e) = ctx.bus.emit(names::RAW_DATA_GENERATED, raw, name).await {
                    tracker.record_error(e.to_string());
                    warn!(provider = %name, "Failed to publish raw data: {}", e);
                }
            }
            Some(Err(e)) => {
                error!(provider = %name, "Input provider failed: {}", e);
                tracker.fail(e.to_string()).await;
                return;
            }
            None => {
                if !cancel.is_cancelled() {
                    info!(provider = %name, "Input stream ended");
                    tracker.transition(ProviderState::Stopping).await;
                    tracker.transition(ProviderState::Stopped).await;
                }
                return;
            }
        }
    }
}

/// Move a large payload into the cache and reference it from the event
///
/// Binary payloads are replaced by the ref; text and JSON stay inline for
/// normalization and the ref keeps the untransformed original.
fn offload(mut raw: RawData, ctx: &CoreContext, inline_threshold: usize) -> RawData {
    let size = raw.content.size();
    if raw.data_ref.is_some() || size <= inline_threshold {
        return raw;
    }

    let tags: Tags = [
        ("source".to_string(), raw.source.clone()),
        ("data_type".to_string(), raw.data_type.clone()),
    ]
    .into_iter()
    .collect();

    match ctx.cache.store(raw.content.clone(), None, Some(tags)) {
        Ok(data_ref) => {
            // Binary payloads travel by ref only; text stays inline
            if matches!(raw.content, Content::Bytes(_)) {
                raw.content = Content::Empty;
            }
            raw.metadata.insert(SIZE_KEY.to_string(), size.into());
            raw.data_ref = Some(data_ref);
        }
        Err(e) => warn!(source = %raw.source, "Could not cache {} byte payload: {}", size, e),
    }
    raw
}
