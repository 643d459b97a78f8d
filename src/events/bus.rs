//! Typed publish/subscribe event bus
//!
//! Handlers for an event name run one after another in ascending priority
//! order. With `isolate_errors` set (the default) a failing or panicking
//! handler is logged and counted and the remaining handlers still run.
//!
//! ```text
//! emit(name, payload, source)
//!   ├─ validate name + payload type + payload
//!   ├─ snapshot subscribers (registry lock released)
//!   ├─ handler p=10 ──► ok / error / panic (caught)
//!   ├─ handler p=20 ──► ...
//!   └─ counters + history ──► DispatchReport
//! ```

use super::names::validate_event_name;
use super::payloads::EventPayload;
use crate::messages::BoundedHistory;
use crate::{MurmurError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Configuration for the event bus
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Number of recent dispatches kept for introspection
    pub history_size: usize,

    /// Per-handler time limit; `0` disables it
    pub handler_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_size: 100,
            handler_timeout_ms: 30_000,
        }
    }
}

impl BusConfig {
    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }

    pub fn with_handler_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.handler_timeout_ms = timeout_ms;
        self
    }

    fn handler_timeout(&self) -> Option<Duration> {
        (self.handler_timeout_ms > 0).then(|| Duration::from_millis(self.handler_timeout_ms))
    }
}

/// Options for a subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Lower runs earlier
    pub priority: i32,
    /// Keep dispatching to later handlers when this one fails
    pub isolate_errors: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            priority: 100,
            isolate_errors: true,
        }
    }
}

impl SubscribeOptions {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    /// Abort the dispatch when this handler fails
    pub fn propagate_errors(mut self) -> Self {
        self.isolate_errors = false;
        self
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// An event as delivered to a handler
#[derive(Debug)]
pub struct Event<P> {
    pub name: String,
    pub source: String,
    pub payload: Arc<P>,
    pub emitted_at: DateTime<Utc>,
    /// Bus-wide emission sequence number
    pub sequence: u64,
}

impl<P> Clone for Event<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            source: self.source.clone(),
            payload: Arc::clone(&self.payload),
            emitted_at: self.emitted_at,
            sequence: self.sequence,
        }
    }
}

/// A typed event handler
#[async_trait]
pub trait EventHandler<P: EventPayload>: Send + Sync + 'static {
    /// Identity used in logs and dispatch reports
    fn name(&self) -> &str;

    async fn handle(&self, event: Event<P>) -> Result<()>;
}

/// Adapter turning a closure into an [`EventHandler`]
struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<P, F, Fut> EventHandler<P> for FnHandler<F>
where
    P: EventPayload,
    F: Fn(Event<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: Event<P>) -> Result<()> {
        (self.f)(event).await
    }
}

/// Type-erased event as stored by the bus
struct ErasedEvent {
    name: String,
    source: String,
    payload: Arc<dyn Any + Send + Sync>,
    emitted_at: DateTime<Utc>,
    sequence: u64,
}

type ErasedHandler = Arc<dyn Fn(ErasedEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler_name: String,
    priority: i32,
    isolate_errors: bool,
    call: ErasedHandler,
}

#[derive(Clone, Copy, Debug)]
struct PayloadSchema {
    type_id: TypeId,
    type_name: &'static str,
}

impl PayloadSchema {
    fn of<P: EventPayload>() -> Self {
        Self {
            type_id: TypeId::of::<P>(),
            type_name: std::any::type_name::<P>(),
        }
    }
}

/// Per-event-name counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EventCounters {
    pub emitted: u64,
    pub handled_ok: u64,
    pub handled_error: u64,
}

/// One handler failure within a dispatch
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HandlerFailure {
    pub handler: String,
    pub priority: i32,
    pub message: String,
}

/// Outcome of one `emit`
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DispatchReport {
    pub event: String,
    pub source: String,
    pub sequence: u64,
    /// Subscribers at the time of emission
    pub handlers: usize,
    pub handled_ok: usize,
    pub handled_error: usize,
    /// Handlers not run because a non-isolated handler failed first
    pub skipped: usize,
    pub failures: Vec<HandlerFailure>,
    pub elapsed: Duration,
    pub emitted_at: DateTime<Utc>,
}

impl DispatchReport {
    /// Every handler ran and succeeded
    pub fn is_clean(&self) -> bool {
        self.handled_error == 0 && self.skipped == 0
    }
}

/// Typed publish/subscribe router
pub struct EventBus {
    config: BusConfig,
    subscriptions: RwLock<HashMap<String, Vec<Arc<Subscription>>>>,
    schemas: RwLock<HashMap<String, PayloadSchema>>,
    counters: Mutex<HashMap<String, EventCounters>>,
    history: BoundedHistory<DispatchReport>,
    next_subscription: AtomicU64,
    next_sequence: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("events", &self.schemas.read().len())
            .finish()
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let history = BoundedHistory::new(config.history_size);
        Self {
            config,
            subscriptions: RwLock::new(HashMap::new()),
            schemas: RwLock::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            history,
            next_subscription: AtomicU64::new(1),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Create a bus with the core flow events pre-registered
    pub fn with_catalog(config: BusConfig) -> Result<Self> {
        use super::names;
        use crate::messages::{CanonicalMessage, Intent, RawData, RenderParameters};

        let bus = Self::new(config);
        bus.register_event::<RawData>(names::RAW_DATA_GENERATED)?;
        bus.register_event::<CanonicalMessage>(names::MESSAGE_READY)?;
        bus.register_event::<Intent>(names::INTENT_GENERATED)?;
        bus.register_event::<RenderParameters>(names::PARAMETERS_GENERATED)?;
        Ok(bus)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Bind an event name to a payload type
    ///
    /// Re-registering the same type is a no-op; a different type is a
    /// [`MurmurError::PayloadMismatch`].
    pub fn register_event<P: EventPayload>(&self, event_name: &str) -> Result<()> {
        validate_event_name(event_name)?;
        self.check_schema::<P>(event_name)
    }

    /// Check the payload type against the registered one, registering on first use
    fn check_schema<P: EventPayload>(&self, event_name: &str) -> Result<()> {
        let wanted = PayloadSchema::of::<P>();

        if let Some(existing) = self.schemas.read().get(event_name) {
            return Self::compare_schema(event_name, existing, &wanted);
        }

        let mut schemas = self.schemas.write();
        let existing = schemas.entry(event_name.to_string()).or_insert(wanted);
        Self::compare_schema(event_name, existing, &wanted)
    }

    fn compare_schema(event_name: &str, existing: &PayloadSchema, wanted: &PayloadSchema) -> Result<()> {
        if existing.type_id == wanted.type_id {
            Ok(())
        } else {
            Err(MurmurError::PayloadMismatch {
                event: event_name.to_string(),
                expected: existing.type_name.to_string(),
                found: wanted.type_name.to_string(),
            })
        }
    }

    /// Register a handler for an event name
    pub fn subscribe<P, H>(
        &self,
        event_name: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId>
    where
        P: EventPayload,
        H: EventHandler<P>,
    {
        validate_event_name(event_name)?;
        self.check_schema::<P>(event_name)?;

        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let handler_name = handler.name().to_string();
        let handler = Arc::new(handler);
        let expected = std::any::type_name::<P>();

        let call: ErasedHandler = Arc::new(move |event: ErasedEvent| {
            let handler = Arc::clone(&handler);
            async move {
                let ErasedEvent {
                    name,
                    source,
                    payload,
                    emitted_at,
                    sequence,
                } = event;
                let payload = payload.downcast::<P>().map_err(|_| MurmurError::PayloadMismatch {
                    event: name.clone(),
                    expected: expected.to_string(),
                    found: "<erased>".to_string(),
                })?;
                handler
                    .handle(Event {
                        name,
                        source,
                        payload,
                        emitted_at,
                        sequence,
                    })
                    .await
            }
            .boxed()
        });

        let subscription = Arc::new(Subscription {
            id,
            handler_name: handler_name.clone(),
            priority: options.priority,
            isolate_errors: options.isolate_errors,
            call,
        });

        let mut subscriptions = self.subscriptions.write();
        let list = subscriptions.entry(event_name.to_string()).or_default();
        // Equal priorities keep subscription order
        let position = list.partition_point(|s| s.priority <= options.priority);
        list.insert(position, subscription);

        debug!(
            event = event_name,
            handler = %handler_name,
            priority = options.priority,
            "Subscribed handler"
        );
        Ok(id)
    }

    /// Register a closure as a handler
    pub fn subscribe_fn<P, F, Fut>(
        &self,
        event_name: &str,
        handler_name: impl Into<String>,
        options: SubscribeOptions,
        f: F,
    ) -> Result<SubscriptionId>
    where
        P: EventPayload,
        F: Fn(Event<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe::<P, _>(
            event_name,
            FnHandler {
                name: handler_name.into(),
                f,
            },
            options,
        )
    }

    /// Remove a handler; returns whether it was subscribed
    pub fn unsubscribe(&self, event_name: &str, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let Some(list) = subscriptions.get_mut(event_name) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscriptions.remove(event_name);
        }
        removed
    }

    /// Publish an event and run every subscribed handler
    ///
    /// Fails fast, before any handler runs, on a malformed name, a payload
    /// type that does not match the registered one, or a payload that fails
    /// its own validation. Returns [`MurmurError::Dispatch`] only when a
    /// handler subscribed without error isolation fails.
    pub async fn emit<P: EventPayload>(
        &self,
        event_name: &str,
        payload: P,
        source: &str,
    ) -> Result<DispatchReport> {
        validate_event_name(event_name)?;
        self.check_schema::<P>(event_name)?;
        payload
            .validate()
            .map_err(|message| MurmurError::InvalidPayload {
                event: event_name.to_string(),
                message,
            })?;

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let emitted_at = Utc::now();
        let started = Instant::now();

        // Snapshot so handlers may (un)subscribe while we dispatch
        let handlers: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .get(event_name)
            .cloned()
            .unwrap_or_default();

        self.counters
            .lock()
            .entry(event_name.to_string())
            .or_default()
            .emitted += 1;

        let payload: Arc<dyn Any + Send + Sync> = Arc::new(payload);
        let mut report = DispatchReport {
            event: event_name.to_string(),
            source: source.to_string(),
            sequence,
            handlers: handlers.len(),
            handled_ok: 0,
            handled_error: 0,
            skipped: 0,
            failures: Vec::new(),
            elapsed: Duration::ZERO,
            emitted_at,
        };
        let mut propagated: Option<MurmurError> = None;

        for (index, subscription) in handlers.iter().enumerate() {
            let event = ErasedEvent {
                name: event_name.to_string(),
                source: source.to_string(),
                payload: Arc::clone(&payload),
                emitted_at,
                sequence,
            };

            match self.invoke(subscription, event).await {
                Ok(()) => report.handled_ok += 1,
                Err(message) => {
                    error!(
                        event = event_name,
                        handler = %subscription.handler_name,
                        priority = subscription.priority,
                        "Event handler failed: {}",
                        message
                    );
                    report.handled_error += 1;
                    report.failures.push(HandlerFailure {
                        handler: subscription.handler_name.clone(),
                        priority: subscription.priority,
                        message: message.clone(),
                    });

                    if !subscription.isolate_errors {
                        report.skipped = handlers.len() - index - 1;
                        propagated = Some(MurmurError::Dispatch {
                            event: event_name.to_string(),
                            handler: subscription.handler_name.clone(),
                            message,
                        });
                        break;
                    }
                }
            }

            // Hand-off point between handlers
            tokio::task::yield_now().await;
        }

        report.elapsed = started.elapsed();
        {
            let mut counters = self.counters.lock();
            let entry = counters.entry(event_name.to_string()).or_default();
            entry.handled_ok += report.handled_ok as u64;
            entry.handled_error += report.handled_error as u64;
        }
        self.history.push(report.clone());

        if report.handlers == 0 {
            debug!(event = event_name, source, "Event emitted with no subscribers");
        }

        match propagated {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Run one handler, turning errors, panics and timeouts into a message
    async fn invoke(&self, subscription: &Subscription, event: ErasedEvent) -> std::result::Result<(), String> {
        let call = AssertUnwindSafe((subscription.call)(event)).catch_unwind();

        let outcome = match self.config.handler_timeout() {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        handler = %subscription.handler_name,
                        "Event handler exceeded {}ms",
                        limit.as_millis()
                    );
                    return Err(format!("timed out after {}ms", limit.as_millis()));
                }
            },
            None => call.await,
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
        }
    }

    /// Counters for one event name
    pub fn counters(&self, event_name: &str) -> Option<EventCounters> {
        self.counters.lock().get(event_name).copied()
    }

    /// Counters for every event name seen so far
    pub fn all_counters(&self) -> HashMap<String, EventCounters> {
        self.counters.lock().clone()
    }

    /// Recent dispatches, oldest first
    pub fn history(&self) -> Vec<DispatchReport> {
        self.history.get_all()
    }

    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.subscriptions
            .read()
            .get(event_name)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Registered event names, sorted
    pub fn registered_events(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.read().keys().cloned().collect();
        names.sort();
        names
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
