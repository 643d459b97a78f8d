//! Single-active-backend decision router with hot-swap
//!
//! Switching uses drain-then-swap: the new backend is set up first, then the
//! router waits (bounded by `drain_timeout_ms`) for every in-flight `decide`
//! to finish on the old backend before swapping. Decisions that arrive while
//! a swap is waiting queue behind it and run on the new backend. If the
//! drain does not finish in time the switch fails and the old backend stays
//! active.

use super::backend::{BackendFactory, DecisionBackend, DecisionReply};
use crate::events::{names, EventBus, EventPayload};
use crate::messages::{CanonicalMessage, ProviderInfo};
use crate::utils::{LatencySummary, TimingTracker};
use crate::{MurmurError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Router configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// How long a switch waits for in-flight decisions
    pub drain_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 5000,
        }
    }
}

impl RouterConfig {
    pub fn with_drain_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.drain_timeout_ms = timeout_ms;
        self
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.drain_timeout_ms == 0 {
            return Err("router.drain_timeout_ms must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Payload of `decision.backend.switched`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendSwitched {
    pub from: Option<String>,
    pub to: String,
    /// Time spent waiting for in-flight decisions
    pub drained_in: Duration,
}

impl EventPayload for BackendSwitched {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.to.is_empty() {
            return Err("switched-to backend has no name".to_string());
        }
        Ok(())
    }
}

/// Description of the active backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveBackendInfo {
    /// Name the backend is registered under
    pub name: String,
    pub info: ProviderInfo,
    pub activated_at: DateTime<Utc>,
}

/// Decision statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterStats {
    pub active: Option<String>,
    pub decisions: u64,
    pub failures: u64,
    pub switches: u64,
    pub failed_switches: u64,
    pub latency: LatencySummary,
}

struct ActiveBackend {
    name: String,
    backend: Box<dyn DecisionBackend>,
    info: ProviderInfo,
    activated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    decisions: u64,
    failures: u64,
    switches: u64,
    failed_switches: u64,
    timing: TimingTracker,
}

/// Holds exactly one active [`DecisionBackend`]
pub struct DecisionRouter {
    bus: Arc<EventBus>,
    config: RouterConfig,
    factories: Mutex<HashMap<String, BackendFactory>>,
    active: RwLock<Option<ActiveBackend>>,
    // Serializes switches so two never race for the write lock
    switching: tokio::sync::Mutex<()>,
    counters: Mutex<Counters>,
}

impl DecisionRouter {
    pub fn new(bus: Arc<EventBus>, config: RouterConfig) -> Self {
        Self {
            bus,
            config,
            factories: Mutex::new(HashMap::new()),
            active: RwLock::new(None),
            switching: tokio::sync::Mutex::new(()),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Register a backend constructor under a name
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn DecisionBackend> + Send + Sync + 'static,
    {
        self.register_factory(name, Arc::new(factory));
    }

    pub fn register_factory(&self, name: impl Into<String>, factory: BackendFactory) {
        let name = name.into();
        debug!(backend = %name, "Registered decision backend");
        self.factories.lock().insert(name, factory);
    }

    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Activate a backend; with one already active this is a switch
    pub async fn configure(&self, backend_name: &str, config: &Value) -> Result<()> {
        self.switch_backend(backend_name, config).await
    }

    /// Replace the active backend
    ///
    /// The new backend is constructed and set up before any waiting, so a
    /// failing setup leaves the current backend untouched. Fails with
    /// [`MurmurError::SwitchTimeout`] when in-flight decisions do not drain
    /// in time; the old backend then stays active.
    pub async fn switch_backend(&self, backend_name: &str, config: &Value) -> Result<()> {
        let _switching = self.switching.lock().await;

        let factory = self
            .factories
            .lock()
            .get(backend_name)
            .cloned()
            .ok_or_else(|| MurmurError::BackendNotFound(backend_name.to_string()))?;

        let mut backend = factory();
        backend.setup(Arc::clone(&self.bus), config).await.map_err(|e| {
            error!(backend = backend_name, "Backend setup failed: {}", e);
            e
        })?;
        let info = backend.info();

        let drain_started = Instant::now();
        let mut active = match tokio::time::timeout(self.config.drain_timeout(), self.active.write()).await {
            Ok(guard) => guard,
            Err(_) => {
                let from = self.current_name_unlocked();
                warn!(
                    backend = backend_name,
                    "In-flight decisions did not drain within {}ms, keeping current backend",
                    self.config.drain_timeout_ms
                );
                self.counters.lock().failed_switches += 1;
                if let Err(e) = backend.cleanup().await {
                    warn!(backend = backend_name, "Cleanup of rejected backend failed: {}", e);
                }
                return Err(MurmurError::SwitchTimeout {
                    from: from.unwrap_or_default(),
                    to: backend_name.to_string(),
                    timeout_ms: self.config.drain_timeout_ms,
                });
            }
        };
        let drained_in = drain_started.elapsed();

        let previous = active.replace(ActiveBackend {
            name: backend_name.to_string(),
            backend,
            info,
            activated_at: Utc::now(),
        });
        drop(active);

        let from = previous.as_ref().map(|p| p.name.clone());
        if let Some(mut previous) = previous {
            if let Err(e) = previous.backend.cleanup().await {
                warn!(backend = %previous.name, "Cleanup of previous backend failed: {}", e);
            }
        }

        self.counters.lock().switches += 1;
        info!(
            from = from.as_deref().unwrap_or("none"),
            to = backend_name,
            "Decision backend active (drained in {:?})",
            drained_in
        );

        let payload = BackendSwitched {
            from,
            to: backend_name.to_string(),
            drained_in,
        };
        if let Err(e) = self.bus.emit(names::BACKEND_SWITCHED, payload, "decision").await {
            warn!("Failed to publish backend switch: {}", e);
        }
        Ok(())
    }

    /// Best-effort name of the active backend without waiting on the lock
    fn current_name_unlocked(&self) -> Option<String> {
        self.active
            .try_read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|a| a.name.clone()))
    }

    /// Ask the active backend for a reply
    ///
    /// The call holds the backend for its whole duration, so a concurrent
    /// switch cannot swap it out from under this decision.
    pub async fn decide(&self, message: &CanonicalMessage) -> Result<DecisionReply> {
        let active = self.active.read().await;
        let active = active.as_ref().ok_or(MurmurError::NoActiveBackend)?;

        let started = Instant::now();
        let result = active.backend.decide(message).await;
        let elapsed = started.elapsed();

        let mut counters = self.counters.lock();
        counters.decisions += 1;
        counters.timing.record(elapsed);
        match result {
            Ok(mut reply) => {
                if reply.backend.is_empty() {
                    reply.backend = active.name.clone();
                }
                Ok(reply)
            }
            Err(e) => {
                counters.failures += 1;
                drop(counters);
                warn!(backend = %active.name, "Decision failed: {}", e);
                Err(match e {
                    MurmurError::Decision { .. } => e,
                    other => MurmurError::decision(&active.name, other.to_string()),
                })
            }
        }
    }

    pub async fn current_backend_info(&self) -> Option<ActiveBackendInfo> {
        self.active.read().await.as_ref().map(|a| ActiveBackendInfo {
            name: a.name.clone(),
            info: a.info.clone(),
            activated_at: a.activated_at,
        })
    }

    /// Drain and clean up the active backend, leaving none active
    pub async fn shutdown(&self) {
        let _switching = self.switching.lock().await;
        let previous = match tokio::time::timeout(self.config.drain_timeout(), self.active.write()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                warn!("In-flight decisions did not drain before shutdown");
                return;
            }
        };
        if let Some(mut previous) = previous {
            if let Err(e) = previous.backend.cleanup().await {
                warn!(backend = %previous.name, "Backend cleanup failed: {}", e);
            }
            info!(backend = %previous.name, "Decision backend shut down");
        }
    }

    pub async fn stats(&self) -> RouterStats {
        let active = self.current_backend_info().await.map(|a| a.name);
        let counters = self.counters.lock();
        RouterStats {
            active,
            decisions: counters.decisions,
            failures: counters.failures,
            switches: counters.switches,
            failed_switches: counters.failed_switches,
            latency: counters.timing.summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Replies with its own name after an optional gate
    struct Named {
        name: &'static str,
        gate: Option<Arc<Notify>>,
        cleaned: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl DecisionBackend for Named {
        fn info(&self) -> ProviderInfo {
            ProviderInfo::new(self.name)
        }

        async fn setup(&mut self, _bus: Arc<EventBus>, _config: &Value) -> Result<()> {
            Ok(())
        }

        async fn decide(&self, _message: &CanonicalMessage) -> Result<DecisionReply> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(DecisionReply::new(self.name, self.name))
        }

        async fn cleanup(&mut self) -> Result<()> {
            self.cleaned.lock().push(self.name.to_string());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl DecisionBackend for Failing {
        fn info(&self) -> ProviderInfo {
            ProviderInfo::new("failing")
        }

        async fn setup(&mut self, _bus: Arc<EventBus>, _config: &Value) -> Result<()> {
            Ok(())
        }

        async fn decide(&self, _message: &CanonicalMessage) -> Result<DecisionReply> {
            Err(MurmurError::Channel("socket closed".into()))
        }
    }

    fn router(drain_ms: u64) -> (Arc<DecisionRouter>, Arc<Notify>, Arc<Mutex<Vec<String>>>) {
        let router = Arc::new(DecisionRouter::new(
            Arc::new(EventBus::default()),
            RouterConfig::default().with_drain_timeout_ms(drain_ms),
        ));
        let gate = Arc::new(Notify::new());
        let cleaned = Arc::new(Mutex::new(Vec::new()));

        let (g, c) = (Arc::clone(&gate), Arc::clone(&cleaned));
        router.register("a", move || {
            Box::new(Named {
                name: "a",
                gate: Some(Arc::clone(&g)),
                cleaned: Arc::clone(&c),
            }) as Box<dyn DecisionBackend>
        });
        let c = Arc::clone(&cleaned);
        router.register("b", move || {
            Box::new(Named {
                name: "b",
                gate: None,
                cleaned: Arc::clone(&c),
            }) as Box<dyn DecisionBackend>
        });
        router.register("failing", || Box::new(Failing) as Box<dyn DecisionBackend>);
        (router, gate, cleaned)
    }

    fn message() -> CanonicalMessage {
        CanonicalMessage::new("hello", "console")
    }

    #[tokio::test]
    async fn test_decide_without_backend() {
        let (router, _, _) = router(100);
        let err = router.decide(&message()).await.unwrap_err();
        assert_eq!(err, MurmurError::NoActiveBackend);
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let (router, _, _) = router(100);
        let err = router.configure("missing", &Value::Null).await.unwrap_err();
        assert!(matches!(err, MurmurError::BackendNotFound(_)));
    }

    #[tokio::test]
    async fn test_switch_drains_in_flight_decision() {
        let (router, gate, cleaned) = router(5_000);
        router.configure("a", &Value::Null).await.unwrap();

        let in_flight = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.decide(&message()).await })
        };
        tokio::task::yield_now().await;

        let switch = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.switch_backend("b", &Value::Null).await })
        };
        tokio::task::yield_now().await;
        assert!(!switch.is_finished());

        gate.notify_one();
        let reply = in_flight.await.unwrap().unwrap();
        assert_eq!(reply.text, "a");
        switch.await.unwrap().unwrap();

        assert_eq!(router.current_backend_info().await.unwrap().name, "b");
        assert_eq!(router.decide(&message()).await.unwrap().text, "b");
        assert_eq!(*cleaned.lock(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_times_out_and_keeps_old_backend() {
        let (router, gate, cleaned) = router(100);
        router.configure("a", &Value::Null).await.unwrap();

        let in_flight = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.decide(&message()).await })
        };
        tokio::task::yield_now().await;

        let err = router.switch_backend("b", &Value::Null).await.unwrap_err();
        assert!(matches!(err, MurmurError::SwitchTimeout { ref from, ref to, .. } if from == "a" && to == "b"));
        // The rejected backend was cleaned up, the active one untouched
        assert_eq!(*cleaned.lock(), vec!["b".to_string()]);

        gate.notify_one();
        assert_eq!(in_flight.await.unwrap().unwrap().text, "a");
        assert_eq!(router.current_backend_info().await.unwrap().name, "a");
        assert_eq!(router.stats().await.failed_switches, 1);
    }

    #[tokio::test]
    async fn test_backend_failure_is_typed_decision_error() {
        let (router, _, _) = router(100);
        router.configure("failing", &Value::Null).await.unwrap();

        let err = router.decide(&message()).await.unwrap_err();
        assert!(matches!(err, MurmurError::Decision { ref backend, .. } if backend == "failing"));
        let stats = router.stats().await;
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.decisions, 1);
    }

    #[tokio::test]
    async fn test_switch_publishes_event() {
        let (router, _, _) = router(100);
        router.configure("b", &Value::Null).await.unwrap();
        assert_eq!(
            router.bus.counters(names::BACKEND_SWITCHED).unwrap().emitted,
            1
        );
    }
}
