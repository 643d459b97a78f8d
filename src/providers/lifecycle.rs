//! Provider states, transitions and per-provider bookkeeping
//!
//! ```text
//! Created ─► Starting ─► Running ─► Stopping ─► Stopped
//!               │           │           │          ▲
//!               └───────────┴───────────┴─► Failed ┘
//! ```
//!
//! `Stopped` and `Failed` are terminal until an explicit restart.

use crate::events::{names, EventBus, EventPayload};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lifecycle timing and failure settings shared by both managers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Per-provider start deadline
    pub start_timeout_secs: u64,
    /// Cooperative shutdown window before tasks are aborted
    pub stop_grace_ms: u64,
    /// Per-render deadline on the output side
    pub render_timeout_ms: u64,
    /// Consecutive render failures before an output provider is marked failed
    pub max_consecutive_failures: u32,
    /// Raw payloads larger than this are placed in the data cache
    pub inline_threshold_bytes: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            start_timeout_secs: 10,
            stop_grace_ms: 5000,
            render_timeout_ms: 5000,
            max_consecutive_failures: 3,
            inline_threshold_bytes: 64 * 1024,
        }
    }
}

impl LifecycleConfig {
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_render_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.render_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    pub fn with_inline_threshold(mut self, bytes: usize) -> Self {
        self.inline_threshold_bytes = bytes;
        self
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.start_timeout_secs == 0 {
            return Err("lifecycle.start_timeout_secs must be greater than zero".to_string());
        }
        if self.stop_grace_ms == 0 {
            return Err("lifecycle.stop_grace_ms must be greater than zero".to_string());
        }
        if self.render_timeout_ms == 0 {
            return Err("lifecycle.render_timeout_ms must be greater than zero".to_string());
        }
        if self.max_consecutive_failures == 0 {
            return Err("lifecycle.max_consecutive_failures must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Which manager owns a provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Input,
    Output,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Input => write!(f, "input"),
            ProviderKind::Output => write!(f, "output"),
        }
    }
}

/// Provider lifecycle state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    #[default]
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ProviderState {
    /// Check whether `self -> next` is an allowed transition
    pub fn can_transition_to(&self, next: ProviderState) -> bool {
        use ProviderState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Created, Stopped)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Failed, Stopped)
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProviderState::Running)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ProviderState::Failed)
    }

    /// Stopped or failed; only a restart leaves these
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderState::Stopped | ProviderState::Failed)
    }
}

impl std::fmt::Display for ProviderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderState::Created => write!(f, "created"),
            ProviderState::Starting => write!(f, "starting"),
            ProviderState::Running => write!(f, "running"),
            ProviderState::Stopping => write!(f, "stopping"),
            ProviderState::Stopped => write!(f, "stopped"),
            ProviderState::Failed => write!(f, "failed"),
        }
    }
}

/// Payload of `provider.state.changed`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStateChanged {
    pub provider: String,
    pub kind: ProviderKind,
    pub from: ProviderState,
    pub to: ProviderState,
    pub error: Option<String>,
}

impl EventPayload for ProviderStateChanged {
    fn validate(&self) -> std::result::Result<(), String> {
        if !self.from.can_transition_to(self.to) {
            return Err(format!("illegal transition {} -> {}", self.from, self.to));
        }
        Ok(())
    }
}

/// Point-in-time statistics for one provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStats {
    pub name: String,
    pub kind: ProviderKind,
    pub state: ProviderState,
    pub enabled: bool,
    /// Time spent running since the last start
    pub uptime: Duration,
    pub started_at: Option<DateTime<Utc>>,
    /// Items produced (input) or renders completed (output)
    pub messages: u64,
    pub errors: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Aggregate over all providers of one manager
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LifecycleSummary {
    pub total: usize,
    pub running: usize,
    pub failed: usize,
    pub stopped: usize,
    pub messages: u64,
    pub errors: u64,
    pub providers: Vec<ProviderStats>,
}

impl LifecycleSummary {
    pub fn from_stats(providers: Vec<ProviderStats>) -> Self {
        let mut summary = Self {
            total: providers.len(),
            ..Default::default()
        };
        for stats in &providers {
            match stats.state {
                ProviderState::Running => summary.running += 1,
                ProviderState::Failed => summary.failed += 1,
                ProviderState::Stopped => summary.stopped += 1,
                _ => {}
            }
            summary.messages += stats.messages;
            summary.errors += stats.errors;
        }
        summary.providers = providers;
        summary
    }

    pub fn state_of(&self, name: &str) -> Option<ProviderState> {
        self.providers.iter().find(|p| p.name == name).map(|p| p.state)
    }
}

/// Outcome of starting one provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartOutcome {
    pub name: String,
    pub state: ProviderState,
    pub error: Option<String>,
}

/// Outcomes of a `start_all`, one per provider
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StartReport {
    pub outcomes: Vec<StartOutcome>,
}

impl StartReport {
    pub fn state_of(&self, name: &str) -> Option<ProviderState> {
        self.outcomes.iter().find(|o| o.name == name).map(|o| o.state)
    }

    pub fn running(&self) -> usize {
        self.outcomes.iter().filter(|o| o.state.is_running()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.state.is_failed()).count()
    }
}

#[derive(Debug)]
struct Status {
    state: ProviderState,
    enabled: bool,
    running_since: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    messages: u64,
    errors: u64,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// State and counters for one provider, shared with its task
///
/// State changes are published as `provider.state.changed` on the bus.
#[derive(Debug)]
pub struct LifecycleTracker {
    name: String,
    kind: ProviderKind,
    status: Mutex<Status>,
    bus: Option<Arc<EventBus>>,
}

impl LifecycleTracker {
    pub fn new(name: impl Into<String>, kind: ProviderKind, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            name: name.into(),
            kind,
            status: Mutex::new(Status {
                state: ProviderState::Created,
                enabled: true,
                running_since: None,
                started_at: None,
                messages: 0,
                errors: 0,
                consecutive_failures: 0,
                last_error: None,
            }),
            bus,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProviderState {
        self.status.lock().state
    }

    /// Move to `next`; illegal transitions are logged and ignored
    pub async fn transition(&self, next: ProviderState) -> bool {
        self.transition_with(next, None).await
    }

    /// Move to `Failed`, recording the error
    pub async fn fail(&self, error: impl Into<String>) -> bool {
        let error = error.into();
        {
            let mut status = self.status.lock();
            status.errors += 1;
            status.last_error = Some(error.clone());
        }
        self.transition_with(ProviderState::Failed, Some(error)).await
    }

    async fn transition_with(&self, next: ProviderState, error: Option<String>) -> bool {
        let from = {
            let mut status = self.status.lock();
            let from = status.state;
            if from == next {
                return false;
            }
            if !from.can_transition_to(next) {
                warn!(
                    provider = %self.name,
                    "Ignoring illegal transition {} -> {}",
                    from,
                    next
                );
                return false;
            }
            status.state = next;
            match next {
                ProviderState::Running => {
                    status.running_since = Some(Instant::now());
                    status.started_at = Some(Utc::now());
                }
                ProviderState::Stopped | ProviderState::Failed => status.running_since = None,
                _ => {}
            }
            from
        };

        debug!(provider = %self.name, kind = %self.kind, "State {} -> {}", from, next);

        if let Some(bus) = &self.bus {
            let payload = ProviderStateChanged {
                provider: self.name.clone(),
                kind: self.kind,
                from,
                to: next,
                error,
            };
            if let Err(e) = bus.emit(names::PROVIDER_STATE_CHANGED, payload, &self.name).await {
                warn!(provider = %self.name, "Failed to publish state change: {}", e);
            }
        }
        true
    }

    pub fn record_message(&self) {
        let mut status = self.status.lock();
        status.messages += 1;
        status.consecutive_failures = 0;
    }

    /// Count an error without changing state; returns the consecutive failure count
    pub fn record_error(&self, error: impl Into<String>) -> u32 {
        let mut status = self.status.lock();
        status.errors += 1;
        status.consecutive_failures += 1;
        status.last_error = Some(error.into());
        status.consecutive_failures
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.status.lock().enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.status.lock().enabled
    }

    pub fn stats(&self) -> ProviderStats {
        let status = self.status.lock();
        ProviderStats {
            name: self.name.clone(),
            kind: self.kind,
            state: status.state,
            enabled: status.enabled,
            uptime: status.running_since.map(|t| t.elapsed()).unwrap_or_default(),
            started_at: status.started_at,
            messages: status.messages,
            errors: status.errors,
            consecutive_failures: status.consecutive_failures,
            last_error: status.last_error.clone(),
        }
    }
}
