//! Decision layer: backend contract, hot-swappable router and reply interpretation

pub mod backend;
pub mod intent;
pub mod router;
pub mod rules;

pub use backend::{BackendFactory, DecisionBackend, DecisionReply};
pub use intent::{IntentParser, ParsedReply};
pub use router::{ActiveBackendInfo, BackendSwitched, DecisionRouter, RouterConfig, RouterStats};
pub use rules::{Rule, RuleBackend, RuleConfig};
