//! Composition root: configuration, intent-to-render mapping and the orchestrator

pub mod config;
pub mod expression;
pub mod orchestrator;

pub use config::{merge_layers, MurmurConfig, ProviderEntry, ProvidersConfig};
pub use expression::{ExpressionConfig, ExpressionMapper};
pub use orchestrator::{
    FlowOutcome, Orchestrator, OrchestratorBuilder, OrchestratorEvent, OrchestratorStats,
    StartupReport,
};
