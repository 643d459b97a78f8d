//! Orchestration core for a media-integration assistant
//!
//! Producers (chat, game, voice sources) feed raw data in, a single active
//! decision backend replies, and renderers (speech, captions, avatar
//! control) receive the resulting render parameters concurrently.
//!
//! - [`events`]: typed publish/subscribe bus with priority ordering and
//!   per-handler failure isolation
//! - [`cache`]: TTL/LRU cache so large payloads travel by [`messages::DataRef`]
//! - [`pipeline`]: ordered text stages with per-stage timeout and error policy
//! - [`providers`]: concurrent lifecycle management for inputs and outputs
//! - [`decision`]: hot-swappable decision router and reply interpretation
//! - [`integration`]: configuration and the [`Orchestrator`] wiring it all up

pub mod cache;
pub mod context;
pub mod decision;
pub mod error;
pub mod events;
pub mod integration;
pub mod messages;
pub mod pipeline;
pub mod providers;
pub mod utils;

pub use context::CoreContext;
pub use error::{MurmurError, Result};
pub use integration::{MurmurConfig, Orchestrator, OrchestratorEvent};
