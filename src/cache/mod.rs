//! Data cache
//!
//! Lets large or optional payloads (images, audio, original untransformed
//! input) travel through the event bus as a [`DataRef`](crate::messages::DataRef)
//! instead of being copied into every event.

pub mod config;
pub mod store;

pub use config::{CacheConfig, EvictionPolicy};
pub use store::{CacheEntry, CacheStats, DataCache, Tags};
