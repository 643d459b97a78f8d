//! Shared core services handed to every component

use crate::cache::{CacheConfig, DataCache};
use crate::events::{BusConfig, EventBus};
use crate::Result;
use std::sync::Arc;

/// The event bus and data cache, built once at startup
///
/// Cloning is cheap; every clone points at the same bus and cache.
#[derive(Clone, Debug)]
pub struct CoreContext {
    pub bus: Arc<EventBus>,
    pub cache: Arc<DataCache>,
}

impl CoreContext {
    /// Build a context with the core event catalog registered
    pub fn new(bus: BusConfig, cache: CacheConfig) -> Result<Self> {
        Ok(Self {
            bus: Arc::new(EventBus::with_catalog(bus)?),
            cache: Arc::new(DataCache::new(cache)),
        })
    }

    pub fn from_parts(bus: Arc<EventBus>, cache: Arc<DataCache>) -> Self {
        Self { bus, cache }
    }
}

impl Default for CoreContext {
    fn default() -> Self {
        Self {
            bus: Arc::new(EventBus::default()),
            cache: Arc::new(DataCache::new(CacheConfig::default())),
        }
    }
}
