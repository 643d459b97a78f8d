//! Event bus and the catalog of core events

pub mod bus;
pub mod names;
pub mod payloads;

pub use bus::{
    BusConfig, DispatchReport, Event, EventBus, EventCounters, EventHandler, HandlerFailure,
    SubscribeOptions, SubscriptionId,
};
pub use payloads::EventPayload;
