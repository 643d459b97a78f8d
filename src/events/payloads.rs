//! Payload records carried by the event bus
//!
//! Every event name is bound to exactly one payload type. A payload also
//! validates itself so a malformed emission fails at `emit`.

use crate::messages::{CanonicalMessage, Intent, RawData, RenderParameters};
use std::any::Any;
use std::fmt::Debug;

/// A record that can be published on the bus
pub trait EventPayload: Any + Send + Sync + Debug {
    /// Reject malformed payloads before any handler sees them
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl EventPayload for RawData {
    fn validate(&self) -> Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("raw data source is empty".to_string());
        }
        if self.data_type.trim().is_empty() {
            return Err("raw data type is empty".to_string());
        }
        Ok(())
    }
}

impl EventPayload for CanonicalMessage {
    fn validate(&self) -> Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("message source is empty".to_string());
        }
        Ok(())
    }
}

impl EventPayload for Intent {}

impl EventPayload for RenderParameters {
    fn validate(&self) -> Result<(), String> {
        match self.expressions.iter().find(|(_, v)| !v.is_finite()) {
            Some((name, value)) => Err(format!("expression '{}' is not finite: {}", name, value)),
            None => Ok(()),
        }
    }
}
