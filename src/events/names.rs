//! Event name catalog
//!
//! Names follow `{domain}.{noun}.{verb-or-state}` so cross-domain flow can be
//! audited from the name alone.

use crate::{MurmurError, Result};

/// An input provider produced a [`RawData`](crate::messages::RawData)
pub const RAW_DATA_GENERATED: &str = "perception.raw_data.generated";

/// A [`CanonicalMessage`](crate::messages::CanonicalMessage) passed the pipeline
pub const MESSAGE_READY: &str = "perception.message.ready";

/// The pipeline dropped a message
pub const MESSAGE_DROPPED: &str = "pipeline.message.dropped";

/// The decision reply was interpreted into an [`Intent`](crate::messages::Intent)
pub const INTENT_GENERATED: &str = "decision.intent.generated";

/// The active decision backend changed
pub const BACKEND_SWITCHED: &str = "decision.backend.switched";

/// [`RenderParameters`](crate::messages::RenderParameters) are ready for output
pub const PARAMETERS_GENERATED: &str = "output.parameters.generated";

/// A render fan-out finished
pub const RENDER_COMPLETED: &str = "output.render.completed";

/// A managed provider changed lifecycle state
pub const PROVIDER_STATE_CHANGED: &str = "provider.state.changed";

/// Check that a name has exactly three non-empty `[a-z0-9_]` segments
pub fn validate_event_name(name: &str) -> Result<()> {
    let segments: Vec<&str> = name.split('.').collect();
    let well_formed = segments.len() == 3
        && segments.iter().all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        });

    if well_formed {
        Ok(())
    } else {
        Err(MurmurError::InvalidEventName(name.to_string()))
    }
}

/// Domain segment of a valid event name
pub fn domain_of(name: &str) -> Option<&str> {
    name.split('.').next().filter(|d| !d.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_names_are_valid() {
        for name in [
            RAW_DATA_GENERATED,
            MESSAGE_READY,
            MESSAGE_DROPPED,
            INTENT_GENERATED,
            BACKEND_SWITCHED,
            PARAMETERS_GENERATED,
            RENDER_COMPLETED,
            PROVIDER_STATE_CHANGED,
        ] {
            assert!(validate_event_name(name).is_ok(), "{}", name);
        }
    }

    #[test]
    fn test_malformed_names_rejected() {
        for name in ["", "perception", "a.b", "a.b.c.d", "A.b.c", "a..c", "a.b-c.d", "a.b.c "] {
            assert!(validate_event_name(name).is_err(), "{:?}", name);
        }
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of(RAW_DATA_GENERATED), Some("perception"));
        assert_eq!(domain_of(""), None);
    }
}
