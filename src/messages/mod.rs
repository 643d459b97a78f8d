pub mod history;
pub mod types;

pub use history::BoundedHistory;
pub use types::{
    ActionKind, CanonicalMessage, Content, DataRef, Emotion, Intent, IntentAction, Metadata,
    NormalizedText, ProviderInfo, RawData, RenderParameters,
};
