//! Input and output provider lifecycle management

pub mod builtin;
pub mod input;
pub mod lifecycle;
pub mod output;
pub mod registry;

pub use builtin::{ChannelInput, ConsoleInput, LogOutput};
pub use input::{InputProvider, InputProviderManager, RawDataStream};
pub use lifecycle::{
    LifecycleConfig, LifecycleSummary, LifecycleTracker, ProviderKind, ProviderState,
    ProviderStateChanged, ProviderStats, StartOutcome, StartReport,
};
pub use output::{OutputProvider, OutputProviderManager, RenderReport, RenderResult};
pub use registry::{InputFactory, OutputFactory, ProviderRegistry};
