pub mod perf;

pub use perf::{LatencySummary, TimingTracker};
