//! Text pipeline between normalization and canonicalization
//!
//! Each stage carries its own priority, timeout and error policy, so a strict
//! filter and a best-effort enrichment can share one chain.

pub mod content_filter;
pub mod manager;
pub mod normalize;
pub mod rate_limit;
pub mod stage;

pub use content_filter::{ContentFilterConfig, ContentFilterStage, CONTENT_FILTER_STAGE};
pub use manager::{
    MessageDropped, PipelineConfig, PipelineManager, PipelineOutcome, PipelineStats, StageStats,
};
pub use normalize::{normalize, DATA_TYPE_KEY, SIZE_KEY};
pub use rate_limit::{RateLimitConfig, RateLimitStage, RATE_LIMIT_STAGE};
pub use stage::{ErrorPolicy, StageConfig, StageOutcome, TextStage};
