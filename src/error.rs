//! Error types for the murmur orchestration core
//!
//! One crate-wide error enum. Each component recovers locally where it can
//! (per handler, per provider, per stage) and surfaces everything else as one
//! of these variants.

use thiserror::Error;

/// Errors produced by the orchestration core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MurmurError {
    /// A data ref was dereferenced after it expired, was evicted, or never existed
    #[error("Cache entry not found: {data_ref}")]
    CacheNotFound { data_ref: String },

    /// A store was rejected because capacity could not be freed
    #[error("Cache capacity exceeded: need {required}, limit {limit}")]
    CacheCapacity { required: usize, limit: usize },

    /// A subscribed handler failed while handling an event
    #[error("Handler '{handler}' failed on '{event}': {message}")]
    Dispatch {
        event: String,
        handler: String,
        message: String,
    },

    /// Event name does not follow `{domain}.{noun}.{state}`
    #[error("Invalid event name: {0}")]
    InvalidEventName(String),

    /// Payload type does not match the type registered for the event name
    #[error("Payload mismatch on '{event}': expected {expected}, found {found}")]
    PayloadMismatch {
        event: String,
        expected: String,
        found: String,
    },

    /// Payload failed its own validation
    #[error("Invalid payload on '{event}': {message}")]
    InvalidPayload { event: String, message: String },

    /// A pipeline stage failed under the `stop` policy
    #[error("Pipeline stage '{stage}' failed: {message}")]
    Pipeline { stage: String, message: String },

    /// A pipeline stage exceeded its timeout
    #[error("Pipeline stage '{stage}' timed out after {timeout_ms}ms")]
    StageTimeout { stage: String, timeout_ms: u64 },

    /// A single provider failed
    #[error("Provider '{provider}' error: {message}")]
    Provider { provider: String, message: String },

    /// No provider or factory is registered under the name
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// The active decision backend failed
    #[error("Decision backend '{backend}' failed: {message}")]
    Decision { backend: String, message: String },

    /// No decision backend factory registered under the name
    #[error("Decision backend not found: {0}")]
    BackendNotFound(String),

    /// `decide` was called before any backend was configured
    #[error("No active decision backend")]
    NoActiveBackend,

    /// In-flight decisions did not drain before the switch deadline
    #[error("Switching backend '{from}' -> '{to}' timed out after {timeout_ms}ms")]
    SwitchTimeout {
        from: String,
        to: String,
        timeout_ms: u64,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel closed or full
    #[error("Channel error: {0}")]
    Channel(String),

    /// File system I/O error
    #[error("IO error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for MurmurError {
    fn from(e: std::io::Error) -> Self {
        MurmurError::IOError(e.to_string())
    }
}

impl From<toml::de::Error> for MurmurError {
    fn from(e: toml::de::Error) -> Self {
        MurmurError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for MurmurError {
    fn from(e: serde_json::Error) -> Self {
        MurmurError::Config(e.to_string())
    }
}

impl MurmurError {
    /// Shorthand for a provider failure
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        MurmurError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a decision backend failure
    pub fn decision(backend: impl Into<String>, message: impl Into<String>) -> Self {
        MurmurError::Decision {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a pipeline stage failure
    pub fn pipeline(stage: impl Into<String>, message: impl Into<String>) -> Self {
        MurmurError::Pipeline {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors leave the system running with the failing unit
    /// isolated; the rest need a configuration change or an operator.
    pub fn is_recoverable(&self) -> bool {
        match self {
            MurmurError::CacheNotFound { .. } => true,
            MurmurError::CacheCapacity { .. } => true,
            MurmurError::Dispatch { .. } => true,
            // Caller bugs, retrying the same emit will fail the same way
            MurmurError::InvalidEventName(_) => false,
            MurmurError::PayloadMismatch { .. } => false,
            MurmurError::InvalidPayload { .. } => false,
            MurmurError::Pipeline { .. } => true,
            MurmurError::StageTimeout { .. } => true,
            MurmurError::Provider { .. } => true,
            MurmurError::ProviderNotFound(_) => false,
            MurmurError::Decision { .. } => true,
            MurmurError::BackendNotFound(_) => false,
            MurmurError::NoActiveBackend => false,
            MurmurError::SwitchTimeout { .. } => true,
            MurmurError::Config(_) => false,
            MurmurError::Channel(_) => false,
            MurmurError::IOError(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            MurmurError::CacheNotFound { .. } => {
                "Referenced data is no longer available.".to_string()
            }
            MurmurError::CacheCapacity { .. } => {
                "Data cache is full. Try again shortly.".to_string()
            }
            MurmurError::Dispatch { .. } => {
                "An event handler failed. Other handlers were not affected.".to_string()
            }
            MurmurError::InvalidEventName(_)
            | MurmurError::PayloadMismatch { .. }
            | MurmurError::InvalidPayload { .. } => {
                "An internal event was malformed and was rejected.".to_string()
            }
            MurmurError::Pipeline { .. } | MurmurError::StageTimeout { .. } => {
                "Message processing failed. Please try again.".to_string()
            }
            MurmurError::Provider { .. } => {
                "A connected service failed and was disabled.".to_string()
            }
            MurmurError::ProviderNotFound(_) => {
                "Unknown provider. Please check settings.".to_string()
            }
            MurmurError::Decision { .. } => {
                "Response generation failed. Please try again.".to_string()
            }
            MurmurError::BackendNotFound(_) | MurmurError::NoActiveBackend => {
                "No response backend is configured. Please check settings.".to_string()
            }
            MurmurError::SwitchTimeout { .. } => {
                "Switching response backend timed out. The previous backend is still active."
                    .to_string()
            }
            MurmurError::Config(_) => "Configuration error. Please check settings.".to_string(),
            MurmurError::Channel(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
            MurmurError::IOError(_) => "File system error occurred.".to_string(),
        }
    }
}

/// Result type alias for murmur operations
pub type Result<T> = std::result::Result<T, MurmurError>;
