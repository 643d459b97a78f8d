use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Free-form key/value metadata carried alongside every message
pub type Metadata = serde_json::Map<String, Value>;

/// Opaque handle to a payload held by the data cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataRef(String);

impl DataRef {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload carried by raw input or stored in the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Content {
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
    Empty,
}

impl Content {
    /// Approximate size in bytes, used for cache accounting and inlining decisions
    pub fn size(&self) -> usize {
        match self {
            Content::Text(text) => text.len(),
            Content::Bytes(bytes) => bytes.len(),
            Content::Json(value) => serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0),
            Content::Empty => 0,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Content::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(text) => text.is_empty(),
            Content::Bytes(bytes) => bytes.is_empty(),
            Content::Json(value) => value.is_null(),
            Content::Empty => true,
        }
    }

    /// Short tag naming the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Content::Text(_) => "text",
            Content::Bytes(_) => "bytes",
            Content::Json(_) => "json",
            Content::Empty => "empty",
        }
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

impl From<Vec<u8>> for Content {
    fn from(bytes: Vec<u8>) -> Self {
        Content::Bytes(bytes)
    }
}

impl From<Value> for Content {
    fn from(value: Value) -> Self {
        Content::Json(value)
    }
}

/// Input exactly as an input provider produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawData {
    pub content: Content,
    /// Producer identifier, usually the provider name
    pub source: String,
    /// Semantic tag such as `text`, `gift`, `audio`
    pub data_type: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
    /// Set when the original payload was moved into the data cache
    pub data_ref: Option<DataRef>,
}

impl RawData {
    pub fn new(
        content: impl Into<Content>,
        source: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            data_type: data_type.into(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
            data_ref: None,
        }
    }

    /// Plain text input
    pub fn text(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(Content::Text(text.into()), source, "text")
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_data_ref(mut self, data_ref: DataRef) -> Self {
        self.data_ref = Some(data_ref);
        self
    }
}

/// Text produced by normalizing a [`RawData`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedText {
    pub text: String,
    pub metadata: Metadata,
    pub data_ref: Option<DataRef>,
}

impl NormalizedText {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Metadata::new(),
            data_ref: None,
        }
    }
}

/// The stable message shape consumed by the decision router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub text: String,
    pub source: String,
    pub metadata: Metadata,
    pub data_ref: Option<DataRef>,
    pub timestamp: DateTime<Utc>,
}

impl CanonicalMessage {
    pub fn new(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: source.into(),
            metadata: Metadata::new(),
            data_ref: None,
            timestamp: Utc::now(),
        }
    }

    /// Build from pipeline output, carrying metadata and data ref forward
    pub fn from_normalized(normalized: NormalizedText, source: impl Into<String>) -> Self {
        Self {
            text: normalized.text,
            source: source.into(),
            metadata: normalized.metadata,
            data_ref: normalized.data_ref,
            timestamp: Utc::now(),
        }
    }
}

/// Emotion detected in a decision reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    #[default]
    Neutral,
    Happy,
    Sad,
    Angry,
    Surprised,
    Shy,
    Excited,
    Confused,
}

impl Emotion {
    pub const ALL: [Emotion; 8] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Surprised,
        Emotion::Shy,
        Emotion::Excited,
        Emotion::Confused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Angry => "angry",
            Emotion::Surprised => "surprised",
            Emotion::Shy => "shy",
            Emotion::Excited => "excited",
            Emotion::Confused => "confused",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Emotion::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == needle)
            .ok_or_else(|| format!("unknown emotion '{}'", s))
    }
}

/// Kind of an intent action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Trigger a named hotkey on the avatar/stream software
    Hotkey,
    /// Set a named expression
    Expression,
    /// Play a named motion
    Motion,
    /// Show an emoji/sticker
    Emoji,
    Custom(String),
}

impl ActionKind {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "hotkey" => ActionKind::Hotkey,
            "expression" => ActionKind::Expression,
            "motion" => ActionKind::Motion,
            "emoji" => ActionKind::Emoji,
            other => ActionKind::Custom(other.to_string()),
        }
    }
}

/// One typed action requested by the decision backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAction {
    pub kind: ActionKind,
    pub target: String,
    pub params: Metadata,
}

impl IntentAction {
    pub fn new(kind: ActionKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            params: Metadata::new(),
        }
    }
}

/// Interpreted decision reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub original_text: String,
    pub emotion: Emotion,
    pub response_text: String,
    pub actions: Vec<IntentAction>,
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl Intent {
    pub fn new(original_text: impl Into<String>, response_text: impl Into<String>) -> Self {
        Self {
            original_text: original_text.into(),
            emotion: Emotion::Neutral,
            response_text: response_text.into(),
            actions: Vec::new(),
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_emotion(mut self, emotion: Emotion) -> Self {
        self.emotion = emotion;
        self
    }

    pub fn with_action(mut self, action: IntentAction) -> Self {
        self.actions.push(action);
        self
    }
}

/// Output-side contract every renderer receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderParameters {
    pub tts_text: String,
    pub subtitle_text: String,
    /// Named expression channels, values in `0.0..=1.0`
    pub expressions: BTreeMap<String, f32>,
    pub hotkeys: Vec<String>,
    pub actions: Vec<IntentAction>,
    pub tts_enabled: bool,
    pub subtitle_enabled: bool,
    pub expressions_enabled: bool,
    pub hotkeys_enabled: bool,
    pub actions_enabled: bool,
    /// Lower renders first when a renderer queues work
    pub priority: i32,
    pub timestamp: DateTime<Utc>,
}

impl Default for RenderParameters {
    fn default() -> Self {
        Self {
            tts_text: String::new(),
            subtitle_text: String::new(),
            expressions: BTreeMap::new(),
            hotkeys: Vec::new(),
            actions: Vec::new(),
            tts_enabled: true,
            subtitle_enabled: true,
            expressions_enabled: true,
            hotkeys_enabled: true,
            actions_enabled: true,
            priority: 100,
            timestamp: Utc::now(),
        }
    }
}

impl RenderParameters {
    /// Speak and caption the same text
    pub fn speech(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            tts_text: text.clone(),
            subtitle_text: text,
            ..Default::default()
        }
    }

    /// Check if any channel has something to render
    pub fn has_content(&self) -> bool {
        (self.tts_enabled && !self.tts_text.is_empty())
            || (self.subtitle_enabled && !self.subtitle_text.is_empty())
            || (self.expressions_enabled && !self.expressions.is_empty())
            || (self.hotkeys_enabled && !self.hotkeys.is_empty())
            || (self.actions_enabled && !self.actions.is_empty())
    }
}

/// Immutable metadata every provider exposes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub supported_data_types: Vec<String>,
    pub author: String,
}

impl ProviderInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "0.1.0".to_string(),
            description: String::new(),
            supported_data_types: Vec::new(),
            author: String::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_data_types(mut self, types: &[&str]) -> Self {
        self.supported_data_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_size() {
        assert_eq!(Content::from("abc").size(), 3);
        assert_eq!(Content::Bytes(vec![0; 10]).size(), 10);
        assert_eq!(Content::Empty.size(), 0);
        assert!(Content::Json(serde_json::json!({"a": 1})).size() > 0);
    }

    #[test]
    fn test_emotion_parse() {
        assert_eq!("Happy".parse::<Emotion>(), Ok(Emotion::Happy));
        assert_eq!(" sad ".parse::<Emotion>(), Ok(Emotion::Sad));
        assert!("grumpy".parse::<Emotion>().is_err());
    }

    #[test]
    fn test_action_kind_parse() {
        assert_eq!(ActionKind::parse("HOTKEY"), ActionKind::Hotkey);
        assert_eq!(ActionKind::parse("wave"), ActionKind::Custom("wave".into()));
    }

    #[test]
    fn test_canonical_carries_ref() {
        let mut normalized = NormalizedText::new("hello");
        normalized.data_ref = Some(DataRef::new("abc123"));
        let msg = CanonicalMessage::from_normalized(normalized, "console");
        assert_eq!(msg.data_ref, Some(DataRef::new("abc123")));
        assert_eq!(msg.source, "console");
    }

    #[test]
    fn test_render_parameters_has_content() {
        let mut params = RenderParameters::speech("hi");
        assert!(params.has_content());
        params.tts_enabled = false;
        params.subtitle_enabled = false;
        assert!(!params.has_content());
    }
}
