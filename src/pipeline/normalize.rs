//! Turning raw producer output into text

use super::rate_limit::SOURCE_KEY;
use crate::messages::{Content, NormalizedText, RawData};
use serde_json::Value;

/// Metadata key carrying the raw data type tag
pub const DATA_TYPE_KEY: &str = "data_type";

/// Metadata key carrying the size of a payload moved to the cache
pub const SIZE_KEY: &str = "size_bytes";

/// Normalize raw input into pipeline text
///
/// Text passes through trimmed. JSON objects contribute their `text` field
/// when present, otherwise their compact serialization. Binary payloads are
/// described rather than decoded, including payloads already moved to the
/// cache; the original stays reachable through the data ref.
pub fn normalize(raw: &RawData) -> NormalizedText {
    let text = match &raw.content {
        Content::Text(text) => text.trim().to_string(),
        Content::Json(Value::String(text)) => text.trim().to_string(),
        Content::Json(value) => match value.get("text").and_then(Value::as_str) {
            Some(text) => text.trim().to_string(),
            None => value.to_string(),
        },
        Content::Bytes(bytes) => format!("[{} {} bytes]", raw.data_type, bytes.len()),
        Content::Empty if raw.data_ref.is_some() => {
            match raw.metadata.get(SIZE_KEY).and_then(Value::as_u64) {
                Some(size) => format!("[{} {} bytes]", raw.data_type, size),
                None => format!("[{} payload]", raw.data_type),
            }
        }
        Content::Empty => String::new(),
    };

    let mut metadata = raw.metadata.clone();
    metadata.insert(SOURCE_KEY.to_string(), Value::from(raw.source.clone()));
    metadata.insert(DATA_TYPE_KEY.to_string(), Value::from(raw.data_type.clone()));

    NormalizedText {
        text,
        metadata,
        data_ref: raw.data_ref.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DataRef;
    use serde_json::json;

    #[test]
    fn test_text_is_trimmed_and_tagged() {
        let normalized = normalize(&RawData::text("  hi there ", "console"));
        assert_eq!(normalized.text, "hi there");
        assert_eq!(normalized.metadata[SOURCE_KEY], json!("console"));
        assert_eq!(normalized.metadata[DATA_TYPE_KEY], json!("text"));
    }

    #[test]
    fn test_json_text_field() {
        let raw = RawData::new(json!({"text": "gift!", "count": 3}), "chat", "gift");
        assert_eq!(normalize(&raw).text, "gift!");
    }

    #[test]
    fn test_bytes_keep_data_ref() {
        let raw = RawData::new(vec![0u8; 4], "mic", "audio").with_data_ref(DataRef::new("abc"));
        let normalized = normalize(&raw);
        assert_eq!(normalized.text, "[audio 4 bytes]");
        assert_eq!(normalized.data_ref, Some(DataRef::new("abc")));
    }

    #[test]
    fn test_offloaded_payload_is_described() {
        let raw = RawData::new(Content::Empty, "cam", "image")
            .with_metadata(SIZE_KEY, 2048)
            .with_data_ref(DataRef::new("img"));
        assert_eq!(normalize(&raw).text, "[image 2048 bytes]");

        let bare = RawData::new(Content::Empty, "cam", "image");
        assert_eq!(normalize(&bare).text, "");
    }
}
