//! Intent parser for interpreting decision replies
//!
//! Replies may carry inline markers:
//! - `[happy]` sets the emotion (first recognized tag wins)
//! - `{hotkey:wave}` / `{motion:nod}` / `{emoji}` add actions in order
//!
//! Markers are removed from the spoken text. Brackets that do not form a
//! recognized marker are kept verbatim.

use super::backend::DecisionReply;
use crate::messages::{ActionKind, CanonicalMessage, Emotion, Intent, IntentAction};
use serde_json::Value;

/// Parser turning a decision reply into an [`Intent`]
#[derive(Clone, Debug, Default)]
pub struct IntentParser;

impl IntentParser {
    pub fn new() -> Self {
        Self
    }

    /// Build the intent for `message` from the backend's `reply`
    pub fn parse(&self, message: &CanonicalMessage, reply: &DecisionReply) -> Intent {
        let parsed = self.parse_text(&reply.text);

        let mut intent = Intent::new(message.text.clone(), parsed.text).with_emotion(parsed.emotion);
        intent.actions = parsed.actions;
        intent.metadata = reply.metadata.clone();
        intent
            .metadata
            .insert("backend".to_string(), Value::from(reply.backend.clone()));
        intent
            .metadata
            .insert("source".to_string(), Value::from(message.source.clone()));
        intent
    }

    /// Strip markers from `text`, collecting emotion and actions
    pub fn parse_text(&self, text: &str) -> ParsedReply {
        let mut emotion: Option<Emotion> = None;
        let mut actions = Vec::new();
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(pos) = rest.find(|c: char| c == '[' || c == '{') {
            out.push_str(&rest[..pos]);
            let open = rest.as_bytes()[pos] as char;
            let close = if open == '[' { ']' } else { '}' };
            let after = &rest[pos + 1..];

            let Some(end) = after.find(close) else {
                // Unclosed marker, keep the remainder as text
                out.push_str(&rest[pos..]);
                rest = "";
                break;
            };
            let inner = &after[..end];
            let consumed = pos + 1 + end + 1;

            let recognized = if open == '[' {
                match inner.parse::<Emotion>() {
                    Ok(found) => {
                        emotion.get_or_insert(found);
                        true
                    }
                    Err(_) => false,
                }
            } else {
                match parse_action(inner) {
                    Some(action) => {
                        actions.push(action);
                        true
                    }
                    None => false,
                }
            };

            if !recognized {
                out.push_str(&rest[pos..consumed]);
            }
            rest = &rest[consumed..];
        }
        out.push_str(rest);

        ParsedReply {
            text: out.split_whitespace().collect::<Vec<_>>().join(" "),
            emotion: emotion.unwrap_or_default(),
            actions,
        }
    }
}

/// Parse `kind:target` or a bare `kind`
fn parse_action(inner: &str) -> Option<IntentAction> {
    let inner = inner.trim();
    if inner.is_empty() || (inner.contains(char::is_whitespace) && !inner.contains(':')) {
        return None;
    }
    let (kind, target) = match inner.split_once(':') {
        Some((kind, target)) => (kind.trim(), target.trim()),
        None => (inner, ""),
    };
    if kind.is_empty() || !kind.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some(IntentAction::new(ActionKind::parse(kind), target))
}

/// Reply text with markers removed
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedReply {
    pub text: String,
    pub emotion: Emotion,
    pub actions: Vec<IntentAction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emotion_and_actions() {
        let parser = IntentParser::new();
        let parsed = parser.parse_text("[happy] Thanks for the gift! {hotkey:wave} {emoji:heart}");

        assert_eq!(parsed.text, "Thanks for the gift!");
        assert_eq!(parsed.emotion, Emotion::Happy);
        assert_eq!(parsed.actions.len(), 2);
        assert_eq!(parsed.actions[0].kind, ActionKind::Hotkey);
        assert_eq!(parsed.actions[0].target, "wave");
        assert_eq!(parsed.actions[1].kind, ActionKind::Emoji);
    }

    #[test]
    fn test_first_emotion_wins() {
        let parsed = IntentParser::new().parse_text("[Sad] oh no [angry]");
        assert_eq!(parsed.emotion, Emotion::Sad);
        assert_eq!(parsed.text, "oh no");
    }

    #[test]
    fn test_unknown_markers_kept() {
        let parsed = IntentParser::new().parse_text("see [note 1] and {not an action} [x");
        assert_eq!(parsed.text, "see [note 1] and {not an action} [x");
        assert_eq!(parsed.emotion, Emotion::Neutral);
        assert!(parsed.actions.is_empty());
    }

    #[test]
    fn test_custom_action_kind() {
        let parsed = IntentParser::new().parse_text("{dance}");
        assert_eq!(parsed.text, "");
        assert_eq!(parsed.actions[0].kind, ActionKind::Custom("dance".to_string()));
    }

    #[test]
    fn test_parse_builds_intent() {
        let message = CanonicalMessage::new("hello", "chat");
        let reply = DecisionReply::new("[excited] Hi! {motion:jump}", "rules");
        let intent = IntentParser::new().parse(&message, &reply);

        assert_eq!(intent.original_text, "hello");
        assert_eq!(intent.response_text, "Hi!");
        assert_eq!(intent.emotion, Emotion::Excited);
        assert_eq!(intent.metadata["backend"], Value::from("rules"));
    }
}
