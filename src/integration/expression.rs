//! Maps an [`Intent`] to the [`RenderParameters`] every renderer receives

use crate::messages::{ActionKind, Emotion, Intent, RenderParameters};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Mapping settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpressionConfig {
    /// Scale applied to every emotion channel, `0.0..=1.0`
    pub intensity: f32,

    /// Hotkey fired when a reply carries the emotion, keyed by emotion name
    pub emotion_hotkeys: BTreeMap<String, String>,
}

impl Default for ExpressionConfig {
    fn default() -> Self {
        Self {
            intensity: 1.0,
            emotion_hotkeys: BTreeMap::new(),
        }
    }
}

impl ExpressionConfig {
    pub fn with_intensity(mut self, intensity: f32) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_emotion_hotkey(mut self, emotion: Emotion, hotkey: impl Into<String>) -> Self {
        self.emotion_hotkeys
            .insert(emotion.as_str().to_string(), hotkey.into());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.intensity) {
            return Err(format!(
                "expressions.intensity must be within 0.0..=1.0, got {}",
                self.intensity
            ));
        }
        for emotion in self.emotion_hotkeys.keys() {
            emotion.parse::<Emotion>()?;
        }
        Ok(())
    }
}

/// Expression channels driven by each emotion
fn channels(emotion: Emotion) -> &'static [(&'static str, f32)] {
    match emotion {
        Emotion::Neutral => &[],
        Emotion::Happy => &[("mouth_smile", 1.0), ("eye_smile", 0.6)],
        Emotion::Sad => &[("brow_down", 0.8), ("mouth_frown", 0.7)],
        Emotion::Angry => &[("brow_angry", 1.0), ("mouth_frown", 0.5)],
        Emotion::Surprised => &[("eye_wide", 1.0), ("mouth_open", 0.8)],
        Emotion::Shy => &[("cheek_blush", 1.0), ("eye_smile", 0.3)],
        Emotion::Excited => &[("mouth_smile", 1.0), ("eye_wide", 0.7)],
        Emotion::Confused => &[("brow_raise", 0.8), ("head_tilt", 0.5)],
    }
}

/// Intent to render-parameter mapper
#[derive(Clone, Debug, Default)]
pub struct ExpressionMapper {
    config: ExpressionConfig,
}

impl ExpressionMapper {
    pub fn new(config: ExpressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExpressionConfig {
        &self.config
    }

    pub fn map(&self, intent: &Intent) -> RenderParameters {
        let mut params = RenderParameters::speech(intent.response_text.clone());

        for (channel, value) in channels(intent.emotion) {
            params
                .expressions
                .insert((*channel).to_string(), (value * self.config.intensity).clamp(0.0, 1.0));
        }
        if let Some(hotkey) = self.config.emotion_hotkeys.get(intent.emotion.as_str()) {
            params.hotkeys.push(hotkey.clone());
        }

        for action in &intent.actions {
            match &action.kind {
                ActionKind::Hotkey if !action.target.is_empty() => {
                    params.hotkeys.push(action.target.clone());
                }
                ActionKind::Expression if !action.target.is_empty() => {
                    let value = action
                        .params
                        .get("value")
                        .and_then(Value::as_f64)
                        .unwrap_or(1.0) as f32;
                    params
                        .expressions
                        .insert(action.target.clone(), value.clamp(0.0, 1.0));
                }
                _ => params.actions.push(action.clone()),
            }
        }

        if let Some(priority) = intent.metadata.get("priority").and_then(Value::as_i64) {
            params.priority = priority as i32;
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::IntentAction;

    #[test]
    fn test_emotion_drives_channels() {
        let mapper = ExpressionMapper::default();
        let intent = Intent::new("hi", "Hello!").with_emotion(Emotion::Happy);
        let params = mapper.map(&intent);

        assert_eq!(params.tts_text, "Hello!");
        assert_eq!(params.subtitle_text, "Hello!");
        assert_eq!(params.expressions["mouth_smile"], 1.0);
        assert!(params.hotkeys.is_empty());
    }

    #[test]
    fn test_intensity_scales_channels() {
        let mapper = ExpressionMapper::new(ExpressionConfig::default().with_intensity(0.5));
        let params = mapper.map(&Intent::new("", "ok").with_emotion(Emotion::Happy));
        assert_eq!(params.expressions["mouth_smile"], 0.5);
        assert_eq!(params.expressions["eye_smile"], 0.3);
    }

    #[test]
    fn test_actions_split_by_kind() {
        let mut blink = IntentAction::new(ActionKind::Expression, "blink");
        blink.params.insert("value".to_string(), Value::from(0.25));
        let intent = Intent::new("", "Sure")
            .with_action(IntentAction::new(ActionKind::Hotkey, "wave"))
            .with_action(blink)
            .with_action(IntentAction::new(ActionKind::Motion, "nod"));

        let mapper = ExpressionMapper::new(
            ExpressionConfig::default().with_emotion_hotkey(Emotion::Neutral, "idle"),
        );
        let params = mapper.map(&intent);

        assert_eq!(params.hotkeys, vec!["idle", "wave"]);
        assert_eq!(params.expressions["blink"], 0.25);
        assert_eq!(params.actions.len(), 1);
        assert_eq!(params.actions[0].kind, ActionKind::Motion);
    }

    #[test]
    fn test_priority_from_metadata() {
        let mut intent = Intent::new("", "urgent");
        intent.metadata.insert("priority".to_string(), Value::from(5));
        assert_eq!(ExpressionMapper::default().map(&intent).priority, 5);
    }

    #[test]
    fn test_validate() {
        assert!(ExpressionConfig::default().validate().is_ok());
        assert!(ExpressionConfig::default().with_intensity(1.5).validate().is_err());

        let mut config = ExpressionConfig::default();
        config.emotion_hotkeys.insert("grumpy".into(), "x".into());
        assert!(config.validate().is_err());
    }
}
