//! Blocked-word filtering and length capping

use super::stage::{StageOutcome, TextStage};
use crate::messages::Metadata;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Name of the content filter stage
pub const CONTENT_FILTER_STAGE: &str = "content_filter";

/// Configuration for [`ContentFilterStage`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentFilterConfig {
    /// Words that cause the message to be dropped
    pub blocked_words: Vec<String>,
    /// Longer texts are truncated to this many characters; `0` disables it
    pub max_length: usize,
}

/// Drops messages containing blocked words and truncates long ones
pub struct ContentFilterStage {
    blocked: HashSet<String>,
    max_length: usize,
}

impl ContentFilterStage {
    pub fn new(config: ContentFilterConfig) -> Self {
        let blocked = config
            .blocked_words
            .iter()
            .map(|w| normalize_word(w))
            .filter(|w| !w.is_empty())
            .collect();
        Self {
            blocked,
            max_length: config.max_length,
        }
    }

    /// Find the first blocked word in the text
    fn blocked_word(&self, text: &str) -> Option<String> {
        text.split_whitespace()
            .map(normalize_word)
            .find(|w| self.blocked.contains(w))
    }
}

/// Lowercase and strip surrounding punctuation so `"Spam!"` matches `spam`
fn normalize_word(word: &str) -> String {
    word.to_lowercase()
        .trim_matches(|c: char| c.is_ascii_punctuation())
        .to_string()
}

#[async_trait]
impl TextStage for ContentFilterStage {
    fn name(&self) -> &str {
        CONTENT_FILTER_STAGE
    }

    async fn process(&mut self, text: String, _metadata: &Metadata) -> StageOutcome {
        if let Some(word) = self.blocked_word(&text) {
            debug!(word = %word, "Blocked word found");
            return StageOutcome::Drop {
                reason: format!("contains blocked word '{}'", word),
            };
        }

        if self.max_length > 0 && text.chars().count() > self.max_length {
            return StageOutcome::Continue(text.chars().take(self.max_length).collect());
        }

        StageOutcome::Continue(text)
    }
}
