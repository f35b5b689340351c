//! Structured header that prefixes every streamed turn.
//!
//! The model writes a JSON object, then the sentinel, then free text. This
//! module parses and validates that JSON object.

use serde::{Deserialize, Serialize};

use crate::error::{AuraError, Result};

/// Mood/category tag attached to a turn.
///
/// Unknown tags deserialize to [`Mood::Neutral`] so a new mood from the model
/// never breaks header parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Mood {
    #[default]
    Neutral,
    Happy,
    Sad,
    Excited,
    Calm,
    Curious,
    Playful,
    Thoughtful,
    Romantic,
    Mysterious,
}

impl Mood {
    /// Every mood, in declaration order.
    pub const ALL: [Mood; 10] = [
        Mood::Neutral,
        Mood::Happy,
        Mood::Sad,
        Mood::Excited,
        Mood::Calm,
        Mood::Curious,
        Mood::Playful,
        Mood::Thoughtful,
        Mood::Romantic,
        Mood::Mysterious,
    ];

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::Happy => "happy",
            Self::Sad => "sad",
            Self::Excited => "excited",
            Self::Calm => "calm",
            Self::Curious => "curious",
            Self::Playful => "playful",
            Self::Thoughtful => "thoughtful",
            Self::Romantic => "romantic",
            Self::Mysterious => "mysterious",
        }
    }
}

impl From<String> for Mood {
    fn from(value: String) -> Self {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(value))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Mood {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata the model emits ahead of the body text of a turn.
///
/// Invariants after [`HeaderRecord::parse`]: when `is_image_prompt` is set the
/// prompt is non-empty; when `is_code` is set both language and content are
/// non-empty; otherwise those fields are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderRecord {
    pub mood: Mood,
    pub is_image_prompt: bool,
    pub image_prompt: String,
    pub is_code: bool,
    pub code_language: String,
    pub code_content: String,
    /// Facts about the user learned during this turn, in order.
    pub new_facts: Vec<String>,
}

impl HeaderRecord {
    /// Parse and validate the header string that preceded the sentinel.
    ///
    /// Surrounding whitespace and a Markdown code fence around the JSON are
    /// tolerated.
    ///
    /// # Errors
    ///
    /// Returns [`AuraError::MalformedHeader`] when the text is not a JSON
    /// object of the expected shape or a set flag lacks its payload.
    pub fn parse(raw: &str) -> Result<Self> {
        let json = strip_code_fence(raw.trim());
        if json.is_empty() {
            return Err(AuraError::MalformedHeader("empty header".into()));
        }
        let record: Self = serde_json::from_str(json)
            .map_err(|e| AuraError::MalformedHeader(format!("invalid header JSON: {e}")))?;
        record.normalized()
    }

    /// Image prompt when an image was requested.
    pub fn image_request(&self) -> Option<&str> {
        self.is_image_prompt.then_some(self.image_prompt.as_str())
    }

    fn normalized(mut self) -> Result<Self> {
        if self.is_image_prompt {
            self.image_prompt = self.image_prompt.trim().to_owned();
            if self.image_prompt.is_empty() {
                return Err(AuraError::MalformedHeader(
                    "is_image_prompt set without image_prompt".into(),
                ));
            }
        } else {
            self.image_prompt.clear();
        }

        if self.is_code {
            if self.code_language.trim().is_empty() || self.code_content.trim().is_empty() {
                return Err(AuraError::MalformedHeader(
                    "is_code set without code_language and code_content".into(),
                ));
            }
        } else {
            self.code_language.clear();
            self.code_content.clear();
        }

        self.new_facts = self
            .new_facts
            .into_iter()
            .map(|f| f.trim().to_owned())
            .filter(|f| !f.is_empty())
            .collect();
        Ok(self)
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
