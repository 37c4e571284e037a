//! Structural and semantic validation of the `/sendMessage` body.

use serde_json::Value;

use crate::error::ValidationError;

/// Messages longer than this (in characters) are flagged, not rejected.
pub const OVERSIZED_MESSAGE_CHARS: usize = 5000;
/// The model only ever sees this many characters of a message.
pub const MODEL_INPUT_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedMessage {
    /// Trimmed message as stored and logged.
    pub message: String,
    /// `message` cut to `MODEL_INPUT_CHARS` for the model call.
    pub model_input: String,
    pub conversation_id: Option<String>,
    /// Character count when the message exceeds `OVERSIZED_MESSAGE_CHARS`.
    pub oversized: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestValidator {
    oversized_chars: usize,
    model_input_chars: usize,
}

impl Default for RequestValidator {
    fn default() -> Self {
        Self {
            oversized_chars: OVERSIZED_MESSAGE_CHARS,
            model_input_chars: MODEL_INPUT_CHARS,
        }
    }
}

impl RequestValidator {
    pub fn validate(
        &self,
        raw_body: &[u8],
        content_type: Option<&str>,
    ) -> Result<ValidatedMessage, ValidationError> {
        check_content_type(content_type)?;
        let body: Value =
            serde_json::from_slice(raw_body).map_err(|_| ValidationError::MalformedJson)?;

        let message = body
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or(ValidationError::EmptyMessage)?;
        let conversation_id = body
            .get("conversation_id")
            .and_then(|c| c.as_str())
            .map(str::to_owned);

        let chars = message.chars().count();
        Ok(ValidatedMessage {
            message: message.to_owned(),
            model_input: truncate_chars(message, self.model_input_chars).to_owned(),
            conversation_id,
            oversized: (chars > self.oversized_chars).then_some(chars),
        })
    }
}

/// Accepts `application/json` and `application/*+json`, with or without
/// parameters such as `charset`.
fn check_content_type(content_type: Option<&str>) -> Result<(), ValidationError> {
    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .ok_or(ValidationError::UnsupportedMediaType)?;
    if essence == "application/json"
        || (essence.starts_with("application/") && essence.ends_with("+json"))
    {
        Ok(())
    } else {
        Err(ValidationError::UnsupportedMediaType)
    }
}

/// Longest prefix of `text` holding at most `max` characters.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
