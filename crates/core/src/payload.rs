use serde_json::Value;
use thiserror::Error;

use crate::attachments::{classify_attachments, ClassifiedAttachments};
use crate::message::extract_message;

/// Errors raised while reading the ClickUp webhook envelope.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid JSON in raw body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload.data block is missing")]
    MissingEventData,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Chat message extracted from a ClickUp automation webhook.
#[derive(Debug, Clone, PartialEq)]
pub struct ClickUpMessage {
    pub message_id: String,
    pub user_id: String,
    /// Sanitized message text; never the raw comment content.
    pub text: String,
    pub attachments: ClassifiedAttachments,
}

impl ClickUpMessage {
    /// Parses the raw request body.
    ///
    /// The envelope is `{"payload": {"data": {...}}}`. `id` and `userid` may be
    /// strings or numbers; `text_content` and `comment` are optional.
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        let value: Value = serde_json::from_str(raw)?;
        let data = value
            .get("payload")
            .and_then(|payload| payload.get("data"))
            .filter(|data| data.is_object())
            .ok_or(PayloadError::MissingEventData)?;

        let message_id = identifier(data.get("id")).ok_or(PayloadError::MissingField("id"))?;
        let user_id = identifier(data.get("userid")).ok_or(PayloadError::MissingField("userid"))?;
        let text = extract_message(
            data.get("text_content")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        );
        let blocks = data
            .get("comment")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        Ok(Self {
            message_id,
            user_id,
            text,
            attachments: classify_attachments(blocks),
        })
    }
}

/// Best-effort message id lookup used when logging raw deliveries.
pub fn peek_message_id(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw).ok()?;
    identifier(value.get("payload")?.get("data")?.get("id"))
}

fn identifier(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
