//! Whole-log session snapshots used for save/resume.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;
use crate::message::{Message, Role};

/// Serializable conversation state: the full log plus the active models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Model used for conversation turns.
    pub model: String,
    /// Model used for the closing summary turn.
    pub summary_model: String,
    /// Conversation log, message 0 is the system prompt.
    pub messages: Vec<Message>,
}

impl SessionSnapshot {
    /// Parses a snapshot from untrusted JSON.
    ///
    /// The payload is rejected as a whole when `messages` is not a
    /// non-empty list of well-formed message objects starting with a system
    /// message. Missing model fields become empty strings so the caller can
    /// keep its current models.
    pub fn from_value(value: &Value) -> Result<Self, SessionError> {
        let text_field = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default()
                .to_string()
        };
        let list = value
            .get("messages")
            .and_then(Value::as_array)
            .ok_or(SessionError::NotAList)?;
        if list.is_empty() {
            return Err(SessionError::Empty);
        }

        let mut messages = Vec::with_capacity(list.len());
        for (index, entry) in list.iter().enumerate() {
            if !entry.is_object() {
                return Err(SessionError::InvalidEntry {
                    index,
                    reason: "not an object".to_string(),
                });
            }
            let msg: Message =
                serde_json::from_value(entry.clone()).map_err(|e| SessionError::InvalidEntry {
                    index,
                    reason: e.to_string(),
                })?;
            messages.push(msg);
        }
        if messages[0].role() != Role::System {
            return Err(SessionError::MissingSystem);
        }

        Ok(Self {
            model: text_field("model"),
            summary_model: text_field("summary_model"),
            messages,
        })
    }

    /// Parses a snapshot from JSON text.
    pub fn from_json(text: &str) -> Result<Self, SessionError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| SessionError::Serialization(e.to_string()))?;
        Self::from_value(&value)
    }

    /// Pretty JSON for session files.
    pub fn to_json_pretty(&self) -> Result<String, SessionError> {
        serde_json::to_string_pretty(self).map_err(|e| SessionError::Serialization(e.to_string()))
    }
}
