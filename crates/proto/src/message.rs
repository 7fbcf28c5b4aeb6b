use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instruction message.
    System,
    /// Message authored by an end user (or injected corrective instruction).
    User,
    /// Message authored by the model.
    Assistant,
    /// Tool execution result message.
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(crate::error::ProtoError::InvalidRole(other.to_string())),
        }
    }
}

/// How strictly the agent must back its answer with tool evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    /// Answer must be a three-section report backed by tool calls.
    Strict,
    /// Free-form answers; tools only when the question needs evidence.
    #[default]
    Loose,
}

impl std::fmt::Display for ChatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatMode::Strict => write!(f, "strict"),
            ChatMode::Loose => write!(f, "loose"),
        }
    }
}

impl std::str::FromStr for ChatMode {
    type Err = crate::error::ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(ChatMode::Strict),
            "loose" | "plain" => Ok(ChatMode::Loose),
            other => Err(crate::error::ProtoError::InvalidMode(other.to_string())),
        }
    }
}

/// A tool invocation requested by the model.
///
/// `arguments` is kept as the raw JSON text the model produced; it is only
/// parsed at dispatch time. On the wire the call uses the OpenAI shape
/// `{"id", "type": "function", "function": {"name", "arguments"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireToolCall", into = "WireToolCall")]
pub struct ToolCall {
    /// Call identifier echoed back by the matching tool message.
    pub id: String,
    /// Tool name as advertised by the catalog.
    pub name: String,
    /// Raw JSON argument text.
    pub arguments: String,
}

impl ToolCall {
    /// Creates a tool call from its parts.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parses the argument text into a JSON object.
    ///
    /// Empty text is treated as `{}`. Text that is not a JSON object yields
    /// `{"_parse_error": "..."}` so validation reports it as an undefined
    /// parameter instead of silently calling the tool without arguments.
    pub fn parsed_arguments(&self) -> Value {
        let raw = self.arguments.trim();
        if raw.is_empty() {
            return Value::Object(Default::default());
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(_) => serde_json::json!({"_parse_error": "arguments must be a JSON object"}),
            Err(e) => serde_json::json!({"_parse_error": e.to_string()}),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default, deserialize_with = "null_as_default")]
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunction,
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    #[serde(default, deserialize_with = "null_as_default")]
    name: String,
    #[serde(default, deserialize_with = "arguments_as_text")]
    arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

impl From<WireToolCall> for ToolCall {
    fn from(wire: WireToolCall) -> Self {
        Self {
            id: wire.id,
            name: wire.function.name,
            arguments: wire.function.arguments,
        }
    }
}

impl From<ToolCall> for WireToolCall {
    fn from(call: ToolCall) -> Self {
        Self {
            id: call.id,
            kind: function_kind(),
            function: WireFunction {
                name: call.name,
                arguments: call.arguments,
            },
        }
    }
}

/// One entry in the conversation log.
///
/// Serialized in the OpenAI chat-completions message shape, tagged by `role`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    /// System prompt; always message 0 of a log.
    System {
        #[serde(default, deserialize_with = "null_as_default")]
        content: String,
    },
    /// User question or injected corrective instruction.
    User {
        #[serde(default, deserialize_with = "null_as_default")]
        content: String,
    },
    /// Model turn, optionally requesting tool calls.
    Assistant {
        #[serde(default, deserialize_with = "null_as_default")]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning_content: Option<String>,
        #[serde(
            default,
            skip_serializing_if = "Vec::is_empty",
            deserialize_with = "null_as_default"
        )]
        tool_calls: Vec<ToolCall>,
    },
    /// Result of one tool call.
    Tool {
        #[serde(default, deserialize_with = "null_as_default")]
        tool_call_id: String,
        #[serde(default, deserialize_with = "null_as_default")]
        content: String,
    },
}

impl Message {
    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    /// Creates a plain assistant message without reasoning or tool calls.
    pub fn assistant(content: impl Into<String>) -> Self {
        Message::Assistant {
            content: content.into(),
            reasoning_content: None,
            tool_calls: Vec::new(),
        }
    }

    /// Creates an assistant message that requests tool calls.
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Message::Assistant {
            content: content.into(),
            reasoning_content: None,
            tool_calls,
        }
    }

    /// Creates a tool-result message answering `tool_call_id`.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }

    /// Returns the role of this message.
    pub fn role(&self) -> Role {
        match self {
            Message::System { .. } => Role::System,
            Message::User { .. } => Role::User,
            Message::Assistant { .. } => Role::Assistant,
            Message::Tool { .. } => Role::Tool,
        }
    }

    /// Returns the text content.
    pub fn content(&self) -> &str {
        match self {
            Message::System { content }
            | Message::User { content }
            | Message::Assistant { content, .. }
            | Message::Tool { content, .. } => content,
        }
    }

    /// Returns the requested tool calls (empty for non-assistant messages).
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Message::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// Whether this is an assistant message with at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls().is_empty()
    }

    /// Whether this is a tool-result message.
    pub fn is_tool(&self) -> bool {
        matches!(self, Message::Tool { .. })
    }

    /// Character count of the compact JSON serialization.
    ///
    /// This is the unit every context budget is measured in.
    pub fn serialized_len(&self) -> usize {
        match serde_json::to_string(self) {
            Ok(json) => json.chars().count(),
            Err(_) => self.content().chars().count(),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn arguments_as_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}
