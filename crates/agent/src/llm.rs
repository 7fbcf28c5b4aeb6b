//! Streaming chat-completions provider.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use proto::{LlmError, Message};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::decoder::StreamDelta;

const ERROR_PREVIEW_CHARS: usize = 500;

/// Boxed stream of decoded deltas for one model turn.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, LlmError>> + Send>>;

/// `tool_choice` sent with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    /// Forces a text-only answer; tool definitions are not sent.
    None,
}

impl ToolChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolChoice::Auto => "auto",
            ToolChoice::None => "none",
        }
    }
}

/// Request to the LLM
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// OpenAI `tools[]` entries.
    pub tools: Vec<Value>,
    pub tool_choice: ToolChoice,
    /// Vendor options merged into the top level of the request body.
    pub extra: Map<String, Value>,
}

/// LLM provider trait
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Starts a streamed completion.
    async fn stream_chat(&self, req: ChatRequest) -> Result<DeltaStream, LlmError>;
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    tool_choice: &'static str,
    #[serde(skip_serializing_if = "<[Value]>::is_empty")]
    tools: &'a [Value],
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// OpenAI-compatible `/chat/completions` provider with SSE streaming.
///
/// Works with any endpoint that streams `chat.completion.chunk` events,
/// including the `reasoning_content` extension.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    idle_timeout: Duration,
}

impl OpenAiCompatProvider {
    /// `timeout` bounds the connect phase and every gap between stream events.
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            idle_timeout: timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn stream_chat(&self, req: ChatRequest) -> Result<DeltaStream, LlmError> {
        let tools: &[Value] = match req.tool_choice {
            ToolChoice::Auto => &req.tools,
            ToolChoice::None => &[],
        };
        let body = CompletionBody {
            model: &req.model,
            messages: &req.messages,
            stream: true,
            tool_choice: req.tool_choice.as_str(),
            tools,
            extra: &req.extra,
        };
        let url = format!("{}/chat/completions", self.base_url);
        debug!(
            model = %req.model,
            messages = %req.messages.len(),
            tools = %tools.len(),
            tool_choice = %req.tool_choice.as_str(),
            "Sending streaming request"
        );

        let mut builder = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::Api(format!("request failed: {e}")))?;

        let status = response.status();
        debug!(status = %status.as_u16(), "Chat completions response received");
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimit);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = parse_api_error(&text);
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthRequired(detail),
                code => LlmError::Api(format!("HTTP {code}: {detail}")),
            });
        }

        let events = response.bytes_stream().eventsource();
        let idle = self.idle_timeout;
        let stream = futures_util::stream::unfold(
            (events, VecDeque::<StreamDelta>::new(), false),
            move |(mut events, mut pending, mut done)| async move {
                loop {
                    if let Some(delta) = pending.pop_front() {
                        return Some((Ok(delta), (events, pending, done)));
                    }
                    if done {
                        return None;
                    }
                    let event = match tokio::time::timeout(idle, events.next()).await {
                        Err(_) => {
                            done = true;
                            let err = LlmError::Api(format!(
                                "stream idle for more than {}s",
                                idle.as_secs()
                            ));
                            return Some((Err(err), (events, pending, done)));
                        }
                        Ok(None) => return None,
                        Ok(Some(Err(e))) => {
                            done = true;
                            let err = LlmError::Api(format!("SSE stream error: {e}"));
                            return Some((Err(err), (events, pending, done)));
                        }
                        Ok(Some(Ok(event))) => event,
                    };
                    if event.data.trim() == "[DONE]" {
                        done = true;
                        continue;
                    }
                    match parse_chunk(&event.data) {
                        Ok(deltas) => pending.extend(deltas),
                        Err(err) => {
                            done = true;
                            return Some((Err(err), (events, pending, done)));
                        }
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }
}

/// Decodes one SSE `data` payload into deltas.
fn parse_chunk(data: &str) -> Result<Vec<StreamDelta>, LlmError> {
    let json: Value = serde_json::from_str(data).map_err(|e| {
        LlmError::InvalidResponse(format!("SSE parsing error: {e}; data: {}", preview(data)))
    })?;
    if let Some(err) = json.get("error").filter(|e| !e.is_null()) {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| err.as_str())
            .unwrap_or("an error occurred during streaming");
        return Err(LlmError::Api(message.to_string()));
    }
    let chunk: Chunk = serde_json::from_value(json)
        .map_err(|e| LlmError::InvalidResponse(format!("SSE data schema error: {e}")))?;

    let mut deltas = Vec::new();
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(deltas);
    };
    if let Some(delta) = choice.delta {
        if let Some(reasoning) = delta.reasoning_content.filter(|s| !s.is_empty()) {
            deltas.push(StreamDelta::Reasoning(reasoning));
        }
        if let Some(content) = delta.content.filter(|s| !s.is_empty()) {
            deltas.push(StreamDelta::Content(content));
        }
        for call in delta.tool_calls.into_iter().flatten() {
            let (name, arguments) = call
                .function
                .map(|f| (f.name, f.arguments))
                .unwrap_or_default();
            deltas.push(StreamDelta::ToolCall {
                index: call.index.unwrap_or(0),
                id: call.id,
                name,
                arguments,
            });
        }
    }
    if let Some(reason) = choice.finish_reason.filter(|s| !s.is_empty()) {
        deltas.push(StreamDelta::Finish(reason));
    }
    Ok(deltas)
}

/// Extracts `error.message` from an error body, else a preview of the body.
fn parse_api_error(body: &str) -> String {
    let message = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        v.get("error")
            .and_then(|e| e.get("message").and_then(Value::as_str).or_else(|| e.as_str()))
            .map(str::to_string)
    });
    match message {
        Some(m) => m,
        None => {
            let text = preview(body);
            if text.is_empty() {
                "empty response body".to_string()
            } else {
                text
            }
        }
    }
}

fn preview(text: &str) -> String {
    text.trim().chars().take(ERROR_PREVIEW_CHARS).collect()
}

/// Vendor-specific request options.
///
/// DashScope gets `enable_search` when search is on; DeepSeek gets the
/// `thinking` switch when thinking is on and the model is not the dedicated
/// reasoner.
pub fn vendor_extra_options(
    base_url: &str,
    model: &str,
    enable_search: bool,
    enable_thinking: bool,
) -> Map<String, Value> {
    let mut extra = Map::new();
    let host = reqwest::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_default();
    if enable_search && host == "dashscope.aliyuncs.com" {
        extra.insert("enable_search".to_string(), Value::Bool(true));
    }
    if enable_thinking && host == "api.deepseek.com" && model.trim() != "deepseek-reasoner" {
        extra.insert("thinking".to_string(), serde_json::json!({"type": "enabled"}));
    }
    if !extra.is_empty() {
        debug!(host = %host, options = ?extra.keys().collect::<Vec<_>>(), "Applying vendor options");
    } else if enable_search || enable_thinking {
        warn!(host = %host, "Search/thinking options are not supported by this endpoint");
    }
    extra
}
