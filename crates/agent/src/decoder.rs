//! Turns an incremental model stream into one finished assistant turn.

use futures_util::{Stream, StreamExt};
use proto::{LlmError, Message, ProgressEvent, ToolCall};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::legacy;

/// Answer text is held back until it is clearly not a leaked marker.
const BUFFER_LIMIT: usize = 48;

/// One increment of a streamed model turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    Reasoning(String),
    Content(String),
    /// Fragment of the tool call at `index`; present fields replace id and
    /// name, arguments are appended.
    ToolCall {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
    Finish(String),
}

/// Where the decoder stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    Receiving,
    ToolCallsReady,
    ContentReady,
    Truncated,
    Empty,
}

/// A finished turn with the metadata the retry policy inspects.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnRecord {
    /// Visible answer text; suppressed marker text is excluded.
    pub content: String,
    pub reasoning_content: String,
    pub tool_calls: Vec<ToolCall>,
    /// Every content fragment as received, suppressed or not.
    pub raw_text: String,
    pub finish_reason: Option<String>,
    /// Whether any answer text reached the operator.
    pub answer_started: bool,
    /// Whether `tool_calls` came from legacy marker text.
    pub fallback_used: bool,
    pub state: TurnState,
}

impl TurnRecord {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// `raw_text` followed by the reasoning, trimmed.
    pub fn combined_text(&self) -> String {
        format!("{}\n{}", self.raw_text, self.reasoning_content)
            .trim()
            .to_string()
    }

    /// Drops the ephemeral metadata.
    pub fn into_message(self) -> Message {
        let reasoning_content = (!self.reasoning_content.is_empty()).then_some(self.reasoning_content);
        Message::Assistant {
            content: self.content,
            reasoning_content,
            tool_calls: self.tool_calls,
        }
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental decoder for one model turn.
#[derive(Debug, Default)]
pub struct TurnDecoder {
    content: String,
    reasoning: String,
    raw_text: String,
    buffer: String,
    answer_started: bool,
    suppressed: bool,
    calls: Vec<PartialCall>,
    finish_reason: Option<String>,
    state: TurnState,
    progress: Option<mpsc::Sender<ProgressEvent>>,
}

impl TurnDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forwards visible reasoning and answer fragments to `tx`.
    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn feed(&mut self, delta: StreamDelta) {
        self.state = TurnState::Receiving;
        match delta {
            StreamDelta::Reasoning(text) => {
                if text.is_empty() {
                    return;
                }
                self.emit(ProgressEvent::ReasoningDelta(text.clone()));
                self.reasoning.push_str(&text);
            }
            StreamDelta::Content(text) => self.feed_content(text),
            StreamDelta::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                if self.calls.len() <= index {
                    self.calls.resize_with(index + 1, PartialCall::default);
                }
                let call = &mut self.calls[index];
                if let Some(id) = id.filter(|s| !s.is_empty()) {
                    call.id = id;
                }
                if let Some(name) = name.filter(|s| !s.is_empty()) {
                    call.name = name;
                }
                if let Some(arguments) = arguments {
                    call.arguments.push_str(&arguments);
                }
            }
            StreamDelta::Finish(reason) => {
                let reason = reason.trim().to_ascii_lowercase();
                if !reason.is_empty() {
                    self.finish_reason = Some(reason);
                }
            }
        }
    }

    fn feed_content(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        self.raw_text.push_str(&text);
        if self.suppressed {
            return;
        }
        if self.answer_started {
            if legacy::contains_marker(&text) {
                debug!("Suppressing legacy marker text mid-answer");
                self.suppressed = true;
            } else {
                self.emit(ProgressEvent::AnswerDelta(text.clone()));
                self.content.push_str(&text);
            }
            return;
        }

        self.buffer.push_str(&text);
        let looks_like_tag = self.buffer.trim_start().starts_with('<');
        if looks_like_tag && legacy::contains_marker(&self.buffer) {
            debug!("Suppressing legacy marker text");
            self.suppressed = true;
            self.buffer.clear();
        } else if self.buffer.contains('\n')
            || self.buffer.chars().count() >= BUFFER_LIMIT
            || !looks_like_tag
        {
            self.flush_buffer();
        }
    }

    fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        self.answer_started = true;
        let buffered = std::mem::take(&mut self.buffer);
        self.emit(ProgressEvent::AnswerDelta(buffered.clone()));
        self.content.push_str(&buffered);
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.try_send(event);
        }
    }

    /// Closes the turn.
    pub fn finish(mut self) -> TurnRecord {
        if !self.suppressed && !self.answer_started {
            self.flush_buffer();
        }

        let mut tool_calls: Vec<ToolCall> = self
            .calls
            .drain(..)
            .filter(|c| !c.name.trim().is_empty())
            .map(|c| {
                let id = if c.id.trim().is_empty() {
                    format!("tc_{}", uuid::Uuid::new_v4().simple())
                } else {
                    c.id
                };
                ToolCall::new(id, c.name.trim(), c.arguments)
            })
            .collect();

        let mut fallback_used = false;
        if tool_calls.is_empty() {
            let source = format!("{}\n{}", self.raw_text, self.reasoning);
            let recovered = legacy::parse_legacy_calls(&source);
            if !recovered.is_empty() {
                debug!(calls = recovered.len(), "Recovered tool calls from legacy markers");
                tool_calls = recovered;
                fallback_used = true;
                self.content.clear();
            }
        }

        let state = if !tool_calls.is_empty() {
            TurnState::ToolCallsReady
        } else if self.finish_reason.as_deref() == Some("length") {
            TurnState::Truncated
        } else if !self.raw_text.trim().is_empty() || !self.reasoning.trim().is_empty() {
            TurnState::ContentReady
        } else {
            TurnState::Empty
        };

        TurnRecord {
            content: self.content,
            reasoning_content: self.reasoning,
            tool_calls,
            raw_text: self.raw_text,
            finish_reason: self.finish_reason,
            answer_started: self.answer_started,
            fallback_used,
            state,
        }
    }
}

/// Drains `stream` into `decoder`.
///
/// Cancellation wins over pending data; the stream is dropped on return,
/// which closes the underlying connection.
pub async fn decode_stream<S>(
    mut stream: S,
    mut decoder: TurnDecoder,
    cancel: &CancellationToken,
) -> Result<TurnRecord, LlmError>
where
    S: Stream<Item = Result<StreamDelta, LlmError>> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Interrupted),
            next = stream.next() => match next {
                Some(Ok(delta)) => decoder.feed(delta),
                Some(Err(e)) => return Err(e),
                None => break,
            },
        }
    }
    Ok(decoder.finish())
}
