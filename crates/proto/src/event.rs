/// Real-time progress events emitted while a question is being answered.
///
/// These events are sent via `tokio::sync::mpsc` from
/// `AgentRuntime::chat()` so that the terminal front-end can stream
/// reasoning and answer text and show tool-call status while the loop runs.
/// Sends use `try_send`; a slow consumer loses events, never stalls the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A model request is being sent (turn N of the current question).
    Thinking { turn: usize },
    /// A fragment of the model's reasoning text.
    ReasoningDelta(String),
    /// A fragment of visible answer text.
    AnswerDelta(String),
    /// A tool call has been dispatched but has not yet completed.
    ToolCallStarted {
        call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    /// A tool call has finished (successfully or not).
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// A retry, fallback or halt notice for the operator.
    Notice(String),
}

impl ProgressEvent {
    /// Shorthand for a [`ProgressEvent::Notice`].
    pub fn notice(text: impl Into<String>) -> Self {
        ProgressEvent::Notice(text.into())
    }
}
