//! Conversation loop: model turns, tool dispatch and retry policy.

use std::collections::BTreeSet;
use std::sync::Arc;

use proto::{
    AutoRejectHandler, ChatMode, LlmError, Message, ProgressEvent, SessionError, SessionSnapshot,
    ToolApprovalDecision, ToolApprovalHandler, ToolApprovalRequest, ToolCall, ToolCatalog,
};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tools::{
    CLOSE_SESSION_TOOL, CommandGuard, DangerPolicy, SHELL_TOOL, ToolBridge, bridge_failure,
    command_from_args, compact_tool_result, extract_session_ids, normalize_result,
    truncate_tool_content, validate,
};
use tracing::{debug, info, warn};

use crate::budget::ContextLimits;
use crate::decoder::{TurnDecoder, TurnRecord, decode_stream};
use crate::llm::{ChatRequest, LlmProvider, ToolChoice};
use crate::policy::{BatchOutcome, FatalStreak, RetryKind, RetryLimits, RetryPolicy, TurnDecision};
use crate::prompt::system_prompt;
use crate::store::MessageStore;
use crate::trace::{TraceEvent, TraceLog, TraceSink};

const TOOLS_USED_LIMIT: usize = 30;
const CEILING_FALLBACK: &str = "Analysis finished for this round.";
const RECOVERABLE_ERROR_CHARS: usize = 160;
const FATAL_ERROR_CHARS: usize = 120;
const TRACE_ERROR_CHARS: usize = 220;
const DEFAULT_MAX_TOOL_RESULT_CHARS: usize = 5000;

/// Knobs of one runtime, usually filled from the CLI config.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub model: String,
    /// Model for the forced closing turn; blank means `model`.
    pub summary_model: String,
    pub context: ContextLimits,
    /// Cap on the serialized content of one tool message.
    pub max_tool_result_chars: usize,
    pub retry: RetryLimits,
    /// Vendor options merged into every request body.
    pub extra: Map<String, Value>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model: "deepseek-reasoner".to_string(),
            summary_model: String::new(),
            context: ContextLimits::default(),
            max_tool_result_chars: DEFAULT_MAX_TOOL_RESULT_CHARS,
            retry: RetryLimits::default(),
            extra: Map::new(),
        }
    }
}

/// How a question ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Final answer text, with the tools-used list when any tool ran.
    Answer(String),
    /// Stopped after consecutive fatal tool errors; carries the diagnostic.
    Halted(String),
    /// Cancelled by the operator; the log keeps only committed work.
    Interrupted,
}

/// Owns the conversation and drives questions through the model and tools.
pub struct AgentRuntime {
    llm: Arc<dyn LlmProvider>,
    bridge: Arc<dyn ToolBridge>,
    catalog: ToolCatalog,
    tool_defs: Vec<Value>,
    guard: CommandGuard,
    approval: Arc<dyn ToolApprovalHandler>,
    config: RuntimeConfig,
    store: MessageStore,
    mode: ChatMode,
    session_ids: BTreeSet<String>,
    streak: FatalStreak,
    trace: TraceLog,
    progress: Option<mpsc::Sender<ProgressEvent>>,
}

impl AgentRuntime {
    /// Creates a runtime in loose mode with an empty log.
    ///
    /// The guard defaults to `confirm` and confirmations are rejected until
    /// [`with_approval`](Self::with_approval) installs a real handler.
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        bridge: Arc<dyn ToolBridge>,
        catalog: ToolCatalog,
        config: RuntimeConfig,
    ) -> Self {
        let mode = ChatMode::default();
        let store = MessageStore::new(system_prompt(mode, &catalog));
        let tool_defs = catalog.function_definitions();
        Self {
            llm,
            bridge,
            catalog,
            tool_defs,
            guard: CommandGuard::default(),
            approval: Arc::new(AutoRejectHandler),
            config,
            store,
            mode,
            session_ids: BTreeSet::new(),
            streak: FatalStreak::default(),
            trace: TraceLog::new(None),
            progress: None,
        }
    }

    pub fn with_guard(mut self, guard: CommandGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_approval(mut self, approval: Arc<dyn ToolApprovalHandler>) -> Self {
        self.approval = approval;
        self
    }

    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn with_trace_sink(mut self, sink: Option<TraceSink>) -> Self {
        self.trace.set_sink(sink);
        self
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn mode(&self) -> ChatMode {
        self.mode
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn summary_model(&self) -> &str {
        let summary = self.config.summary_model.trim();
        if summary.is_empty() { self.config.model.as_str() } else { summary }
    }

    /// Bridge sessions seen in tool results since the last reset.
    pub fn session_ids(&self) -> &BTreeSet<String> {
        &self.session_ids
    }

    /// Trace id of the most recent question; empty before the first one.
    pub fn last_trace_id(&self) -> &str {
        self.trace.trace_id()
    }

    pub fn trace_events(&self) -> &[TraceEvent] {
        self.trace.events()
    }

    pub fn trace_sink(&self) -> Option<&TraceSink> {
        self.trace.sink()
    }

    /// Switches mode; message 0 is rewritten only when the mode changes.
    pub fn set_mode(&mut self, mode: ChatMode) {
        if mode == self.mode {
            return;
        }
        debug!(from = %self.mode, to = %mode, "Switching chat mode");
        self.mode = mode;
        self.store.replace_system_prompt(system_prompt(mode, &self.catalog));
    }

    /// Keeps only the system prompt and forgets sessions and failures.
    pub fn reset(&mut self) {
        self.store.reset();
        self.session_ids.clear();
        self.streak.reset();
    }

    pub fn export_session(&self) -> SessionSnapshot {
        SessionSnapshot {
            model: self.config.model.clone(),
            summary_model: self.summary_model().to_string(),
            messages: self.store.messages().to_vec(),
        }
    }

    /// Replaces the log with an imported one; blank model fields keep the
    /// current models.
    pub fn import_session(&mut self, snapshot: SessionSnapshot) -> Result<(), SessionError> {
        self.store = MessageStore::from_messages(snapshot.messages)?;
        if !snapshot.model.trim().is_empty() {
            self.config.model = snapshot.model.trim().to_string();
        }
        if !snapshot.summary_model.trim().is_empty() {
            self.config.summary_model = snapshot.summary_model.trim().to_string();
        }
        info!(messages = self.store.len(), model = %self.config.model, "Session imported");
        Ok(())
    }

    /// Takes over the log, mode and known sessions of `previous`.
    ///
    /// Models, catalog and guard stay this runtime's own; message 0 is
    /// regenerated from the current catalog.
    pub fn carry_over(&mut self, previous: &mut AgentRuntime) -> Result<(), SessionError> {
        self.store = MessageStore::from_messages(previous.store.messages().to_vec())?;
        self.mode = previous.mode;
        self.store
            .replace_system_prompt(system_prompt(self.mode, &self.catalog));
        self.session_ids = std::mem::take(&mut previous.session_ids);
        debug!(messages = self.store.len(), sessions = self.session_ids.len(), "Conversation carried over");
        Ok(())
    }

    /// Closes every known bridge session; returns how many closed cleanly.
    pub async fn close_all_sessions(&mut self) -> usize {
        let ids = std::mem::take(&mut self.session_ids);
        let mut closed = 0;
        for session_id in ids {
            match self
                .bridge
                .call_tool(CLOSE_SESSION_TOOL, json!({"session_id": session_id}))
                .await
            {
                Ok(_) => closed += 1,
                Err(e) => warn!(session_id = %session_id, error = %e, "Failed to close bridge session"),
            }
        }
        closed
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.try_send(event);
        }
    }

    fn enforce_budget(&mut self) {
        if let Some((before, after)) = self.store.enforce(self.config.context) {
            self.trace.record(
                "trim_messages",
                json!({
                    "before": {"count": before.messages, "chars": before.chars},
                    "after": {"count": after.messages, "chars": after.chars},
                }),
            );
        }
    }

    fn note_retry(&mut self, kind: RetryKind, turn: usize) {
        warn!(kind = kind.as_str(), turn, "Injecting corrective instruction");
        self.trace.record("retry", json!({"kind": kind.as_str(), "turn": turn}));
        self.emit(ProgressEvent::notice(kind.notice()));
    }

    /// Answers one question.
    ///
    /// Only LLM transport errors escape; tool failures are fed back to the
    /// model or end the question as [`LoopOutcome::Halted`].
    pub async fn chat(
        &mut self,
        question: &str,
        mode: ChatMode,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, LlmError> {
        self.set_mode(mode);
        self.streak.reset();
        let trace_id = self.trace.begin();
        info!(trace_id = %trace_id, mode = %mode, "Question started");
        self.store.push(Message::user(question));
        self.enforce_budget();

        match self.run_turns(mode, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(LlmError::Interrupted) => {
                info!(trace_id = %trace_id, "Question interrupted");
                self.store.sanitize();
                Ok(LoopOutcome::Interrupted)
            }
            Err(e) => {
                self.store.sanitize();
                Err(e)
            }
        }
    }

    async fn run_turns(&mut self, mode: ChatMode, cancel: &CancellationToken) -> Result<LoopOutcome, LlmError> {
        let mut policy = RetryPolicy::new(self.config.retry, mode);
        let max_turns = policy.limits().max_turns;
        let mut last_answer = String::new();

        for turn in 1..=max_turns {
            let record = self.request_turn(turn, ToolChoice::Auto, cancel).await?;
            self.record_turn(turn, mode, &record);
            let content = record.content.trim();
            if !content.is_empty() {
                last_answer = content.to_string();
            }
            if record.fallback_used {
                self.emit(ProgressEvent::notice(
                    "Tool calls were written as marker text; converted them to structured calls.",
                ));
            }

            if !record.has_tool_calls() {
                let tools_used = self.trace.tool_names(TOOLS_USED_LIMIT);
                match policy.decide_turn(&record, &self.catalog, &tools_used) {
                    TurnDecision::Retry { kind, instruction } => {
                        self.note_retry(kind, turn);
                        self.store.push(record.into_message());
                        self.store.push(Message::user(instruction));
                        self.enforce_budget();
                        continue;
                    }
                    TurnDecision::Final(text) => {
                        info!(turn, chars = text.len(), "Final answer");
                        self.store.push(record.into_message());
                        self.enforce_budget();
                        return Ok(LoopOutcome::Answer(text));
                    }
                }
            }

            policy.on_tool_calls();
            let calls = record.tool_calls.clone();
            self.store.push(record.into_message());

            let mut batch = BatchOutcome::default();
            for call in &calls {
                if let Some(summary) = self.dispatch(turn, call, &mut batch, cancel).await? {
                    self.store.sanitize();
                    self.enforce_budget();
                    self.emit(ProgressEvent::notice("Stopped after repeated tool failures."));
                    return Ok(LoopOutcome::Halted(summary));
                }
            }
            self.enforce_budget();

            if let Some((kind, instruction)) = policy.decide_batch(&batch, &self.session_ids) {
                self.note_retry(kind, turn);
                self.store.push(Message::user(instruction));
                self.enforce_budget();
            }
        }

        info!(max_turns, "Turn ceiling reached, requesting a closing answer");
        let record = self.request_turn(max_turns + 1, ToolChoice::None, cancel).await?;
        self.record_turn(max_turns + 1, mode, &record);
        let mut text = record.content.trim().to_string();
        if text.is_empty() {
            text = if last_answer.is_empty() {
                CEILING_FALLBACK.to_string()
            } else {
                last_answer
            };
        }
        self.store.push(record.into_message());
        self.enforce_budget();
        Ok(LoopOutcome::Answer(text))
    }

    /// Sends the current log and decodes the streamed reply.
    async fn request_turn(
        &mut self,
        turn: usize,
        choice: ToolChoice,
        cancel: &CancellationToken,
    ) -> Result<TurnRecord, LlmError> {
        self.enforce_budget();
        let model = match choice {
            ToolChoice::Auto => self.config.model.clone(),
            ToolChoice::None => self.summary_model().to_string(),
        };
        let req = ChatRequest {
            model: model.clone(),
            messages: self.store.messages().to_vec(),
            tools: match choice {
                ToolChoice::Auto => self.tool_defs.clone(),
                ToolChoice::None => Vec::new(),
            },
            tool_choice: choice,
            extra: self.config.extra.clone(),
        };
        let stats = self.store.stats();
        self.trace.record(
            "model_request",
            json!({
                "turn": turn,
                "model": model,
                "tool_choice": choice.as_str(),
                "messages": stats.messages,
                "chars": stats.chars,
            }),
        );
        self.emit(ProgressEvent::Thinking { turn });
        debug!(turn, model = %model, messages = stats.messages, "Requesting model turn");

        let t0 = std::time::Instant::now();
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Interrupted),
            stream = self.llm.stream_chat(req) => stream?,
        };
        let mut decoder = TurnDecoder::new();
        if let Some(tx) = &self.progress {
            decoder = decoder.with_progress(tx.clone());
        }
        let record = decode_stream(stream, decoder, cancel).await?;
        debug!(
            turn,
            elapsed_ms = %t0.elapsed().as_millis(),
            state = ?record.state,
            tool_calls = record.tool_calls.len(),
            "Model turn decoded"
        );
        Ok(record)
    }

    fn record_turn(&mut self, turn: usize, mode: ChatMode, record: &TurnRecord) {
        let names: Vec<&str> = record.tool_calls.iter().take(20).map(|c| c.name.as_str()).collect();
        self.trace.record(
            "assistant_turn",
            json!({
                "turn_id": turn,
                "mode": mode.to_string(),
                "finish_reason": record.finish_reason.clone().unwrap_or_default(),
                "answer_started": record.answer_started,
                "fallback_used": record.fallback_used,
                "tool_calls_count": record.tool_calls.len(),
                "tool_call_names": names,
            }),
        );
    }

    /// Runs one tool call and appends its tool message.
    ///
    /// Returns the halt summary when this call completes a fatal streak.
    async fn dispatch(
        &mut self,
        turn: usize,
        call: &ToolCall,
        batch: &mut BatchOutcome,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, LlmError> {
        let name = call.name.as_str();
        let args = call.parsed_arguments();

        if let Err(e) = validate(name, &args, &self.catalog) {
            debug!(tool = name, error = %e, "Tool call failed validation");
            batch.validation_errors.push(format!("{name}: {e}"));
            let result = json!({
                "error": format!("validation failed: {e}"),
                "tool_name": name,
                "arguments": args,
            });
            let content = result.to_string();
            self.emit(ProgressEvent::ToolCallFinished {
                call_id: call.id.clone(),
                tool_name: name.to_string(),
                output: content.clone(),
                is_error: true,
            });
            self.store.push(Message::tool(call.id.clone(), content));
            return Ok(None);
        }

        let mut keys: Vec<&str> = args
            .as_object()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();
        keys.sort_unstable();
        keys.truncate(40);
        self.trace.record(
            "tool_call",
            json!({"turn_id": turn, "tool_name": name, "args_keys": keys}),
        );
        self.emit(ProgressEvent::ToolCallStarted {
            call_id: call.id.clone(),
            tool_name: name.to_string(),
            args: args.clone(),
        });

        let raw = match self.guard_decision(call, &args, cancel).await? {
            Some(blocked) => blocked,
            None => {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(LlmError::Interrupted),
                    outcome = self.bridge.call_tool(name, args.clone()) => outcome,
                };
                outcome.unwrap_or_else(|e| {
                    warn!(tool = name, error = %e, "Bridge call failed");
                    bridge_failure(name, &args, &e)
                })
            }
        };
        let result = compact_tool_result(name, normalize_result(name, &args, raw));

        let error = error_text(&result);
        let recoverable = result.get("recoverable") == Some(&Value::Bool(true));
        let mut halt = None;
        match &error {
            Some(err) if recoverable => {
                batch
                    .recoverable_errors
                    .push(format!("{name}: {}", prefix(err, RECOVERABLE_ERROR_CHARS)));
            }
            Some(err) => {
                if let Some(h) = self
                    .streak
                    .record_failure(format!("{name}: {}", prefix(err, FATAL_ERROR_CHARS)))
                {
                    self.trace.record("stop_after_failures", json!({"errors": h.errors}));
                    halt = Some(h.summary);
                }
            }
            None => {
                self.streak.record_success();
                batch.record_success(name);
            }
        }
        self.trace.record(
            "tool_result",
            json!({
                "turn_id": turn,
                "tool_name": name,
                "ok": error.is_none(),
                "recoverable": recoverable,
                "error": error.as_deref().map(|e| prefix(e, TRACE_ERROR_CHARS)).unwrap_or_default(),
            }),
        );

        self.session_ids.extend(extract_session_ids(&result));
        let content = truncate_tool_content(result.to_string(), self.config.max_tool_result_chars);
        self.emit(ProgressEvent::ToolCallFinished {
            call_id: call.id.clone(),
            tool_name: name.to_string(),
            output: content.clone(),
            is_error: error.is_some(),
        });
        self.store.push(Message::tool(call.id.clone(), content));
        Ok(halt)
    }

    /// Applies the dangerous-command policy to shell calls.
    ///
    /// Returns the blocked result when the call must not run.
    async fn guard_decision(
        &self,
        call: &ToolCall,
        args: &Value,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, LlmError> {
        if call.name != SHELL_TOOL || self.guard.policy() == DangerPolicy::Off {
            return Ok(None);
        }
        let command = command_from_args(args);
        let verdict = self.guard.check(&command);
        if !verdict.dangerous {
            return Ok(None);
        }
        self.emit(ProgressEvent::notice(format!(
            "Dangerous command detected ({}): {command}",
            verdict.reason
        )));

        let approved = match self.guard.policy() {
            DangerPolicy::Off => true,
            DangerPolicy::Deny => false,
            DangerPolicy::Confirm => {
                let req = ToolApprovalRequest {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    command: command.clone(),
                    reason: verdict.reason.clone(),
                };
                let decision = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(LlmError::Interrupted),
                    decision = self.approval.request_approval(req) => decision,
                };
                decision == ToolApprovalDecision::Approve
            }
        };
        if approved {
            info!(command = %command, reason = %verdict.reason, "Dangerous command approved");
            return Ok(None);
        }
        warn!(command = %command, reason = %verdict.reason, "Dangerous command blocked");
        Ok(Some(json!({
            "error": format!("dangerous command blocked ({})", verdict.reason),
            "recoverable": true,
            "tool_name": call.name,
            "arguments": args,
            "command": command,
        })))
    }
}

/// Non-empty `error` of a normalized result.
fn error_text(result: &Value) -> Option<String> {
    match result.get("error")? {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Null | Value::Bool(false) => None,
        other => Some(other.to_string()),
    }
}

fn prefix(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures_util::stream;
    use proto::{AutoApproveHandler, BridgeError, Role, ToolSpec};

    use super::*;
    use crate::decoder::StreamDelta;
    use crate::llm::DeltaStream;
    use crate::trace::read_trace;

    struct MockLlm {
        queue: Mutex<VecDeque<Vec<StreamDelta>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl MockLlm {
        fn new(turns: Vec<Vec<StreamDelta>>) -> Arc<Self> {
            Arc::new(Self {
                queue: Mutex::new(VecDeque::from(turns)),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().expect("lock requests").clone()
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        async fn stream_chat(&self, req: ChatRequest) -> Result<DeltaStream, LlmError> {
            self.requests.lock().expect("lock requests").push(req);
            let deltas = self
                .queue
                .lock()
                .expect("lock queue")
                .pop_front()
                .ok_or_else(|| LlmError::InvalidResponse("No mock response left".to_string()))?;
            Ok(Box::pin(stream::iter(deltas.into_iter().map(Ok))))
        }
    }

    struct MockBridge {
        results: Mutex<VecDeque<Result<Value, BridgeError>>>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl MockBridge {
        fn new(results: Vec<Result<Value, BridgeError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(VecDeque::from(results)),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().expect("lock calls").clone()
        }
    }

    #[async_trait]
    impl ToolBridge for MockBridge {
        async fn list_tools(&self) -> Result<Value, BridgeError> {
            Ok(json!({"result": {"tools": []}}))
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, BridgeError> {
            self.calls
                .lock()
                .expect("lock calls")
                .push((name.to_string(), arguments));
            self.results
                .lock()
                .expect("lock results")
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}})))
        }

        async fn health(&self) -> Result<String, BridgeError> {
            Ok("ok".to_string())
        }
    }

    /// Confirmation handler that cancels the question and never answers.
    struct CancellingApproval(CancellationToken);

    #[async_trait]
    impl ToolApprovalHandler for CancellingApproval {
        async fn request_approval(&self, _req: ToolApprovalRequest) -> ToolApprovalDecision {
            self.0.cancel();
            std::future::pending().await
        }
    }

    fn string_props(keys: &[&str]) -> Map<String, Value> {
        keys.iter()
            .map(|k| (k.to_string(), json!({"type": "string"})))
            .collect()
    }

    fn catalog() -> ToolCatalog {
        let mut catalog = ToolCatalog::new();
        catalog.insert(ToolSpec::new(
            "r2_open_file",
            string_props(&["file_path"]),
            vec!["file_path".to_string()],
        ));
        catalog.insert(ToolSpec::new(
            SHELL_TOOL,
            string_props(&["command"]),
            vec!["command".to_string()],
        ));
        catalog
    }

    fn answer(text: &str) -> Vec<StreamDelta> {
        vec![
            StreamDelta::Content(text.to_string()),
            StreamDelta::Finish("stop".to_string()),
        ]
    }

    fn call(id: &str, name: &str, args: Value) -> Vec<StreamDelta> {
        vec![
            StreamDelta::ToolCall {
                index: 0,
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                arguments: Some(args.to_string()),
            },
            StreamDelta::Finish("tool_calls".to_string()),
        ]
    }

    fn runtime(llm: Arc<MockLlm>, bridge: Arc<MockBridge>) -> AgentRuntime {
        AgentRuntime::new(llm, bridge, catalog(), RuntimeConfig::default())
    }

    fn roles(runtime: &AgentRuntime) -> Vec<Role> {
        runtime.messages().iter().map(Message::role).collect()
    }

    #[tokio::test]
    async fn plain_question_returns_answer() {
        let llm = MockLlm::new(vec![answer("Paris.")]);
        let mut runtime = runtime(llm.clone(), MockBridge::new(vec![]));

        let outcome = runtime
            .chat("capital of France?", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");
        assert_eq!(outcome, LoopOutcome::Answer("Paris.".to_string()));
        assert_eq!(roles(&runtime), vec![Role::System, Role::User, Role::Assistant]);

        let requests = llm.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].tool_choice, ToolChoice::Auto);
        assert_eq!(requests[0].tools.len(), 2);
        assert!(runtime.last_trace_id().starts_with("tr_"));
    }

    #[tokio::test]
    async fn tool_call_then_answer_lists_tools_and_sessions() {
        let llm = MockLlm::new(vec![
            call("c1", "r2_open_file", json!({"file_path": "/a.so"})),
            answer("It is an ELF shared object."),
        ]);
        let bridge = MockBridge::new(vec![Ok(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"content": [{"type": "text", "text": "opened session_abc"}]}
        }))]);
        let mut runtime = runtime(llm, bridge.clone());

        let outcome = runtime
            .chat("open /a.so", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");
        assert_eq!(
            outcome,
            LoopOutcome::Answer("It is an ELF shared object.\n\n## Tools Used\n- r2_open_file\n".to_string())
        );
        assert_eq!(
            roles(&runtime),
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(bridge.calls(), vec![("r2_open_file".to_string(), json!({"file_path": "/a.so"}))]);
        assert!(runtime.session_ids().contains("session_abc"));
    }

    #[tokio::test]
    async fn four_fatal_errors_halt_without_fifth_request() {
        let mut turns: Vec<Vec<StreamDelta>> = (0..4)
            .map(|i| call(&format!("c{i}"), "r2_open_file", json!({"file_path": "/a.so"})))
            .collect();
        turns.push(answer("never requested"));
        let llm = MockLlm::new(turns);
        let failures = (0..4)
            .map(|_| {
                Err(BridgeError::Http {
                    status: 500,
                    body: "internal server error".to_string(),
                })
            })
            .collect();
        let mut runtime = runtime(llm.clone(), MockBridge::new(failures));

        let outcome = runtime
            .chat("analyze", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");
        let LoopOutcome::Halted(summary) = outcome else {
            panic!("expected halt, got {outcome:?}");
        };
        assert!(summary.contains("automatic loop has stopped"));
        assert!(summary.contains("Server or gateway failure"));
        assert_eq!(llm.requests().len(), 4);
        assert!(runtime.trace_events().iter().any(|e| e.event == "stop_after_failures"));
        assert_eq!(runtime.messages().last().map(Message::role), Some(Role::Tool));
    }

    #[tokio::test]
    async fn success_between_failures_resets_streak() {
        let turns: Vec<Vec<StreamDelta>> = (0..5)
            .map(|i| call(&format!("c{i}"), "r2_open_file", json!({"file_path": "/a.so"})))
            .chain(std::iter::once(answer("done")))
            .collect();
        let http_500 = || {
            Err(BridgeError::Http {
                status: 500,
                body: "boom".to_string(),
            })
        };
        let bridge = MockBridge::new(vec![
            http_500(),
            http_500(),
            http_500(),
            Ok(json!({"result": {"ok": true}})),
            http_500(),
        ]);
        let mut runtime = runtime(MockLlm::new(turns), bridge);

        let outcome = runtime
            .chat("analyze", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");
        assert!(matches!(outcome, LoopOutcome::Answer(_)));
    }

    #[tokio::test]
    async fn each_question_starts_a_fresh_failure_streak() {
        let http_500 = || {
            Err(BridgeError::Http {
                status: 500,
                body: "boom".to_string(),
            })
        };
        let open = |id: &str| call(id, "r2_open_file", json!({"file_path": "/a.so"}));
        let llm = MockLlm::new(vec![
            open("a1"),
            open("a2"),
            open("a3"),
            answer("first done"),
            open("b1"),
            open("b2"),
            answer("second done"),
        ]);
        let bridge = MockBridge::new(vec![http_500(), http_500(), http_500(), http_500(), http_500()]);
        let mut runtime = runtime(llm.clone(), bridge);

        let first = runtime
            .chat("first", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("first chat");
        assert!(matches!(&first, LoopOutcome::Answer(text) if text.starts_with("first done")));

        let second = runtime
            .chat("second", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("second chat");
        assert!(
            matches!(&second, LoopOutcome::Answer(text) if text.starts_with("second done")),
            "second question halted: {second:?}"
        );
        assert_eq!(llm.requests().len(), 7);
    }

    #[tokio::test]
    async fn validation_failure_is_fed_back_without_bridge_call() {
        let llm = MockLlm::new(vec![
            call("c1", "r2_open_file", json!({"file_path": "  "})),
            answer("I need a path."),
        ]);
        let bridge = MockBridge::new(vec![]);
        let mut runtime = runtime(llm, bridge.clone());

        let outcome = runtime
            .chat("open it", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");
        assert_eq!(outcome, LoopOutcome::Answer("I need a path.".to_string()));
        assert!(bridge.calls().is_empty());

        let messages = runtime.messages();
        assert!(messages[3].content().contains("validation failed"));
        assert_eq!(messages[4].role(), Role::User);
        assert!(messages[4].content().contains("failed schema validation"));
    }

    #[tokio::test]
    async fn denied_dangerous_command_is_recoverable() {
        let llm = MockLlm::new(vec![
            call("c1", SHELL_TOOL, json!({"command": "rm -rf /sdcard"})),
            answer("Skipped the deletion."),
        ]);
        let bridge = MockBridge::new(vec![]);
        let guard = CommandGuard::new(DangerPolicy::Deny, "", "").expect("guard");
        let mut runtime = runtime(llm, bridge.clone()).with_guard(guard);

        let outcome = runtime
            .chat("clean up", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");
        assert!(matches!(outcome, LoopOutcome::Answer(_)));
        assert!(bridge.calls().is_empty());

        let messages = runtime.messages();
        assert!(messages[3].content().contains("dangerous command blocked (rm -rf)"));
        assert!(messages[4].content().contains("recoverable=true"));
    }

    #[tokio::test]
    async fn approved_dangerous_command_runs() {
        let llm = MockLlm::new(vec![
            call("c1", SHELL_TOOL, json!({"command": "rm -rf /sdcard/tmp"})),
            answer("Removed."),
        ]);
        let bridge = MockBridge::new(vec![]);
        let mut runtime = runtime(llm, bridge.clone()).with_approval(Arc::new(AutoApproveHandler));

        runtime
            .chat("clean up", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");
        assert_eq!(bridge.calls().len(), 1);
    }

    #[tokio::test]
    async fn cancel_during_confirmation_drops_unanswered_call() {
        let cancel = CancellationToken::new();
        let llm = MockLlm::new(vec![call("c1", SHELL_TOOL, json!({"command": "reboot"}))]);
        let bridge = MockBridge::new(vec![]);
        let mut runtime =
            runtime(llm, bridge.clone()).with_approval(Arc::new(CancellingApproval(cancel.clone())));

        let outcome = runtime.chat("reboot it", ChatMode::Loose, &cancel).await.expect("chat");
        assert_eq!(outcome, LoopOutcome::Interrupted);
        assert!(bridge.calls().is_empty());
        assert_eq!(roles(&runtime), vec![Role::System, Role::User]);
    }

    #[tokio::test]
    async fn cancelled_before_request_is_interrupted() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let llm = MockLlm::new(vec![answer("late")]);
        let mut runtime = runtime(llm.clone(), MockBridge::new(vec![]));

        let outcome = runtime.chat("hi", ChatMode::Loose, &cancel).await.expect("chat");
        assert_eq!(outcome, LoopOutcome::Interrupted);
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn turn_ceiling_forces_summary_without_tools() {
        let llm = MockLlm::new(vec![
            call("c1", "r2_open_file", json!({"file_path": "/a.so"})),
            call("c2", "r2_open_file", json!({"file_path": "/b.so"})),
            answer("Summary of both files."),
        ]);
        let config = RuntimeConfig {
            summary_model: "deepseek-chat".to_string(),
            retry: RetryLimits {
                max_turns: 2,
                ..RetryLimits::default()
            },
            ..RuntimeConfig::default()
        };
        let mut runtime = AgentRuntime::new(llm.clone(), MockBridge::new(vec![]), catalog(), config);

        let outcome = runtime
            .chat("compare", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");
        assert_eq!(outcome, LoopOutcome::Answer("Summary of both files.".to_string()));

        let requests = llm.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].tool_choice, ToolChoice::None);
        assert!(requests[2].tools.is_empty());
        assert_eq!(requests[2].model, "deepseek-chat");
    }

    #[tokio::test]
    async fn empty_closing_turn_falls_back_to_default_line() {
        let llm = MockLlm::new(vec![
            call("c1", "r2_open_file", json!({"file_path": "/a.so"})),
            vec![StreamDelta::Finish("stop".to_string())],
        ]);
        let config = RuntimeConfig {
            retry: RetryLimits {
                max_turns: 1,
                ..RetryLimits::default()
            },
            ..RuntimeConfig::default()
        };
        let mut runtime = AgentRuntime::new(llm, MockBridge::new(vec![]), catalog(), config);
        let outcome = runtime
            .chat("go", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");
        assert_eq!(outcome, LoopOutcome::Answer(CEILING_FALLBACK.to_string()));
    }

    #[tokio::test]
    async fn strict_mode_asks_for_report_until_complete() {
        let report = "## Findings\nThe library registers natives in JNI_OnLoad.\n\n\
                      ## Evidence\nr2_open_file on session_1 listed JNI_OnLoad.\n\n\
                      ## Next Steps\nDisassemble JNI_OnLoad to find RegisterNatives.";
        let llm = MockLlm::new(vec![answer("It is a shared object."), answer(report)]);
        let mut runtime = runtime(llm.clone(), MockBridge::new(vec![]));

        let outcome = runtime
            .chat("what is it", ChatMode::Strict, &CancellationToken::new())
            .await
            .expect("chat");
        assert_eq!(outcome, LoopOutcome::Answer(report.to_string()));
        assert_eq!(llm.requests().len(), 2);
        assert!(runtime.messages()[0].content().contains("Turn contract"));
        assert!(runtime.messages()[3].content().contains("final Markdown report"));
    }

    #[tokio::test]
    async fn legacy_marker_text_is_executed_as_tool_call() {
        let llm = MockLlm::new(vec![
            vec![
                StreamDelta::Content("<｜DSML｜function_calls>".to_string()),
                StreamDelta::Content("<｜DSML｜invoke name=\"r2_open_file\">".to_string()),
                StreamDelta::Content(
                    "<｜DSML｜parameter name=\"file_path\" string=\"true\">/a.so</｜DSML｜parameter>".to_string(),
                ),
                StreamDelta::Content("</｜DSML｜invoke></｜DSML｜function_calls>".to_string()),
                StreamDelta::Finish("stop".to_string()),
            ],
            answer("Opened."),
        ]);
        let bridge = MockBridge::new(vec![]);
        let mut runtime = runtime(llm, bridge.clone());

        runtime
            .chat("open /a.so", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");
        assert_eq!(bridge.calls(), vec![("r2_open_file".to_string(), json!({"file_path": "/a.so"}))]);
    }

    #[tokio::test]
    async fn llm_error_propagates_and_keeps_log_valid() {
        let llm = MockLlm::new(vec![]);
        let mut runtime = runtime(llm, MockBridge::new(vec![]));
        let err = runtime
            .chat("hi", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect_err("no scripted turn");
        assert!(matches!(err, LlmError::InvalidResponse(_)));
        assert_eq!(roles(&runtime), vec![Role::System, Role::User]);
    }

    #[tokio::test]
    async fn progress_events_cover_thinking_and_tools() {
        let (tx, mut rx) = mpsc::channel(64);
        let llm = MockLlm::new(vec![
            call("c1", "r2_open_file", json!({"file_path": "/a.so"})),
            answer("ok"),
        ]);
        let mut runtime = runtime(llm, MockBridge::new(vec![])).with_progress(tx);
        runtime
            .chat("open", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");
        drop(runtime);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(events.contains(&ProgressEvent::Thinking { turn: 1 }));
        assert!(events.iter().any(|e| matches!(e, ProgressEvent::ToolCallStarted { tool_name, .. } if tool_name == "r2_open_file")));
        assert!(events.iter().any(|e| matches!(e, ProgressEvent::ToolCallFinished { is_error: false, .. })));
        assert!(events.contains(&ProgressEvent::AnswerDelta("ok".to_string())));
    }

    #[tokio::test]
    async fn trace_sink_records_question_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trace.jsonl");
        let llm = MockLlm::new(vec![answer("hi")]);
        let mut runtime = runtime(llm, MockBridge::new(vec![])).with_trace_sink(Some(TraceSink {
            path: path.clone(),
            max_bytes: 0,
        }));
        runtime
            .chat("hello", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");

        let events = read_trace(&path, runtime.last_trace_id(), 100).expect("read trace");
        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, vec!["model_request", "assistant_turn"]);
    }

    #[tokio::test]
    async fn mode_switch_reset_and_session_round_trip() {
        let llm = MockLlm::new(vec![answer("one")]);
        let mut runtime = runtime(llm, MockBridge::new(vec![]));
        let loose_prompt = runtime.messages()[0].content().to_string();
        runtime.set_mode(ChatMode::Strict);
        assert_ne!(runtime.messages()[0].content(), loose_prompt);
        runtime.set_mode(ChatMode::Loose);
        assert_eq!(runtime.messages()[0].content(), loose_prompt);

        runtime
            .chat("q", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");
        let snapshot = runtime.export_session();
        assert_eq!(snapshot.messages.len(), 3);
        assert_eq!(snapshot.summary_model, "deepseek-reasoner");

        runtime.reset();
        assert_eq!(runtime.messages().len(), 1);

        let mut imported = snapshot.clone();
        imported.model = "deepseek-chat".to_string();
        runtime.import_session(imported).expect("import");
        assert_eq!(runtime.messages().len(), 3);
        assert_eq!(runtime.model(), "deepseek-chat");

        let bad = SessionSnapshot {
            messages: vec![Message::user("no system")],
            ..snapshot
        };
        assert!(matches!(runtime.import_session(bad), Err(SessionError::MissingSystem)));
    }

    #[tokio::test]
    async fn close_all_sessions_calls_bridge_per_id() {
        let llm = MockLlm::new(vec![
            call("c1", "r2_open_file", json!({"file_path": "/a.so"})),
            answer("ok"),
        ]);
        let bridge = MockBridge::new(vec![Ok(json!({"result": {"session_id": "session_1"}}))]);
        let mut runtime = runtime(llm, bridge.clone());
        runtime
            .chat("open", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");

        assert_eq!(runtime.close_all_sessions().await, 1);
        assert!(runtime.session_ids().is_empty());
        let calls = bridge.calls();
        assert_eq!(
            calls.last(),
            Some(&(CLOSE_SESSION_TOOL.to_string(), json!({"session_id": "session_1"})))
        );
    }

    #[tokio::test]
    async fn carry_over_keeps_log_and_sessions_with_new_models() {
        let llm = MockLlm::new(vec![
            call("c1", "r2_open_file", json!({"file_path": "/a.so"})),
            answer("ok"),
        ]);
        let bridge = MockBridge::new(vec![Ok(json!({"result": {"session_id": "session_9"}}))]);
        let mut old = runtime(llm, bridge.clone());
        old.set_mode(ChatMode::Strict);
        old.chat("open", ChatMode::Loose, &CancellationToken::new())
            .await
            .expect("chat");
        let old_len = old.messages().len();

        let config = RuntimeConfig {
            model: "deepseek-chat".to_string(),
            ..RuntimeConfig::default()
        };
        let mut fresh = AgentRuntime::new(MockLlm::new(vec![]), bridge, catalog(), config);
        fresh.carry_over(&mut old).expect("carry over");
        assert_eq!(fresh.messages().len(), old_len);
        assert_eq!(fresh.mode(), ChatMode::Loose);
        assert_eq!(fresh.model(), "deepseek-chat");
        assert!(fresh.session_ids().contains("session_9"));
        assert!(old.session_ids().is_empty());
    }
}
