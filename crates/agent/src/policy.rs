//! Classification of turn and tool-batch outcomes into retry, final or halt.

use std::collections::BTreeSet;

use proto::{ChatMode, ToolCatalog};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::decoder::TurnRecord;
use crate::guidance;
use crate::intent::looks_like_unissued_tool_use;
use crate::legacy;
use crate::report::{append_tools_used, looks_like_final_report};

/// Consecutive fatal tool errors that stop the loop.
pub const FATAL_STREAK_LIMIT: usize = 4;

const EMPTY_ANSWER: &str = "(the model returned no text)";

/// Per-question retry ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryLimits {
    /// Model turns before the forced summary turn.
    pub max_turns: usize,
    /// Turns that end without usable tool calls or a final answer.
    pub missing_tool: usize,
    pub validation: usize,
    pub recoverable: usize,
    /// Partial-success recoverable batches.
    pub recoverable_hint: usize,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            max_turns: 24,
            missing_tool: 6,
            validation: 4,
            recoverable: 4,
            recoverable_hint: 6,
        }
    }
}

/// Why a corrective instruction was injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    LegacyMarkup,
    Truncated,
    Unfinished,
    AnswerNotStarted,
    UnissuedToolUse,
    ReasoningOnly,
    DanglingPrompt,
    IncompleteReport,
    PartialRecoverable,
    Recoverable,
    Validation,
}

impl RetryKind {
    /// Name used in trace events.
    pub fn as_str(self) -> &'static str {
        match self {
            RetryKind::LegacyMarkup => "legacy_markup",
            RetryKind::Truncated => "truncated",
            RetryKind::Unfinished => "unfinished",
            RetryKind::AnswerNotStarted => "answer_not_started",
            RetryKind::UnissuedToolUse => "unissued_tool_use",
            RetryKind::ReasoningOnly => "reasoning_only",
            RetryKind::DanglingPrompt => "dangling_prompt",
            RetryKind::IncompleteReport => "incomplete_report",
            RetryKind::PartialRecoverable => "partial_recoverable",
            RetryKind::Recoverable => "recoverable",
            RetryKind::Validation => "validation",
        }
    }

    /// Operator-facing notice.
    pub fn notice(self) -> &'static str {
        match self {
            RetryKind::LegacyMarkup => "Marker text leaked into the answer; asking for structured tool calls.",
            RetryKind::Truncated => "Output was cut off (finish_reason=length); asking the model to continue.",
            RetryKind::Unfinished => "Stream ended without a finish reason; asking the model to continue.",
            RetryKind::AnswerNotStarted => "No answer was started this turn; asking the model to continue.",
            RetryKind::UnissuedToolUse => "The model described tool use without calling tools; asking for real tool calls.",
            RetryKind::ReasoningOnly => "The model only produced reasoning; asking it to finish.",
            RetryKind::DanglingPrompt => "Output ended at an r2> prompt; asking the model to continue.",
            RetryKind::IncompleteReport => "No complete final report yet; asking the model to finish it.",
            RetryKind::PartialRecoverable => "Some tool calls failed recoverably; asking the model to retry only those.",
            RetryKind::Recoverable => "Tool calls returned recoverable errors; asking the model to fix and resend.",
            RetryKind::Validation => "Tool arguments failed schema validation; asking the model to correct them.",
        }
    }
}

/// What to do with a turn that produced no usable tool calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnDecision {
    /// Keep the turn, inject `instruction` as a user message and go again.
    Retry { kind: RetryKind, instruction: String },
    /// The question is answered with this text.
    Final(String),
}

/// Tallies of one dispatched tool batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub success_calls: usize,
    /// Distinct names of tools that succeeded, in order.
    pub success_tools: Vec<String>,
    /// `"{tool}: {error}"` lines.
    pub recoverable_errors: Vec<String>,
    pub validation_errors: Vec<String>,
}

impl BatchOutcome {
    pub fn record_success(&mut self, tool_name: &str) {
        self.success_calls += 1;
        if !self.success_tools.iter().any(|t| t == tool_name) {
            self.success_tools.push(tool_name.to_string());
        }
    }
}

/// Per-question retry counters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    limits: RetryLimits,
    mode: ChatMode,
    missing_tool: usize,
    validation: usize,
    recoverable: usize,
    recoverable_hint: usize,
}

impl RetryPolicy {
    pub fn new(limits: RetryLimits, mode: ChatMode) -> Self {
        Self {
            limits,
            mode,
            missing_tool: 0,
            validation: 0,
            recoverable: 0,
            recoverable_hint: 0,
        }
    }

    pub fn limits(&self) -> RetryLimits {
        self.limits
    }

    fn strict(&self) -> bool {
        self.mode == ChatMode::Strict
    }

    fn no_tool_instruction(&self) -> &'static str {
        if self.strict() {
            "If no tool is needed, write the final Markdown report (## Findings / ## Evidence / ## Next Steps)."
        } else {
            "If no tool is needed, answer directly (no report structure required)."
        }
    }

    /// A turn carried tool calls.
    pub fn on_tool_calls(&mut self) {
        self.missing_tool = 0;
    }

    /// Applies the no-tool-call rules in priority order.
    ///
    /// Every retry rule needs budget on the missing-tool counter; once it is
    /// spent the turn falls through to the final answer.
    pub fn decide_turn(&mut self, turn: &TurnRecord, catalog: &ToolCatalog, tools_used: &[String]) -> TurnDecision {
        let combined = turn.combined_text();
        let content = turn.content.trim();
        let has_text = !combined.is_empty();
        let strict = self.strict();

        let kind = if legacy::contains_marker(&combined) {
            Some(RetryKind::LegacyMarkup)
        } else if turn.finish_reason.as_deref() == Some("length") {
            Some(RetryKind::Truncated)
        } else if turn.finish_reason.is_none() && has_text {
            Some(RetryKind::Unfinished)
        } else if !turn.answer_started && has_text {
            Some(RetryKind::AnswerNotStarted)
        } else if strict && has_text && looks_like_unissued_tool_use(&combined, catalog) {
            Some(RetryKind::UnissuedToolUse)
        } else if content.is_empty() && !turn.reasoning_content.trim().is_empty() {
            Some(RetryKind::ReasoningOnly)
        } else if ends_at_r2_prompt(&combined) {
            Some(RetryKind::DanglingPrompt)
        } else if strict && !looks_like_final_report(content) {
            Some(RetryKind::IncompleteReport)
        } else {
            None
        };

        // Rules are evaluated in order; the first match consumes budget, and
        // with no budget left every rule falls through to the final answer.
        if let Some(kind) = kind
            && self.missing_tool < self.limits.missing_tool
        {
            self.missing_tool += 1;
            return TurnDecision::Retry {
                kind,
                instruction: self.turn_instruction(kind),
            };
        }

        let text = if content.is_empty() { EMPTY_ANSWER } else { content };
        TurnDecision::Final(append_tools_used(text, tools_used))
    }

    fn turn_instruction(&self, kind: RetryKind) -> String {
        match kind {
            RetryKind::LegacyMarkup => format!(
                "Do not output any DSML/XML/protocol text. Retry now:\n\
                 - If an action is needed you must emit structured tool calls;\n\
                 - {}\n\
                 Do not print tool calls as text.",
                self.no_tool_instruction()
            ),
            RetryKind::Truncated => {
                "Your output was cut off. Continue: emit tool calls if an action is needed; otherwise complete the answer."
                    .to_string()
            }
            RetryKind::Unfinished => {
                "Please finish your previous output: emit tool calls if an action is needed; otherwise give the final answer directly."
                    .to_string()
            }
            RetryKind::AnswerNotStarted => {
                "You have not started the answer yet, so the work is not finished.\n\
                 Continue: if you need to act or gather evidence, call tools with tool calls; if no tool is needed, write the answer directly."
                    .to_string()
            }
            RetryKind::UnissuedToolUse => {
                "Turn the plan you just described into real tool calls: use tool calls for the tools you need \
                 (for example termux_command or r2_run_command) instead of describing them in text.\n\n\
                 Only tool names from tools/list exist; if you named a tool that does not exist, use an available one. \
                 For arbitrary shell commands use termux_command."
                    .to_string()
            }
            RetryKind::ReasoningOnly => {
                "You only produced reasoning and no result yet.\n\
                 Continue: if the next step needs an action, call tools with tool calls; if no tool is needed, write the answer directly."
                    .to_string()
            }
            RetryKind::DanglingPrompt => {
                "Your output ended with an `r2>` prompt, so the step is not finished.\n\
                 Continue and emit the tool calls for the next step right away instead of describing them. \
                 If you are done and need no tool, write the answer directly."
                    .to_string()
            }
            RetryKind::IncompleteReport => {
                "You have not given a final conclusion yet.\n\
                 Continue: either run the next step with tool calls now, or write the final Markdown report \
                 (it must contain ## Findings / ## Evidence / ## Next Steps)."
                    .to_string()
            }
            RetryKind::PartialRecoverable | RetryKind::Recoverable | RetryKind::Validation => String::new(),
        }
    }

    /// Decides whether a finished tool batch needs a corrective instruction.
    ///
    /// Counters reset only when no instruction is issued: a successful batch
    /// resets the validation counter and, without recoverable errors, both
    /// recoverable counters.
    pub fn decide_batch(
        &mut self,
        outcome: &BatchOutcome,
        session_ids: &BTreeSet<String>,
    ) -> Option<(RetryKind, String)> {
        let clean_validation = outcome.validation_errors.is_empty();
        let has_recoverable = !outcome.recoverable_errors.is_empty();

        if has_recoverable
            && outcome.success_calls > 0
            && clean_validation
            && self.recoverable_hint < self.limits.recoverable_hint
        {
            self.recoverable_hint += 1;
            let prompt = guidance::recoverable_prompt(
                &outcome.success_tools,
                &outcome.recoverable_errors,
                true,
                session_ids,
            );
            return Some((RetryKind::PartialRecoverable, prompt));
        }
        if has_recoverable
            && outcome.success_calls == 0
            && clean_validation
            && self.recoverable < self.limits.recoverable
        {
            self.recoverable += 1;
            let prompt = guidance::recoverable_prompt(&[], &outcome.recoverable_errors, false, session_ids);
            return Some((RetryKind::Recoverable, prompt));
        }
        if !clean_validation && outcome.success_calls == 0 && self.validation < self.limits.validation {
            self.validation += 1;
            return Some((RetryKind::Validation, guidance::validation_prompt(&outcome.validation_errors)));
        }

        if outcome.success_calls > 0 {
            self.validation = 0;
            if !has_recoverable {
                self.recoverable = 0;
                self.recoverable_hint = 0;
            }
        }
        None
    }
}

/// The combined text ends with a bare `r2>` line.
fn ends_at_r2_prompt(text: &str) -> bool {
    text.trim_end().rsplit('\n').next().map(str::trim) == Some("r2>")
}

/// A halted loop: the operator-facing summary and the errors behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Halt {
    pub summary: String,
    /// Up to the last six errors of the streak.
    pub errors: Vec<String>,
}

/// Consecutive fatal tool errors, shared across turns and questions.
#[derive(Debug, Clone)]
pub struct FatalStreak {
    errors: Vec<String>,
    limit: usize,
}

impl Default for FatalStreak {
    fn default() -> Self {
        Self::new(FATAL_STREAK_LIMIT)
    }
}

impl FatalStreak {
    pub fn new(limit: usize) -> Self {
        Self {
            errors: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// Records a fatal error; once the limit is hit the streak is consumed
    /// and the halt is returned.
    pub fn record_failure(&mut self, error: impl Into<String>) -> Option<Halt> {
        self.errors.push(error.into());
        if self.errors.len() < self.limit {
            return None;
        }
        let mut errors = std::mem::take(&mut self.errors);
        let summary = guidance::halt_summary(&errors);
        info!(errors = errors.len(), "Halting after consecutive tool failures");
        errors.drain(..errors.len().saturating_sub(6));
        Some(Halt { summary, errors })
    }

    pub fn record_success(&mut self) {
        self.errors.clear();
    }

    pub fn reset(&mut self) {
        self.errors.clear();
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::TurnState;

    fn turn(content: &str, finish: Option<&str>) -> TurnRecord {
        TurnRecord {
            content: content.to_string(),
            raw_text: content.to_string(),
            finish_reason: finish.map(str::to_string),
            answer_started: !content.is_empty(),
            state: TurnState::ContentReady,
            ..Default::default()
        }
    }

    fn kind(decision: &TurnDecision) -> Option<RetryKind> {
        match decision {
            TurnDecision::Retry { kind, .. } => Some(*kind),
            TurnDecision::Final(_) => None,
        }
    }

    #[test]
    fn plain_loose_answer_is_final_with_tools_used() {
        let mut policy = RetryPolicy::new(RetryLimits::default(), ChatMode::Loose);
        let decision = policy.decide_turn(&turn("Paris.", Some("stop")), &ToolCatalog::new(), &["r2_open_file".to_string()]);
        assert_eq!(
            decision,
            TurnDecision::Final("Paris.\n\n## Tools Used\n- r2_open_file\n".to_string())
        );
    }

    #[test]
    fn rules_fire_in_priority_order() {
        let catalog = ToolCatalog::new();
        let mut policy = RetryPolicy::new(RetryLimits::default(), ChatMode::Loose);

        let mut leaked = turn("", Some("stop"));
        leaked.raw_text = "<|DSML|function_calls>".to_string();
        assert_eq!(kind(&policy.decide_turn(&leaked, &catalog, &[])), Some(RetryKind::LegacyMarkup));

        assert_eq!(
            kind(&policy.decide_turn(&turn("half", Some("length")), &catalog, &[])),
            Some(RetryKind::Truncated)
        );
        assert_eq!(
            kind(&policy.decide_turn(&turn("half", None), &catalog, &[])),
            Some(RetryKind::Unfinished)
        );

        let mut not_started = turn("", Some("stop"));
        not_started.raw_text = "<b>".to_string();
        assert_eq!(
            kind(&policy.decide_turn(&not_started, &catalog, &[])),
            Some(RetryKind::AnswerNotStarted)
        );

        let mut reasoning = turn("", Some("stop"));
        reasoning.reasoning_content = "thinking".to_string();
        reasoning.answer_started = true;
        assert_eq!(
            kind(&policy.decide_turn(&reasoning, &catalog, &[])),
            Some(RetryKind::ReasoningOnly)
        );

        assert_eq!(
            kind(&policy.decide_turn(&turn("output:\nr2> ", Some("stop")), &catalog, &[])),
            Some(RetryKind::DanglingPrompt)
        );
    }

    #[test]
    fn strict_mode_requires_tools_and_report() {
        let catalog = ToolCatalog::new();
        let mut policy = RetryPolicy::new(RetryLimits::default(), ChatMode::Strict);
        assert_eq!(
            kind(&policy.decide_turn(&turn("Let me run r2_open_file first.", Some("stop")), &catalog, &[])),
            Some(RetryKind::UnissuedToolUse)
        );
        assert_eq!(
            kind(&policy.decide_turn(&turn("It is a shared object.", Some("stop")), &catalog, &[])),
            Some(RetryKind::IncompleteReport)
        );
    }

    #[test]
    fn exhausted_budget_falls_through_to_final() {
        let limits = RetryLimits {
            missing_tool: 1,
            ..RetryLimits::default()
        };
        let mut policy = RetryPolicy::new(limits, ChatMode::Loose);
        let cut = turn("half", Some("length"));
        assert!(kind(&policy.decide_turn(&cut, &ToolCatalog::new(), &[])).is_some());
        assert_eq!(
            policy.decide_turn(&cut, &ToolCatalog::new(), &[]),
            TurnDecision::Final("half".to_string())
        );

        policy.on_tool_calls();
        assert!(kind(&policy.decide_turn(&cut, &ToolCatalog::new(), &[])).is_some());
    }

    #[test]
    fn empty_turn_gets_placeholder() {
        let mut policy = RetryPolicy::new(RetryLimits::default(), ChatMode::Loose);
        let empty = turn("", Some("stop"));
        assert_eq!(
            policy.decide_turn(&empty, &ToolCatalog::new(), &[]),
            TurnDecision::Final(EMPTY_ANSWER.to_string())
        );
    }

    #[test]
    fn batch_decisions_follow_outcome() {
        let mut policy = RetryPolicy::new(RetryLimits::default(), ChatMode::Loose);
        let sessions = BTreeSet::new();

        let mut partial = BatchOutcome::default();
        partial.record_success("r2_open_file");
        partial.recoverable_errors.push("termux_command: timed out".to_string());
        let (kind, prompt) = policy.decide_batch(&partial, &sessions).expect("partial retry");
        assert_eq!(kind, RetryKind::PartialRecoverable);
        assert!(prompt.contains("r2_open_file"));

        let full = BatchOutcome {
            recoverable_errors: vec!["x: boom".to_string()],
            ..Default::default()
        };
        assert_eq!(policy.decide_batch(&full, &sessions).map(|d| d.0), Some(RetryKind::Recoverable));

        let invalid = BatchOutcome {
            validation_errors: vec!["t: missing required parameter: path".to_string()],
            recoverable_errors: vec!["x: boom".to_string()],
            ..Default::default()
        };
        assert_eq!(policy.decide_batch(&invalid, &sessions).map(|d| d.0), Some(RetryKind::Validation));

        let mut ok = BatchOutcome::default();
        ok.record_success("t");
        assert!(policy.decide_batch(&ok, &sessions).is_none());
    }

    #[test]
    fn validation_budget_is_bounded_and_reset_by_success() {
        let limits = RetryLimits {
            validation: 2,
            ..RetryLimits::default()
        };
        let mut policy = RetryPolicy::new(limits, ChatMode::Loose);
        let sessions = BTreeSet::new();
        let invalid = BatchOutcome {
            validation_errors: vec!["t: bad".to_string()],
            ..Default::default()
        };
        assert!(policy.decide_batch(&invalid, &sessions).is_some());
        assert!(policy.decide_batch(&invalid, &sessions).is_some());
        assert!(policy.decide_batch(&invalid, &sessions).is_none());

        let mut ok = BatchOutcome::default();
        ok.record_success("t");
        assert!(policy.decide_batch(&ok, &sessions).is_none());
        assert!(policy.decide_batch(&invalid, &sessions).is_some());
    }

    #[test]
    fn fatal_streak_halts_on_fourth_error_and_restarts() {
        let mut streak = FatalStreak::default();
        assert!(streak.record_failure("t: e1").is_none());
        assert!(streak.record_failure("t: e2").is_none());
        streak.record_success();
        assert!(streak.is_empty());
        for i in 0..3 {
            assert!(streak.record_failure(format!("t: e{i}")).is_none());
        }
        let halt = streak.record_failure("t: e3").expect("halt");
        assert!(halt.summary.contains("automatic loop has stopped"));
        assert_eq!(halt.errors.len(), 4);
        assert!(streak.is_empty());
    }

    #[test]
    fn r2_prompt_detection() {
        assert!(ends_at_r2_prompt("r2>"));
        assert!(ends_at_r2_prompt("x\n  r2>  \n"));
        assert!(!ends_at_r2_prompt("see r2> output"));
    }
}
