//! Protocol repair for the conversation log.
//!
//! Chat-completions endpoints reject a request when a `tool` message does not
//! answer a preceding assistant tool call, or when a tool call is left
//! unanswered. Interrupts, trimming and imported sessions can all leave the
//! log in such a state; [`sanitize`] brings it back.

use std::collections::HashSet;

use proto::{Message, ToolCall};
use tracing::debug;

/// Re-establishes tool-call pairing without reordering retained messages.
///
/// - orphan `tool` messages are dropped;
/// - nameless tool calls are discarded and missing ids are fabricated as
///   `fixup_{position}_{index}`;
/// - a call survives only when exactly one message in the tool run right after
///   it carries its id;
/// - an assistant left with no calls and no text is dropped with its run.
///
/// Running it twice yields the same log.
pub fn sanitize(messages: Vec<Message>) -> Vec<Message> {
    let mut cleaned: Vec<Message> = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();

    while let Some(msg) = iter.next() {
        let (content, reasoning_content, tool_calls) = match msg {
            Message::Tool { tool_call_id, .. } => {
                debug!(tool_call_id = %tool_call_id, "Dropping orphan tool message");
                continue;
            }
            Message::Assistant {
                content,
                reasoning_content,
                tool_calls,
            } if !tool_calls.is_empty() => (content, reasoning_content, tool_calls),
            other => {
                cleaned.push(other);
                continue;
            }
        };

        let position = cleaned.len();
        let mut calls: Vec<ToolCall> = Vec::with_capacity(tool_calls.len());
        for (index, mut call) in tool_calls.into_iter().enumerate() {
            if call.name.trim().is_empty() {
                continue;
            }
            call.id = call.id.trim().to_string();
            if call.id.is_empty() {
                call.id = format!("fixup_{position}_{index}");
            }
            if calls.iter().any(|c| c.id == call.id) {
                continue;
            }
            calls.push(call);
        }

        let mut run: Vec<Message> = Vec::new();
        while iter.peek().is_some_and(Message::is_tool) {
            if let Some(tool_msg) = iter.next() {
                run.push(tool_msg);
            }
        }

        let answered: HashSet<String> = calls
            .iter()
            .filter(|call| run.iter().filter(|m| answers(m, &call.id)).count() == 1)
            .map(|call| call.id.clone())
            .collect();
        calls.retain(|call| answered.contains(&call.id));

        let blank = content.trim().is_empty()
            && reasoning_content
                .as_deref()
                .is_none_or(|r| r.trim().is_empty());
        if calls.is_empty() && blank {
            debug!(dropped_tool_messages = run.len(), "Dropping empty assistant turn");
            continue;
        }

        cleaned.push(Message::Assistant {
            content,
            reasoning_content,
            tool_calls: calls,
        });
        cleaned.extend(
            run.into_iter()
                .filter(|m| tool_call_id(m).is_some_and(|id| answered.contains(id))),
        );
    }
    cleaned
}

fn tool_call_id(msg: &Message) -> Option<&str> {
    match msg {
        Message::Tool { tool_call_id, .. } => Some(tool_call_id.trim()),
        _ => None,
    }
}

fn answers(msg: &Message, id: &str) -> bool {
    tool_call_id(msg) == Some(id)
}
