//! Block-aware trimming of the conversation log to its count and size ceilings.

use proto::Message;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::sanitize::sanitize;

/// Ceilings applied before every model request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextLimits {
    /// Maximum number of messages, system prompt included.
    pub max_messages: usize,
    /// Maximum total serialized size in characters.
    pub max_chars: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_messages: 40,
            max_chars: 140_000,
        }
    }
}

/// Shrinks `messages` until both ceilings hold.
///
/// Message 0 is the system prompt and is never removed. Count trimming keeps
/// the newest `max_messages - 1` messages; size trimming then drops whole
/// atomic blocks (an assistant with tool calls plus its tool results) from the
/// oldest end, always keeping the newest block even when it alone exceeds the
/// budget.
pub fn trim(messages: Vec<Message>, max_messages: usize, max_chars: usize) -> Vec<Message> {
    let mut messages = messages;
    if messages.len() <= 1 {
        return messages;
    }

    let max_messages = max_messages.max(2);
    if messages.len() > max_messages {
        let mut tail = messages.split_off(messages.len() - (max_messages - 1));
        messages.truncate(1);
        let leading_tools = tail.iter().take_while(|m| m.is_tool()).count();
        tail.drain(..leading_tools);
        messages.extend(tail);
    }

    let total: usize = messages.iter().map(Message::serialized_len).sum();
    if total <= max_chars {
        return messages;
    }

    let mut rest = messages.split_off(1);
    let system_len = messages[0].serialized_len();
    let mut blocks = split_blocks(&mut rest);

    let mut kept_len = system_len;
    let mut keep_from = blocks.len();
    for (idx, block) in blocks.iter().enumerate().rev() {
        let size: usize = block.iter().map(Message::serialized_len).sum();
        if keep_from < blocks.len() && kept_len + size > max_chars {
            break;
        }
        kept_len += size;
        keep_from = idx;
    }

    let mut tail: Vec<Message> = blocks.drain(keep_from..).flatten().collect();
    let leading_tools = tail.iter().take_while(|m| m.is_tool()).count();
    tail.drain(..leading_tools);
    messages.extend(tail);
    sanitize(messages)
}

/// Partitions `rest` into atomic blocks, leaving it empty.
fn split_blocks(rest: &mut Vec<Message>) -> Vec<Vec<Message>> {
    let mut blocks: Vec<Vec<Message>> = Vec::new();
    for msg in rest.drain(..) {
        let joins_block = msg.is_tool()
            && blocks
                .last()
                .and_then(|b| b.first())
                .is_some_and(Message::has_tool_calls);
        match blocks.last_mut() {
            Some(block) if joins_block => block.push(msg),
            _ => blocks.push(vec![msg]),
        }
    }
    blocks
}

/// Sanitizes and trims, logging when anything was removed.
pub fn enforce(messages: Vec<Message>, limits: ContextLimits) -> Vec<Message> {
    let before_len = messages.len();
    let before_chars: usize = messages.iter().map(Message::serialized_len).sum();
    let out = trim(sanitize(messages), limits.max_messages, limits.max_chars);
    if out.len() != before_len {
        let after_chars: usize = out.iter().map(Message::serialized_len).sum();
        warn!(
            before_messages = before_len,
            after_messages = out.len(),
            before_chars = before_chars,
            after_chars = after_chars,
            "Trimmed conversation history"
        );
    }
    out
}
