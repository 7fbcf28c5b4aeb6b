//! Tool-result shaping: error normalization and size compaction.
//!
//! Bridge answers can be arbitrarily large (shell output, disassembly dumps).
//! Everything here keeps them readable for the model while staying inside the
//! per-result character budget. Sizes are counted in chars, not bytes.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value, json};

use crate::SHELL_TOOL;

/// Shell output fields longer than this get a keyword excerpt.
const SHELL_EXCERPT_THRESHOLD: usize = 2_000;
/// Any string field longer than this is compacted.
const OVERSIZED_STRING_CHARS: usize = 20_000;
const MAX_KEYWORD_HITS: usize = 20;
const KEYWORD_CONTEXT_LINES: usize = 3;
const SHELL_OUTPUT_KEYS: &[&str] = &["stdout", "stderr", "output", "text", "result"];
/// Share of the budget kept from the head when splitting text.
const HEAD_SHARE_PERCENT: usize = 65;

/// Line and char limits for [`compact_text_output`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactLimits {
    pub head_lines: usize,
    pub tail_lines: usize,
    pub max_chars: usize,
}

impl Default for CompactLimits {
    fn default() -> Self {
        Self {
            head_lines: 40,
            tail_lines: 80,
            max_chars: 12_000,
        }
    }
}

fn failure_keywords() -> Option<&'static Regex> {
    static KEYWORDS: OnceLock<Option<Regex>> = OnceLock::new();
    KEYWORDS
        .get_or_init(|| {
            Regex::new(r"(?i)(traceback|exception|error|fatal|failed|permission denied|no such file|not found)").ok()
        })
        .as_ref()
}

fn head_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn tail_chars(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let total = text.chars().count();
    if n >= total {
        return text;
    }
    match text.char_indices().nth(total - n) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

fn split_head_tail(text: &str, max_chars: usize, label: &str) -> String {
    let total = text.chars().count();
    let keep_head = max_chars * HEAD_SHARE_PERCENT / 100;
    let keep_tail = max_chars - keep_head;
    format!(
        "{}\n...({label}: {total} chars total; kept head {keep_head} + tail {keep_tail})...\n{}",
        head_chars(text, keep_head),
        tail_chars(text, keep_tail)
    )
}

/// Shortens long text: a head/tail line window first, then a 65/35 char split.
pub fn compact_text_output(text: &str, limits: CompactLimits) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    if normalized.is_empty() {
        return normalized;
    }
    let mut current = normalized.clone();
    let lines: Vec<&str> = normalized.split('\n').collect();
    if lines.len() > limits.head_lines + limits.tail_lines + 10 {
        let omitted = lines.len() - limits.head_lines - limits.tail_lines;
        let windowed = format!(
            "{}\n...({omitted} lines omitted)...\n{}",
            lines[..limits.head_lines].join("\n"),
            lines[lines.len() - limits.tail_lines..].join("\n")
        );
        if windowed.chars().count() <= limits.max_chars {
            return windowed;
        }
        current = windowed;
    }
    if current.chars().count() > limits.max_chars {
        return split_head_tail(&current, limits.max_chars, "output truncated");
    }
    current
}

/// Keeps the lines around failure keywords, or compacts the whole text when
/// none match.
fn shell_excerpt(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = normalized.split('\n').collect();
    let hits: Vec<usize> = match failure_keywords() {
        Some(re) => lines
            .iter()
            .enumerate()
            .filter(|(_, line)| re.is_match(line))
            .map(|(i, _)| i)
            .take(MAX_KEYWORD_HITS)
            .collect(),
        None => Vec::new(),
    };
    if hits.is_empty() {
        return compact_text_output(text, CompactLimits::default());
    }
    let mut keep = vec![false; lines.len()];
    for hit in hits {
        let start = hit.saturating_sub(KEYWORD_CONTEXT_LINES);
        let end = (hit + KEYWORD_CONTEXT_LINES + 1).min(lines.len());
        keep[start..end].iter_mut().for_each(|k| *k = true);
    }
    let excerpt = lines
        .iter()
        .zip(keep)
        .filter(|(_, k)| *k)
        .map(|(line, _)| *line)
        .collect::<Vec<_>>()
        .join("\n");
    compact_text_output(
        excerpt.trim(),
        CompactLimits {
            head_lines: 80,
            tail_lines: 80,
            max_chars: 12_000,
        },
    )
}

fn compact_oversized_strings(map: &mut Map<String, Value>) {
    for value in map.values_mut() {
        if let Value::String(s) = value
            && s.chars().count() > OVERSIZED_STRING_CHARS
        {
            *s = compact_text_output(s, CompactLimits::default());
        }
    }
}

/// Compacts an object-shaped tool result. Non-objects pass through.
///
/// Shell output fields get a keyword excerpt, then every oversized string at
/// the top level and inside a nested `raw` object is compacted.
pub fn compact_tool_result(tool_name: &str, result: Value) -> Value {
    let Value::Object(mut out) = result else {
        return result;
    };
    if tool_name == SHELL_TOOL {
        for key in SHELL_OUTPUT_KEYS {
            if let Some(Value::String(s)) = out.get_mut(*key)
                && s.chars().count() > SHELL_EXCERPT_THRESHOLD
            {
                *s = shell_excerpt(s);
            }
        }
    }
    compact_oversized_strings(&mut out);
    if let Some(Value::Object(raw)) = out.get_mut("raw") {
        compact_oversized_strings(raw);
    }
    Value::Object(out)
}

/// Splits serialized tool content that exceeds `max_chars` into head and tail.
pub fn truncate_tool_content(content: String, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content;
    }
    split_head_tail(&content, max_chars, "tool result truncated")
}

/// Extracts a tool-level error message from a bridge response, if any.
///
/// Recognizes a top-level string `error`, a string `result` starting with
/// `ERROR:`, and an MCP `result` with `isError: true` (text of up to three
/// content items, or the whole result as JSON).
pub fn extract_error_text(resp: &Value) -> Option<String> {
    let obj = resp.as_object()?;
    if let Some(err) = obj.get("error").and_then(Value::as_str)
        && !err.trim().is_empty()
    {
        return Some(err.trim().to_string());
    }
    match obj.get("result") {
        Some(Value::String(s)) if s.starts_with("ERROR:") => Some(s.clone()),
        Some(inner @ Value::Object(inner_obj)) if inner_obj.get("isError") == Some(&Value::Bool(true)) => {
            let texts: Vec<&str> = inner_obj
                .get("content")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .take(3)
                        .filter_map(|item| item.get("text").and_then(Value::as_str))
                        .collect()
                })
                .unwrap_or_default();
            if texts.is_empty() {
                Some(inner.to_string())
            } else {
                Some(texts.join("\n").trim().to_string())
            }
        }
        _ => None,
    }
}

fn flagged_recoverable(resp: &Value) -> bool {
    let flag = |v: &Value| v.get("recoverable") == Some(&Value::Bool(true));
    flag(resp) || resp.get("result").is_some_and(flag)
}

/// Rewrites a tool-level error response into
/// `{error, recoverable, tool_name, arguments, raw}`; other results are
/// returned unchanged.
pub fn normalize_result(tool_name: &str, arguments: &Value, result: Value) -> Value {
    let Some(error) = extract_error_text(&result) else {
        return result;
    };
    let recoverable = flagged_recoverable(&result);
    json!({
        "error": error,
        "recoverable": recoverable,
        "tool_name": tool_name,
        "arguments": arguments,
        "raw": compact_tool_result(tool_name, result),
    })
}

/// Result recorded when the bridge itself failed (transport, HTTP, JSON-RPC).
pub fn bridge_failure(tool_name: &str, arguments: &Value, error: &proto::BridgeError) -> Value {
    json!({
        "error": error.to_string(),
        "tool_name": tool_name,
        "arguments": arguments,
    })
}
