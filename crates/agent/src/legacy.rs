//! Recovery of tool calls that a model wrote as `<｜DSML｜invoke>` text
//! instead of emitting structured tool calls.

use std::sync::OnceLock;

use proto::ToolCall;
use regex::Regex;
use serde_json::{Map, Value};

const LITERAL_MARKERS: &[&str] = &["<｜DSML｜", "<|DSML|", "</｜DSML｜", "</|DSML|"];

struct Patterns {
    marker: Regex,
    invoke: Regex,
    invoke_name: Regex,
    parameter: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                marker: Regex::new(r"(?i)<[|｜]DSML[|｜](invoke|parameter)\b").ok()?,
                invoke: Regex::new(
                    r#"(?i)<[|｜]DSML[|｜]invoke\s+name="([^"]+)"\s*>([\s\S]*?)</[|｜]DSML[|｜]invoke>"#,
                )
                .ok()?,
                invoke_name: Regex::new(r#"(?i)<[|｜]DSML[|｜]invoke[^>]*\sname="([^"]+)""#).ok()?,
                parameter: Regex::new(
                    r#"(?i)<[|｜]DSML[|｜]parameter\s+name="([^"]+)"[^>]*>([\s\S]*?)</[|｜]DSML[|｜]parameter>"#,
                )
                .ok()?,
            })
        })
        .as_ref()
}

/// Whether `text` carries any legacy marker.
pub fn contains_marker(text: &str) -> bool {
    if LITERAL_MARKERS.iter().any(|m| text.contains(m)) {
        return true;
    }
    patterns().is_some_and(|p| p.marker.is_match(text))
}

/// Extracts tool calls from legacy marker text.
///
/// Complete `invoke` blocks become one call each with ids
/// `dsml_{batch}_0`, `dsml_{batch}_1` and so on, where `batch` is fresh per
/// call of this function so ids never repeat across turns. When no block is
/// complete, the first `invoke` name plus every complete `parameter` in the
/// text yields a single `dsml_{batch}_0` call.
/// Parameter values are kept as trimmed strings.
pub fn parse_legacy_calls(text: &str) -> Vec<ToolCall> {
    let content = text.trim();
    let Some(p) = patterns() else {
        return Vec::new();
    };
    if content.is_empty() {
        return Vec::new();
    }

    let batch = uuid::Uuid::new_v4().simple().to_string();
    let calls: Vec<ToolCall> = p
        .invoke
        .captures_iter(content)
        .enumerate()
        .map(|(n, caps)| {
            let name = caps.get(1).map_or("", |m| m.as_str()).trim();
            let body = caps.get(2).map_or("", |m| m.as_str());
            ToolCall::new(format!("dsml_{batch}_{n}"), name, collect_parameters(&p.parameter, body))
        })
        .collect();
    if !calls.is_empty() {
        return calls;
    }

    if !content.contains("DSML") && !content.contains("dsml") {
        return Vec::new();
    }
    let Some(name) = p
        .invoke_name
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
    else {
        return Vec::new();
    };
    vec![ToolCall::new(format!("dsml_{batch}_0"), name, collect_parameters(&p.parameter, content))]
}

fn collect_parameters(parameter: &Regex, body: &str) -> String {
    let mut args = Map::new();
    for caps in parameter.captures_iter(body) {
        let key = caps.get(1).map_or("", |m| m.as_str()).trim();
        let value = caps.get(2).map_or("", |m| m.as_str()).trim();
        args.insert(key.to_string(), Value::String(value.to_string()));
    }
    Value::Object(args).to_string()
}
