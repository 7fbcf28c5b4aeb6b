//! Harvests bridge session ids from tool results.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

const SESSION_PREFIX: &str = "session_";

fn session_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"session_[A-Za-z0-9_]+").ok())
        .as_ref()
}

/// Collects every `session_...` id found anywhere in `value`.
///
/// Matches `session_id` fields whose value carries the prefix and any
/// `session_<word>` token inside string values.
pub fn extract_session_ids(value: &Value) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    visit(value, &mut found);
    found
}

fn visit(value: &Value, found: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "session_id"
                    && let Some(id) = child.as_str()
                    && id.starts_with(SESSION_PREFIX)
                {
                    found.insert(id.to_string());
                }
                visit(child, found);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| visit(item, found)),
        Value::String(text) => {
            if let Some(re) = session_pattern() {
                found.extend(re.find_iter(text).map(|m| m.as_str().to_string()));
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_ids_in_fields_and_text() {
        let value = json!({
            "result": {
                "session_id": "session_abc",
                "content": [{"type": "text", "text": "opened session_42 for /a.so"}]
            },
            "other": [{"session_id": "not-a-session"}]
        });
        let ids = extract_session_ids(&value);
        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec!["session_42".to_string(), "session_abc".to_string()]
        );
    }

    #[test]
    fn empty_for_scalars_without_ids() {
        assert!(extract_session_ids(&json!(42)).is_empty());
        assert!(extract_session_ids(&json!("no ids here")).is_empty());
    }
}
