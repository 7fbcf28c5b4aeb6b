//! Corrective instructions injected after failed tool batches.

use std::collections::BTreeSet;

const MAX_HINTS: usize = 6;

struct Hint {
    keywords: &'static [&'static str],
    /// Extra keywords that must also appear, when non-empty.
    also: &'static [&'static str],
    text: &'static str,
}

const RECOVERABLE_HINTS: &[Hint] = &[
    Hint {
        keywords: &["no such file", "enoent", "not found", "does not exist", "file not found"],
        also: &[],
        text: "Path or file does not exist: run pwd and ls/stat through termux_command to confirm the real path, then retry the r2_* tool.",
    },
    Hint {
        keywords: &["permission denied", "eacces", "operation not permitted"],
        also: &[],
        text: "Permission problem: prefer a readable directory (/storage/emulated/0/... or $HOME); suggest termux-setup-storage or chmod to the user if needed.",
    },
    Hint {
        keywords: &["session"],
        also: &["invalid", "not found", "closed", "expired"],
        text: "Session is invalid: call r2_open_file again to get a fresh session_id before r2_run_command or r2_analyze_target.",
    },
    Hint {
        keywords: &["timeout", "timed out", "connection", "temporar", "gateway", "502", "503", "504"],
        also: &[],
        text: "Network or gateway hiccup: retry the same tool calls; if it persists, check health before calling tools again.",
    },
    Hint {
        keywords: &["invalid json", "json", "decode"],
        also: &["http"],
        text: "The bridge returned non-JSON: check the bridge logs or its health endpoint, then retry.",
    },
];

const FATAL_HINTS: &[Hint] = &[
    Hint {
        keywords: &["401", "403", "unauthorized", "forbidden", "api key", "invalid key", "auth"],
        also: &[],
        text: "Authentication failed: check the API key and base URL, and make sure no proxy is blocking the request.",
    },
    Hint {
        keywords: &["429", "rate limit", "too many requests"],
        also: &[],
        text: "Rate limited: wait a moment before retrying, or switch model or quota.",
    },
    Hint {
        keywords: &["500", "internal server error", "502", "503", "504", "gateway"],
        also: &[],
        text: "Server or gateway failure: check bridge health first, then retry tools/list or the tool calls.",
    },
    Hint {
        keywords: &["schema", "validation failed", "required", "additionalproperties"],
        also: &[],
        text: "Parameter or schema problem: list the tools to confirm the inputSchema and supply every required field.",
    },
    Hint {
        keywords: &["permission denied", "eacces", "operation not permitted"],
        also: &[],
        text: "Permission problem: confirm Termux storage access (termux-setup-storage) or use a readable path under /storage/emulated/0/.",
    },
    Hint {
        keywords: &["no such file", "enoent", "not found", "does not exist"],
        also: &[],
        text: "Path does not exist: confirm it with ls/stat/pwd through termux_command, then retry with the correct path.",
    },
];

fn matching_hints(hints: &[Hint], errors: &[String]) -> Vec<String> {
    let blob = errors.join("\n").to_lowercase();
    if blob.trim().is_empty() {
        return Vec::new();
    }
    hints
        .iter()
        .filter(|h| h.keywords.iter().any(|k| blob.contains(k)))
        .filter(|h| h.also.is_empty() || h.also.iter().any(|k| blob.contains(k)))
        .map(|h| h.text.to_string())
        .collect()
}

fn render(title: &str, mut hints: Vec<String>) -> String {
    if hints.is_empty() {
        return String::new();
    }
    hints.truncate(MAX_HINTS);
    let lines: Vec<String> = hints.iter().map(|h| format!("- {h}")).collect();
    format!("{title}\n{}", lines.join("\n"))
}

fn bullet_list(items: &[String], limit: usize) -> String {
    items
        .iter()
        .take(limit)
        .map(|e| format!("- {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fix-up advice for recoverable errors; known session ids are offered for reuse.
pub fn recoverable_guidance(errors: &[String], session_ids: &BTreeSet<String>) -> String {
    if errors.iter().all(|e| e.trim().is_empty()) {
        return String::new();
    }
    let mut hints = matching_hints(RECOVERABLE_HINTS, errors);
    if !session_ids.is_empty() {
        let known: Vec<&str> = session_ids.iter().take(4).map(String::as_str).collect();
        hints.push(format!("Known session_id values you may reuse: {}", known.join(", ")));
    }
    render("Suggested fixes:", hints)
}

/// Likely causes for errors that are not marked recoverable.
pub fn fatal_guidance(errors: &[String]) -> String {
    render("Likely causes and suggestions:", matching_hints(FATAL_HINTS, errors))
}

/// Instruction after a batch with recoverable failures.
///
/// `partial` means some calls in the batch succeeded; the model is told not
/// to repeat them.
pub fn recoverable_prompt(
    success_tools: &[String],
    errors: &[String],
    partial: bool,
    session_ids: &BTreeSet<String>,
) -> String {
    let guidance = recoverable_guidance(errors, session_ids);
    let guidance = if guidance.is_empty() {
        String::new()
    } else {
        format!("\n\n{guidance}")
    };

    if partial {
        let ok_list = if success_tools.is_empty() {
            "(none)".to_string()
        } else {
            success_tools.iter().take(8).cloned().collect::<Vec<_>>().join(", ")
        };
        return format!(
            "Some of your tool calls already succeeded; do not repeat them unless you can state why a repeat is required.\n\
             Succeeded this round (do not repeat): {ok_list}\n\
             Recoverable failures this round (fix and resend tool calls for these only):\n\
             {}{guidance}\n\n\
             Requirements: emit structured tool calls directly; no marker text, no verbal plan, no final report.\n",
            bullet_list(errors, 8)
        );
    }

    format!(
        "Your tool calls returned recoverable errors (recoverable=true), so the task is not finished.\n\
         Do not write a final report or conclusion; fix the calls and resend structured tool calls only.\n\
         Recoverable errors this round:\n\
         {}{guidance}\n\n\
         Hard requirement: if you need a session_id, take it from earlier tool output or call r2_open_file again; never guess one.\n",
        bullet_list(errors, 6)
    )
}

/// Instruction after a batch where every call failed schema validation.
pub fn validation_prompt(errors: &[String]) -> String {
    format!(
        "Some of your tool calls failed schema validation (missing required field, wrong type or undefined parameter). Fix them and resend the tool calls.\n\
         Requirements:\n\
         - Follow the inputSchema from tools/list exactly; supply every required field, required strings must be non-empty, no extra fields.\n\
         - Emit structured tool calls directly; no marker text and no verbal plan.\n\
         Validation errors this round:\n\
         {}",
        bullet_list(errors, 6)
    )
}

/// Final text when the loop halts after consecutive fatal tool errors.
pub fn halt_summary(errors: &[String]) -> String {
    let recent_start = errors.len().saturating_sub(3);
    let mut text = format!(
        "Tool calls failed repeatedly; the automatic loop has stopped.\nRecent errors:\n{}",
        bullet_list(&errors[recent_start..], 3)
    );
    let guidance_start = errors.len().saturating_sub(6);
    let guidance = fatal_guidance(&errors[guidance_start..]);
    if !guidance.is_empty() {
        text.push_str("\n\n");
        text.push_str(&guidance);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn recoverable_guidance_matches_keywords_and_lists_sessions() {
        let sessions: BTreeSet<String> = ["session_a".to_string()].into_iter().collect();
        let text = recoverable_guidance(&errs(&["r2_open_file: No such file or directory"]), &sessions);
        assert!(text.starts_with("Suggested fixes:"));
        assert!(text.contains("Path or file does not exist"));
        assert!(text.contains("session_a"));
    }

    #[test]
    fn session_hint_needs_failure_word() {
        let none = BTreeSet::new();
        let text = recoverable_guidance(&errs(&["r2_run_command: session expired"]), &none);
        assert!(text.contains("Session is invalid"));
        assert!(recoverable_guidance(&errs(&["session ok but odd"]), &none).is_empty());
        assert!(recoverable_guidance(&[], &none).is_empty());
    }

    #[test]
    fn fatal_guidance_classifies_auth_and_gateway() {
        let text = fatal_guidance(&errs(&["HTTP 401: unauthorized", "HTTP 502: bad gateway"]));
        assert!(text.contains("Authentication failed"));
        assert!(text.contains("Server or gateway failure"));
        assert!(fatal_guidance(&errs(&["weird"])).is_empty());
    }

    #[test]
    fn partial_prompt_lists_successful_tools() {
        let prompt = recoverable_prompt(
            &errs(&["r2_open_file"]),
            &errs(&["termux_command: timed out"]),
            true,
            &BTreeSet::new(),
        );
        assert!(prompt.contains("do not repeat): r2_open_file"));
        assert!(prompt.contains("- termux_command: timed out"));
        assert!(prompt.contains("Network or gateway hiccup"));

        let full = recoverable_prompt(&[], &errs(&["x: boom"]), false, &BTreeSet::new());
        assert!(full.contains("recoverable=true"));
        assert!(full.contains("- x: boom"));
    }

    #[test]
    fn halt_summary_uses_last_three_errors() {
        let errors = errs(&["t: e1", "t: e2", "t: e3", "t: HTTP 503 gateway"]);
        let text = halt_summary(&errors);
        assert!(!text.contains("e1"));
        assert!(text.contains("- t: e2"));
        assert!(text.contains("- t: HTTP 503 gateway"));
        assert!(text.contains("Likely causes"));
    }

    #[test]
    fn validation_prompt_caps_error_list() {
        let errors: Vec<String> = (0..10).map(|i| format!("t{i}: missing required")).collect();
        let prompt = validation_prompt(&errors);
        assert!(prompt.contains("t5"));
        assert!(!prompt.contains("t6"));
    }
}
