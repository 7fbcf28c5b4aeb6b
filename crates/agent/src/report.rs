//! Final-report shape checks for strict mode.

/// Headings a strict-mode answer must contain, in order of appearance.
pub const REPORT_HEADINGS: [&str; 3] = ["## Findings", "## Evidence", "## Next Steps"];

const MIN_SECTION_CHARS: usize = 20;
const EVIDENCE_MARKERS: &[&str] = &["session_", "r2_", "termux", "tool", "command"];
const TOOLS_USED_HEADING: &str = "## Tools Used";

/// Body of the `## <name>` section, up to the next `##` heading.
fn section<'a>(lines: &[&'a str], name: &str) -> Option<Vec<&'a str>> {
    let start = lines.iter().position(|line| {
        line.strip_prefix("##")
            .filter(|rest| rest.starts_with(char::is_whitespace))
            .is_some_and(|rest| rest.trim() == name)
    })?;
    Some(
        lines[start + 1..]
            .iter()
            .take_while(|line| !line.trim_start().starts_with("##"))
            .copied()
            .collect(),
    )
}

/// Whether `text` is a complete strict-mode report.
///
/// Every heading must be present with at least 20 characters of body, and
/// the evidence must point at a session, a tool or a command.
pub fn looks_like_final_report(text: &str) -> bool {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let normalized = normalized.trim();
    if normalized.is_empty() || !REPORT_HEADINGS.iter().all(|h| normalized.contains(h)) {
        return false;
    }
    let lines: Vec<&str> = normalized.lines().collect();
    let mut bodies = Vec::with_capacity(REPORT_HEADINGS.len());
    for heading in REPORT_HEADINGS {
        let name = heading.trim_start_matches('#').trim();
        let body = section(&lines, name)
            .map(|l| l.join("\n").trim().to_string())
            .unwrap_or_default();
        if body.chars().count() < MIN_SECTION_CHARS {
            return false;
        }
        bodies.push(body);
    }
    let evidence = bodies[1].to_lowercase();
    EVIDENCE_MARKERS.iter().any(|m| evidence.contains(m))
}

/// Appends a `## Tools Used` list; returns `text` unchanged when `tools` is empty.
pub fn append_tools_used(text: &str, tools: &[String]) -> String {
    if tools.is_empty() {
        return text.to_string();
    }
    let list: Vec<String> = tools.iter().map(|t| format!("- {t}")).collect();
    format!("{}\n\n{TOOLS_USED_HEADING}\n{}\n", text.trim(), list.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "## Findings\nThe library exports a JNI_OnLoad entry point.\n\n\
## Evidence\nr2_run_command on session_1 listed the exports.\n\n\
## Next Steps\nDisassemble JNI_OnLoad and trace RegisterNatives.";

    #[test]
    fn accepts_complete_report() {
        assert!(looks_like_final_report(GOOD));
        assert!(looks_like_final_report(&GOOD.replace('\n', "\r\n")));
    }

    #[test]
    fn rejects_missing_or_short_sections() {
        assert!(!looks_like_final_report("## Findings\nonly one section here, long enough"));
        let short = GOOD.replace("Disassemble JNI_OnLoad and trace RegisterNatives.", "tbd");
        assert!(!looks_like_final_report(&short));
    }

    #[test]
    fn evidence_must_reference_a_source() {
        let vague = GOOD.replace(
            "r2_run_command on session_1 listed the exports.",
            "It seemed obvious from reading about it online.",
        );
        assert!(!looks_like_final_report(&vague));
        let tool = GOOD.replace(
            "r2_run_command on session_1 listed the exports.",
            "The Tool output listed every export symbol.",
        );
        assert!(looks_like_final_report(&tool));
    }

    #[test]
    fn tools_used_block_is_appended() {
        let out = append_tools_used("answer\n", &["r2_open_file".to_string(), "termux_command".to_string()]);
        assert_eq!(out, "answer\n\n## Tools Used\n- r2_open_file\n- termux_command\n");
        assert_eq!(append_tools_used("answer", &[]), "answer");
    }
}
