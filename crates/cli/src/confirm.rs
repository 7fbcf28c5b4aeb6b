//! Terminal confirmation for commands the dangerous-command guard flags.

use std::io::{self, BufRead, Write};

use async_trait::async_trait;
use proto::{ToolApprovalDecision, ToolApprovalHandler, ToolApprovalRequest};
use tracing::warn;

/// Asks `y/N` on the terminal. Anything but an explicit yes rejects.
pub struct StdinApproval;

/// Whether an answer line means yes.
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Prompt shown before reading the answer.
pub fn approval_prompt(req: &ToolApprovalRequest) -> String {
    format!(
        "\n[!] Dangerous command flagged ({reason})\n    tool: {tool}\n    command: {command}\nRun it? [y/N] ",
        reason = req.reason,
        tool = req.tool_name,
        command = req.command,
    )
}

#[async_trait]
impl ToolApprovalHandler for StdinApproval {
    async fn request_approval(&self, req: ToolApprovalRequest) -> ToolApprovalDecision {
        let prompt = approval_prompt(&req);
        let answer = tokio::task::spawn_blocking(move || -> io::Result<String> {
            let mut stderr = io::stderr().lock();
            stderr.write_all(prompt.as_bytes())?;
            stderr.flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await;

        match answer {
            Ok(Ok(line)) if is_affirmative(&line) => ToolApprovalDecision::Approve,
            Ok(Ok(_)) => ToolApprovalDecision::Reject,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to read confirmation, rejecting");
                ToolApprovalDecision::Reject
            }
            Err(e) => {
                warn!(error = %e, "Confirmation task failed, rejecting");
                ToolApprovalDecision::Reject
            }
        }
    }
}
