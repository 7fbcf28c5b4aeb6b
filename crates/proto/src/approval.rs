//! Confirmation types for tool calls that the dangerous-command guard flags.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// User's decision on a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolApprovalDecision {
    /// Run this single tool call.
    Approve,
    /// Do not run this tool call.
    Reject,
}

/// A request for user confirmation before running a flagged command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolApprovalRequest {
    /// Tool-call identifier from the LLM.
    pub call_id: String,
    /// Name of the tool to be executed.
    pub tool_name: String,
    /// Shell command text that was flagged.
    pub command: String,
    /// Why the guard flagged the command (e.g. `rm -rf`).
    pub reason: String,
}

/// Handler for confirmation requests.
///
/// The runtime calls [`request_approval`](Self::request_approval) only when
/// the dangerous-command policy is `confirm` and the guard flagged the call.
/// The call is raced against the question's cancellation token, so an
/// implementation blocked on input is simply dropped on interrupt.
#[async_trait]
pub trait ToolApprovalHandler: Send + Sync {
    /// Asks the user and returns the decision.
    async fn request_approval(&self, req: ToolApprovalRequest) -> ToolApprovalDecision;
}

/// Approves every request without asking.
pub struct AutoApproveHandler;

#[async_trait]
impl ToolApprovalHandler for AutoApproveHandler {
    async fn request_approval(&self, _req: ToolApprovalRequest) -> ToolApprovalDecision {
        ToolApprovalDecision::Approve
    }
}

/// Rejects every request; used for non-interactive runs.
pub struct AutoRejectHandler;

#[async_trait]
impl ToolApprovalHandler for AutoRejectHandler {
    async fn request_approval(&self, _req: ToolApprovalRequest) -> ToolApprovalDecision {
        ToolApprovalDecision::Reject
    }
}
