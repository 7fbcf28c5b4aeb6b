//! Tool bridge client and the checks applied before a tool call leaves the agent.
//!
//! The agent runtime never executes tools itself: every call is forwarded to an
//! external bridge over JSON-RPC. This crate holds that client plus the
//! argument validator, the dangerous-command guard, and result compaction.

pub mod bridge;
pub mod compact;
pub mod guard;
pub mod session_ids;
pub mod validator;

pub use bridge::HttpBridge;
pub use compact::{
    CompactLimits, bridge_failure, compact_text_output, compact_tool_result, extract_error_text,
    normalize_result, truncate_tool_content,
};
pub use guard::{CommandGuard, DangerPolicy, Verdict, classify, command_from_args};
pub use session_ids::extract_session_ids;
pub use validator::{ValidationError, validate};

use async_trait::async_trait;
use proto::{BridgeError, ToolCatalog};
use serde_json::Value;

/// Name of the shell tool the dangerous-command guard applies to.
pub const SHELL_TOOL: &str = "termux_command";

/// Tool used to release bridge-side analysis sessions.
pub const CLOSE_SESSION_TOOL: &str = "r2_close_session";

/// Remote tool endpoint the agent talks to.
#[async_trait]
pub trait ToolBridge: Send + Sync {
    /// Raw `tools/list` JSON-RPC response.
    async fn list_tools(&self) -> Result<Value, BridgeError>;
    /// Raw `tools/call` JSON-RPC response for one invocation.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, BridgeError>;
    /// Plain-text health line.
    async fn health(&self) -> Result<String, BridgeError>;
}

/// Fetches `tools/list` and builds the session catalog from its `result`.
pub async fn load_catalog(bridge: &dyn ToolBridge) -> Result<ToolCatalog, BridgeError> {
    let resp = bridge.list_tools().await?;
    let result = resp.get("result").unwrap_or(&resp);
    Ok(ToolCatalog::from_tools_list(result))
}
