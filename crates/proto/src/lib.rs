//! Shared protocol types for the agent runtime, the tool bridge and the CLI.
//!
//! This crate defines the serializable conversation model, the tool catalog,
//! session snapshots, progress events and strongly-typed error enums shared
//! across the workspace.

pub mod approval;
pub mod error;
pub mod event;
pub mod message;
pub mod session;
pub mod tool;

/// Re-export of confirmation handler types.
pub use approval::{
    AutoApproveHandler, AutoRejectHandler, ToolApprovalDecision, ToolApprovalHandler,
    ToolApprovalRequest,
};
/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of progress event types.
pub use event::ProgressEvent;
/// Re-export of conversation message types.
pub use message::{ChatMode, Message, Role, ToolCall};
/// Re-export of session snapshot type.
pub use session::SessionSnapshot;
/// Re-export of tool catalog types.
pub use tool::{ParamType, ToolCatalog, ToolSpec};
