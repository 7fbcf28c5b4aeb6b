//! Conversation-state engine: message log, stream decoding, retry policy
//! and the loop that drives a model against the tool bridge.

pub mod budget;
pub mod decoder;
pub mod guidance;
pub mod intent;
pub mod legacy;
pub mod llm;
pub mod policy;
pub mod prompt;
pub mod provider_cache;
pub mod report;
pub mod runtime;
pub mod sanitize;
pub mod store;
pub mod trace;

/// Context ceilings and the block-aware trimmer.
pub use budget::ContextLimits;
/// Streaming turn decoder types.
pub use decoder::{StreamDelta, TurnDecoder, TurnRecord, TurnState};
/// Model provider interface and the chat-completions implementation.
pub use llm::{ChatRequest, LlmProvider, OpenAiCompatProvider, ToolChoice, vendor_extra_options};
/// Retry ceilings and decisions.
pub use policy::{RetryKind, RetryLimits};
/// Shared provider factory.
pub use provider_cache::ProviderCache;
/// Main conversation loop.
pub use runtime::{AgentRuntime, LoopOutcome, RuntimeConfig};
/// Owned conversation log.
pub use store::MessageStore;
/// JSONL trace log.
pub use trace::{TraceEvent, TraceLog, TraceSink};
