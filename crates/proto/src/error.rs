use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading/validation error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// LLM provider error.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Tool bridge transport/protocol error.
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Tool lookup/execution error.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Session export/import error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Internal protocol type error.
    #[error("Proto error: {0}")]
    Proto(#[from] ProtoError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// LLM provider errors
#[derive(Debug, Error)]
pub enum LlmError {
    /// Remote API failure.
    #[error("{0}")]
    Api(String),

    /// Provider throttled the request.
    #[error("Rate limit exceeded")]
    RateLimit,

    /// Provider rejected the credentials.
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// Provider response schema/content was invalid.
    #[error("Invalid response from LLM: {0}")]
    InvalidResponse(String),

    /// Serialization/deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The stream was cancelled by the user before the turn finished.
    #[error("Interrupted by user")]
    Interrupted,
}

/// Tool bridge errors
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Connection, timeout or other transport failure after all retries.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status after all retries.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The bridge answered with a JSON-RPC `error` object.
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc { code: i64, message: String },

    /// The bridge answered with a body that is not a JSON-RPC response.
    #[error("Invalid bridge response: {0}")]
    InvalidResponse(String),
}

/// Tool lookup/execution errors
#[derive(Debug, Error)]
pub enum ToolError {
    /// Requested tool is unknown.
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// Tool operation failed.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Tool call arguments are invalid.
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// The user or policy declined the call.
    #[error("Declined: {0}")]
    Declined(String),
}

/// Session snapshot import/export errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// `messages` is missing or not a JSON array.
    #[error("Session messages must be a list")]
    NotAList,

    /// `messages` is an empty array.
    #[error("Session messages are empty")]
    Empty,

    /// One entry could not be turned into a message.
    #[error("Invalid message at index {index}: {reason}")]
    InvalidEntry { index: usize, reason: String },

    /// The first message is not a system message.
    #[error("Session must start with a system message")]
    MissingSystem,

    /// Filesystem error while reading or writing a session file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while reading or writing a session file.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Internal proto errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Invalid role string value.
    #[error("Invalid role: {0}")]
    InvalidRole(String),

    /// Invalid chat mode string value.
    #[error("Invalid chat mode: {0}")]
    InvalidMode(String),

    /// Generic serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
