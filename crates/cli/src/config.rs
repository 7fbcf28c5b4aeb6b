use agent::{ContextLimits, RetryLimits, RuntimeConfig, TraceSink, vendor_extra_options};
use proto::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tools::{CommandGuard, DangerPolicy};
use tracing::{debug, warn};

/// File name looked up in the working directory.
const LOCAL_CONFIG: &str = "r2pilot.toml";

/// Top-level CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Tool bridge endpoint.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Model provider and model names.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Conversation size ceilings.
    #[serde(default)]
    pub context: ContextConfig,

    /// Dangerous shell-command handling.
    #[serde(default)]
    pub dangerous: DangerousConfig,

    /// Per-question retry budgets.
    #[serde(default)]
    pub retry: RetryLimits,

    /// JSONL trace file.
    #[serde(default)]
    pub debug: DebugConfig,

    /// Save/resume file.
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:5050".to_string()
}

fn default_bridge_timeout() -> u64 {
    30
}

fn default_llm_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_model() -> String {
    "deepseek-reasoner".to_string()
}

fn default_llm_timeout() -> u64 {
    45
}

fn default_max_tool_result_chars() -> usize {
    5000
}

fn default_trace_path() -> String {
    "./debug.log.jsonl".to_string()
}

fn default_session_path() -> String {
    "./session.json".to_string()
}

/// JSON-RPC tool bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_url")]
    pub base_url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_bridge_timeout")]
    pub timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: default_bridge_url(),
            timeout_secs: default_bridge_timeout(),
        }
    }
}

/// OpenAI-compatible model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Model for the forced closing turn.
    #[serde(default = "default_model")]
    pub summary_model: String,
    /// API key (env overrides applied at load time; see `Config::load`).
    #[serde(default)]
    pub api_key: String,
    /// Connect and stream-idle timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// DashScope web search switch.
    #[serde(default)]
    pub enable_search: bool,
    /// DeepSeek thinking switch for non-reasoner models.
    #[serde(default)]
    pub enable_thinking: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_url(),
            model: default_model(),
            summary_model: default_model(),
            api_key: String::new(),
            timeout_secs: default_llm_timeout(),
            enable_search: false,
            enable_thinking: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Cap on one serialized tool message.
    #[serde(default = "default_max_tool_result_chars")]
    pub max_tool_result_chars: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

fn default_max_messages() -> usize {
    ContextLimits::default().max_messages
}

fn default_max_chars() -> usize {
    ContextLimits::default().max_chars
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tool_result_chars: default_max_tool_result_chars(),
            max_messages: default_max_messages(),
            max_chars: default_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DangerousConfig {
    #[serde(default)]
    pub policy: DangerPolicy,
    /// Commands matching this are never flagged by the builtin list.
    #[serde(default)]
    pub allow_regex: String,
    /// Commands matching this are always flagged.
    #[serde(default)]
    pub extra_deny_regex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Mirror trace events to `path`.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_trace_path")]
    pub path: String,
    /// Rotate the trace file once it is larger; 0 never rotates.
    #[serde(default)]
    pub max_bytes: u64,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_trace_path(),
            max_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_path")]
    pub path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            path: default_session_path(),
        }
    }
}

/// Parses 1/true/yes/y/on and 0/false/no/n/off.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

/// `~/.r2pilot`, or `./.r2pilot` without a home directory.
pub fn state_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".r2pilot")
}

fn blank_to_default(field: &str, value: &mut String, default: String) {
    if value.trim().is_empty() {
        warn!(field, default = %default, "Empty config value, using default");
        *value = default;
    } else {
        *value = value.trim().to_string();
    }
}

fn clamp_min<T>(field: &str, value: &mut T, min: T, default: T)
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    if *value < min {
        warn!(field, value = %value, min = %min, default = %default, "Config value below minimum, using default");
        *value = default;
    }
}

impl Config {
    /// Loads configuration from explicit path, fallback locations, and env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.map(Path::to_path_buf).or_else(|| {
            let cwd = std::env::current_dir().ok()?.join(LOCAL_CONFIG);
            if cwd.exists() {
                return Some(cwd);
            }
            let home_config = state_dir().join("config.toml");
            home_config.exists().then_some(home_config)
        });
        debug!(path = ?config_path, "Config file resolved");

        let mut config = if let Some(path) = config_path {
            let content = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(|e| ConfigError::Toml(e.to_string()))?
        } else {
            Config::default()
        };
        config.apply_env()?;
        config.normalize();

        debug!(
            bridge = %config.bridge.base_url,
            llm = %config.llm.base_url,
            model = %config.llm.model,
            policy = %config.dangerous.policy,
            "Config loaded"
        );
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(key) = std::env::var("R2PILOT_API_KEY") {
            self.llm.api_key = key;
        }
        if let Ok(model) = std::env::var("R2PILOT_MODEL") {
            self.llm.model = model;
        }
        if let Ok(url) = std::env::var("R2PILOT_LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Ok(url) = std::env::var("R2PILOT_BRIDGE_URL") {
            self.bridge.base_url = url;
        }
        if let Ok(policy) = std::env::var("R2PILOT_DANGEROUS_POLICY") {
            self.dangerous.policy = policy.parse()?;
        }
        if let Ok(flag) = std::env::var("R2PILOT_DEBUG") {
            self.debug.enabled = parse_bool(&flag).ok_or_else(|| ConfigError::InvalidValue {
                field: "R2PILOT_DEBUG".to_string(),
                reason: format!("expected a boolean, got '{flag}'"),
            })?;
        }
        Ok(())
    }

    /// Replaces blank or out-of-range values with their defaults.
    pub fn normalize(&mut self) {
        blank_to_default("bridge.base_url", &mut self.bridge.base_url, default_bridge_url());
        blank_to_default("llm.base_url", &mut self.llm.base_url, default_llm_url());
        blank_to_default("llm.model", &mut self.llm.model, default_model());
        blank_to_default("llm.summary_model", &mut self.llm.summary_model, default_model());
        self.llm.api_key = self.llm.api_key.trim().to_string();

        clamp_min("bridge.timeout_secs", &mut self.bridge.timeout_secs, 1, default_bridge_timeout());
        clamp_min("llm.timeout_secs", &mut self.llm.timeout_secs, 1, default_llm_timeout());
        clamp_min(
            "context.max_tool_result_chars",
            &mut self.context.max_tool_result_chars,
            200,
            default_max_tool_result_chars(),
        );
        clamp_min("context.max_messages", &mut self.context.max_messages, 5, default_max_messages());
        clamp_min("context.max_chars", &mut self.context.max_chars, 2000, default_max_chars());

        let defaults = RetryLimits::default();
        let retry = &mut self.retry;
        clamp_min("retry.max_turns", &mut retry.max_turns, 1, defaults.max_turns);
        clamp_min("retry.missing_tool", &mut retry.missing_tool, 1, defaults.missing_tool);
        clamp_min("retry.validation", &mut retry.validation, 1, defaults.validation);
        clamp_min("retry.recoverable", &mut retry.recoverable, 1, defaults.recoverable);
        clamp_min("retry.recoverable_hint", &mut retry.recoverable_hint, 1, defaults.recoverable_hint);

        blank_to_default("debug.path", &mut self.debug.path, default_trace_path());
        blank_to_default("session.path", &mut self.session.path, default_session_path());
    }

    /// Runtime knobs derived from the `llm`, `context` and `retry` sections.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            model: self.llm.model.clone(),
            summary_model: self.llm.summary_model.clone(),
            context: ContextLimits {
                max_messages: self.context.max_messages,
                max_chars: self.context.max_chars,
            },
            max_tool_result_chars: self.context.max_tool_result_chars,
            retry: self.retry,
            extra: vendor_extra_options(
                &self.llm.base_url,
                &self.llm.model,
                self.llm.enable_search,
                self.llm.enable_thinking,
            ),
        }
    }

    /// Compiles the dangerous-command guard; bad regexes are config errors.
    pub fn guard(&self) -> Result<CommandGuard, ConfigError> {
        CommandGuard::new(
            self.dangerous.policy,
            &self.dangerous.allow_regex,
            &self.dangerous.extra_deny_regex,
        )
    }

    /// Trace file sink, present only when `debug.enabled`.
    pub fn trace_sink(&self) -> Option<TraceSink> {
        self.debug.enabled.then(|| TraceSink {
            path: PathBuf::from(&self.debug.path),
            max_bytes: self.debug.max_bytes,
        })
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_secs)
    }

    /// Copy safe to print: the API key is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.llm.api_key.is_empty() {
            let tail: String = copy
                .llm
                .api_key
                .chars()
                .rev()
                .take(4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            copy.llm.api_key = format!("***{tail}");
        }
        copy
    }

    /// Writes the configuration as pretty TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Toml(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `~/.r2pilot/config.toml`.
    pub fn default_path() -> PathBuf {
        state_dir().join("config.toml")
    }
}
