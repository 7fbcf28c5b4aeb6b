//! Destructive shell-command detection for the shell tool.

use std::str::FromStr;
use std::sync::OnceLock;

use proto::ConfigError;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Builtin patterns, checked in order against the lowercased command.
const BUILTIN_PATTERNS: &[(&str, &str)] = &[
    (r"\brm\s+-rf?\b", "rm -rf"),
    (r"\brm\s+-r\b", "rm -r"),
    (r"\bmkfs(\.|_|\s)", "mkfs"),
    (r"\bdd\s+if=", "dd if="),
    (r"\bdd\s+of=", "dd of="),
    (r"\bshutdown\b|\breboot\b", "shutdown/reboot"),
    (r"\bmount\b|\bumount\b", "mount/umount"),
    (r"\bchmod\b.*\s/($|\s)", "chmod on /"),
    (r"\bchown\b.*\s/($|\s)", "chown on /"),
    (r"(curl|wget).*\|\s*(sh|bash)\b", "curl|sh / wget|sh"),
    (r">\s*/dev/block/", "write to /dev/block"),
];

const EXTRA_DENY_REASON: &str = "extra_deny_regex";

fn builtin_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        BUILTIN_PATTERNS
            .iter()
            .filter_map(|(pattern, reason)| Regex::new(pattern).ok().map(|re| (re, *reason)))
            .collect()
    })
}

/// Outcome of classifying one command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Verdict {
    pub dangerous: bool,
    /// Short label of the matching rule; empty when safe.
    pub reason: String,
}

impl Verdict {
    fn safe() -> Self {
        Self::default()
    }

    fn dangerous(reason: impl Into<String>) -> Self {
        Self {
            dangerous: true,
            reason: reason.into(),
        }
    }
}

/// Classifies a shell command against the builtin pattern list only.
pub fn classify(command: &str) -> Verdict {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Verdict::safe();
    }
    let lowered = trimmed.to_lowercase();
    builtin_patterns()
        .iter()
        .find(|(re, _)| re.is_match(&lowered))
        .map(|(_, reason)| Verdict::dangerous(*reason))
        .unwrap_or_default()
}

/// Reads the shell command from `command`, `cmd` or `shell`, first non-empty wins.
pub fn command_from_args(args: &Value) -> String {
    ["command", "cmd", "shell"]
        .iter()
        .filter_map(|key| args.get(*key))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::String(_) | Value::Null | Value::Bool(false) => None,
            other => Some(other.to_string()),
        })
        .unwrap_or_default()
}

/// What happens when a dangerous command is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DangerPolicy {
    /// Guard disabled.
    Off,
    /// Block every match.
    Deny,
    /// Ask the operator before running a match.
    #[default]
    Confirm,
}

impl std::fmt::Display for DangerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DangerPolicy::Off => write!(f, "off"),
            DangerPolicy::Deny => write!(f, "deny"),
            DangerPolicy::Confirm => write!(f, "confirm"),
        }
    }
}

impl FromStr for DangerPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(DangerPolicy::Off),
            "deny" => Ok(DangerPolicy::Deny),
            "confirm" => Ok(DangerPolicy::Confirm),
            other => Err(ConfigError::InvalidValue {
                field: "dangerous.policy".to_string(),
                reason: format!("expected off, deny or confirm, got '{other}'"),
            }),
        }
    }
}

/// Builtin classification plus operator-supplied allow and deny overrides.
#[derive(Debug, Clone, Default)]
pub struct CommandGuard {
    policy: DangerPolicy,
    allow: Option<Regex>,
    deny: Option<Regex>,
}

impl CommandGuard {
    /// Builds a guard; blank regex strings disable the corresponding override.
    pub fn new(policy: DangerPolicy, allow_regex: &str, extra_deny_regex: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            policy,
            allow: compile_override("dangerous.allow_regex", allow_regex)?,
            deny: compile_override("dangerous.extra_deny_regex", extra_deny_regex)?,
        })
    }

    pub fn policy(&self) -> DangerPolicy {
        self.policy
    }

    /// Classifies `command`: extra deny first, then allow, then builtin.
    pub fn check(&self, command: &str) -> Verdict {
        let builtin = classify(command);
        if let Some(deny) = &self.deny
            && deny.is_match(command)
        {
            return if builtin.dangerous {
                builtin
            } else {
                Verdict::dangerous(EXTRA_DENY_REASON)
            };
        }
        if let Some(allow) = &self.allow
            && allow.is_match(command)
        {
            return Verdict::safe();
        }
        builtin
    }
}

fn compile_override(field: &str, pattern: &str) -> Result<Option<Regex>, ConfigError> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Ok(None);
    }
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            field: field.to_string(),
            reason: e.to_string(),
        })
}
