//! Schema check applied to every tool call before dispatch.

use proto::ToolCatalog;
use serde_json::Value;
use thiserror::Error;

/// First schema violation found in a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The tool is not in the catalog.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Arguments are not a JSON object.
    #[error("arguments must be a JSON object")]
    NotAnObject,

    /// Arguments contain keys the schema does not declare (sorted).
    #[error("undefined parameters: {}", .0.join(", "))]
    UndefinedParameters(Vec<String>),

    /// A required parameter is absent.
    #[error("missing required parameter: {0}")]
    MissingRequired(String),

    /// A required string parameter is empty or whitespace.
    #[error("required parameter {0} must not be empty")]
    RequiredEmpty(String),

    /// A parameter has the wrong JSON type.
    #[error("parameter {name} must be of type {expected}")]
    WrongType { name: String, expected: &'static str },
}

/// Checks `arguments` against the catalog entry for `tool_name`.
///
/// Rules run in a fixed order and the first violation wins: unknown tool,
/// non-object arguments, undefined keys, missing or blank required values,
/// then exact primitive types.
pub fn validate(tool_name: &str, arguments: &Value, catalog: &ToolCatalog) -> Result<(), ValidationError> {
    let spec = catalog
        .get(tool_name)
        .ok_or_else(|| ValidationError::UnknownTool(tool_name.to_string()))?;
    let args = arguments.as_object().ok_or(ValidationError::NotAnObject)?;

    let mut extras: Vec<String> = args
        .keys()
        .filter(|k| !spec.properties.contains_key(*k))
        .cloned()
        .collect();
    if !extras.is_empty() {
        extras.sort();
        return Err(ValidationError::UndefinedParameters(extras));
    }

    for key in &spec.required {
        let Some(value) = args.get(key) else {
            return Err(ValidationError::MissingRequired(key.clone()));
        };
        if spec.param_type(key) == Some(proto::ParamType::String) && is_blank(value) {
            return Err(ValidationError::RequiredEmpty(key.clone()));
        }
    }

    for (key, value) in args {
        if let Some(expected) = spec.param_type(key)
            && !expected.matches(value)
        {
            return Err(ValidationError::WrongType {
                name: key.clone(),
                expected: expected.as_str(),
            });
        }
    }
    Ok(())
}

fn is_blank(value: &Value) -> bool {
    value.as_str().is_some_and(|s| s.trim().is_empty())
}
