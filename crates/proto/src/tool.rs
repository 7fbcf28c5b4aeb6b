//! Tool catalog built from the bridge's `tools/list` answer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Primitive JSON type a tool parameter declares in its schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    /// Reads the `type` keyword of a property schema.
    ///
    /// Returns `None` for types the validator does not enforce
    /// (`number`, unions, missing).
    pub fn from_schema(schema: &Value) -> Option<Self> {
        match schema.get("type")?.as_str()? {
            "string" => Some(ParamType::String),
            "integer" => Some(ParamType::Integer),
            "boolean" => Some(ParamType::Boolean),
            "object" => Some(ParamType::Object),
            "array" => Some(ParamType::Array),
            _ => None,
        }
    }

    /// Whether `value` has exactly this runtime type.
    ///
    /// Booleans never satisfy `integer` and floats never satisfy `integer`.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
        }
    }

    /// Schema keyword for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
        }
    }
}

/// Declared parameter shape of one remote tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name used in `tools/call`.
    pub name: String,
    /// Human-readable description from the bridge (may be empty).
    #[serde(default)]
    pub description: String,
    /// `inputSchema.properties`.
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// `inputSchema.required`.
    #[serde(default)]
    pub required: Vec<String>,
}

impl ToolSpec {
    /// Creates a spec from a name, property map and required list.
    pub fn new(name: impl Into<String>, properties: Map<String, Value>, required: Vec<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            properties,
            required,
        }
    }

    /// Declared primitive type of `key`, if any.
    pub fn param_type(&self, key: &str) -> Option<ParamType> {
        self.properties.get(key).and_then(ParamType::from_schema)
    }

    /// Parameters that are declared but not required.
    pub fn optional(&self) -> Vec<&str> {
        self.properties
            .keys()
            .filter(|k| !self.required.iter().any(|r| r == *k))
            .map(String::as_str)
            .collect()
    }

    /// OpenAI `tools[]` entry for this spec.
    pub fn function_definition(&self) -> Value {
        let description = if self.description.trim().is_empty() {
            format!("Bridge tool: {}", self.name)
        } else {
            self.description.clone()
        };
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": description,
                "parameters": {
                    "type": "object",
                    "properties": self.properties,
                    "required": self.required,
                    "additionalProperties": false,
                }
            }
        })
    }
}

/// Name → spec mapping for one session, ordered by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCatalog {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog from a `tools/list` result.
    ///
    /// Accepts either `{"tools": [...]}` or the bare array. Entries without a
    /// name or without an object `inputSchema` are skipped; non-object
    /// `properties` and non-list `required` degrade to empty.
    pub fn from_tools_list(result: &Value) -> Self {
        let items = result
            .get("tools")
            .and_then(Value::as_array)
            .or_else(|| result.as_array());
        let mut catalog = Self::new();
        for item in items.into_iter().flatten() {
            let name = item
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            let Some(schema) = item.get("inputSchema").filter(|s| s.is_object()) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let properties = schema
                .get("properties")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let required = schema
                .get("required")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let mut spec = ToolSpec::new(name, properties, required);
            spec.description = item
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            catalog.insert(spec);
        }
        catalog
    }

    /// Adds or replaces a spec.
    pub fn insert(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), spec);
    }

    /// Looks up a spec by name.
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Whether the catalog has a tool with this name.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Sorted tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Iterates specs in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// OpenAI `tools[]` array for every spec.
    pub fn function_definitions(&self) -> Vec<Value> {
        self.iter().map(ToolSpec::function_definition).collect()
    }
}
