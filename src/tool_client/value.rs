//! Tagged parameter values and catalog schema validation.
//!
//! Tool parameters are dynamically shaped, so they travel as a [`ToolValue`]
//! tree and are checked against the [`ParamSchema`] discovered from the
//! server before anything is dispatched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ─── ToolValue ───────────────────────────────────────────────────────────────

/// A JSON-shaped value tree with explicit variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolValue {
    Null,
    Bool(bool),
    /// Kept as a JSON number so integers beyond 2^53 survive.
    Number(serde_json::Number),
    String(String),
    List(Vec<ToolValue>),
    Map(BTreeMap<String, ToolValue>),
}

impl ToolValue {
    /// Short type name used in validation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            ToolValue::Null => "null",
            ToolValue::Bool(_) => "boolean",
            ToolValue::Number(_) => "number",
            ToolValue::String(_) => "string",
            ToolValue::List(_) => "array",
            ToolValue::Map(_) => "object",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ToolValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ToolValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ToolValue::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ToolValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ToolValue>> {
        match self {
            ToolValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Build a map value from `(key, value)` pairs.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ToolValue)>,
    {
        ToolValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<&str> for ToolValue {
    fn from(s: &str) -> Self {
        ToolValue::String(s.to_string())
    }
}

impl From<String> for ToolValue {
    fn from(s: String) -> Self {
        ToolValue::String(s)
    }
}

impl From<bool> for ToolValue {
    fn from(b: bool) -> Self {
        ToolValue::Bool(b)
    }
}

/// Non-finite floats have no JSON form and become `Null`.
impl From<f64> for ToolValue {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n).map_or(ToolValue::Null, ToolValue::Number)
    }
}

impl From<i64> for ToolValue {
    fn from(n: i64) -> Self {
        ToolValue::Number(n.into())
    }
}

impl From<u64> for ToolValue {
    fn from(n: u64) -> Self {
        ToolValue::Number(n.into())
    }
}

impl<T: Into<ToolValue>> From<Vec<T>> for ToolValue {
    fn from(items: Vec<T>) -> Self {
        ToolValue::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for ToolValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ToolValue::Null,
            serde_json::Value::Bool(b) => ToolValue::Bool(b),
            serde_json::Value::Number(n) => ToolValue::Number(n),
            serde_json::Value::String(s) => ToolValue::String(s),
            serde_json::Value::Array(items) => {
                ToolValue::List(items.into_iter().map(ToolValue::from).collect())
            }
            serde_json::Value::Object(obj) => {
                ToolValue::Map(obj.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<ToolValue> for serde_json::Value {
    fn from(value: ToolValue) -> Self {
        match value {
            ToolValue::Null => serde_json::Value::Null,
            ToolValue::Bool(b) => serde_json::Value::Bool(b),
            ToolValue::Number(n) => serde_json::Value::Number(n),
            ToolValue::String(s) => serde_json::Value::String(s),
            ToolValue::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            ToolValue::Map(map) => {
                serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

// ─── ParamSchema ─────────────────────────────────────────────────────────────

/// The JSON-Schema subset tool servers publish for their parameters.
///
/// Unknown keywords are ignored; a schema with no `type` accepts anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, ParamSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParamSchema>>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParamSchema {
    /// Parse a schema from its JSON form, treating malformed schemas as open.
    pub fn from_json(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// Validate `value` against this schema.
    ///
    /// On failure returns a message naming the offending path, e.g.
    /// `$.entities[0].name: expected string, got number`.
    pub fn validate(&self, value: &ToolValue) -> Result<(), String> {
        self.validate_at("$", value)
    }

    fn validate_at(&self, path: &str, value: &ToolValue) -> Result<(), String> {
        if let Some(kind) = self.kind.as_deref() {
            if !type_matches(kind, value) {
                return Err(format!(
                    "{path}: expected {kind}, got {}",
                    value.type_name()
                ));
            }
        }

        if let Some(allowed) = &self.allowed {
            let as_json: serde_json::Value = value.clone().into();
            if !allowed.contains(&as_json) {
                return Err(format!("{path}: value not in allowed set"));
            }
        }

        match value {
            ToolValue::Map(map) => {
                for field in &self.required {
                    if !map.contains_key(field) {
                        return Err(format!("{path}: missing required field '{field}'"));
                    }
                }
                for (key, child) in map {
                    if let Some(schema) = self.properties.get(key) {
                        schema.validate_at(&format!("{path}.{key}"), child)?;
                    }
                }
            }
            ToolValue::List(items) => {
                if let Some(schema) = &self.items {
                    for (i, item) in items.iter().enumerate() {
                        schema.validate_at(&format!("{path}[{i}]"), item)?;
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }
}

fn type_matches(kind: &str, value: &ToolValue) -> bool {
    match (kind, value) {
        ("string", ToolValue::String(_)) => true,
        ("number", ToolValue::Number(_)) => true,
        ("integer", ToolValue::Number(n)) => {
            n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        ("boolean", ToolValue::Bool(_)) => true,
        ("array", ToolValue::List(_)) => true,
        ("object", ToolValue::Map(_)) => true,
        ("null", ToolValue::Null) => true,
        // Unknown type keywords are not ours to reject.
        ("string" | "number" | "integer" | "boolean" | "array" | "object" | "null", _) => false,
        _ => true,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
