//! Source file formats and the key/value tree decrypted files are parsed into.
//!
//! YAML and JSON parse into an arbitrary [`Value`] tree. dotenv and INI parse
//! into a flat (dotenv) or two-level (INI) mapping of strings, so the same
//! slash-delimited [`Value::lookup`] serves every keyed format. Binary files
//! are never parsed.

pub mod dotenv;
pub mod ini;

use std::fmt;

use indexmap::IndexMap;
use serde::ser::{Serialize, Serializer};
use thiserror::Error;

/// The on-disk format of a source file, as declared in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Yaml,
    Json,
    Binary,
    Dotenv,
    Ini,
}

impl Format {
    /// Parse a manifest format string. An empty string means YAML.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "yaml" => Some(Format::Yaml),
            "json" => Some(Format::Json),
            "binary" => Some(Format::Binary),
            "dotenv" => Some(Format::Dotenv),
            "ini" => Some(Format::Ini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Yaml => "yaml",
            Format::Json => "json",
            Format::Binary => "binary",
            Format::Dotenv => "dotenv",
            Format::Ini => "ini",
        }
    }

    /// Whether a key path may resolve to a nested (non-string) value.
    pub fn allows_nested_values(&self) -> bool {
        matches!(self, Format::Yaml | Format::Json)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from resolving a key path inside a parsed file. The contained
/// string is the slash-joined path traversed so far.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("The key '{0}' cannot be found")]
    Missing(String),

    #[error("Key '{0}' does not refer to a dictionary")]
    NotAMapping(String),

    #[error("The value of key '{0}' is not a string")]
    NotAString(String),

    #[error("The document is not a dictionary")]
    RootNotAMapping,

    #[error("Cannot render the value of key '{path}': {reason}")]
    Unrenderable { path: String, reason: String },
}

/// A parsed document node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Sequence(Vec<Value>),
    Mapping(IndexMap<String, Value>),
}

impl Value {
    /// Walk a slash-delimited key path.
    ///
    /// Every segment but the last must name a mapping. Errors carry the path
    /// traversed up to and including the failing segment.
    pub fn lookup(&self, key: &str) -> Result<&Value, PathError> {
        let Value::Mapping(root) = self else {
            return Err(PathError::RootNotAMapping);
        };

        let mut current = root;
        let mut traversed = String::new();
        let mut segments = key.split('/').peekable();

        while let Some(segment) = segments.next() {
            if !traversed.is_empty() {
                traversed.push('/');
            }
            traversed.push_str(segment);

            let value = current
                .get(segment)
                .ok_or_else(|| PathError::Missing(traversed.clone()))?;

            if segments.peek().is_none() {
                return Ok(value);
            }

            match value {
                Value::Mapping(next) => current = next,
                _ => return Err(PathError::NotAMapping(traversed)),
            }
        }

        // split always yields at least one segment
        Err(PathError::Missing(traversed))
    }

    /// Text to install for this value when it is the target of a key path.
    ///
    /// Strings are used verbatim. Scalars render as their literal text. Nested
    /// values are serialised back into `format`, which must allow them.
    pub fn render(&self, path: &str, format: Format) -> Result<String, PathError> {
        match self {
            Value::String(s) => Ok(s.clone()),
            _ if !format.allows_nested_values() => Err(PathError::NotAString(path.to_string())),
            Value::Null => Ok("null".to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Sequence(_) | Value::Mapping(_) => {
                let rendered = match format {
                    Format::Json => serde_json::to_string(self).map_err(|e| e.to_string()),
                    _ => serde_yaml::to_string(self).map_err(|e| e.to_string()),
                };
                rendered.map_err(|reason| PathError::Unrenderable {
                    path: path.to_string(),
                    reason,
                })
            }
        }
    }

    fn from_yaml(value: serde_yaml::Value) -> Self {
        match value {
            serde_yaml::Value::Null => Value::Null,
            serde_yaml::Value::Bool(b) => Value::Bool(b),
            serde_yaml::Value::Number(n) => yaml_number(&n),
            serde_yaml::Value::String(s) => Value::String(s),
            serde_yaml::Value::Sequence(items) => {
                Value::Sequence(items.into_iter().map(Value::from_yaml).collect())
            }
            serde_yaml::Value::Mapping(map) => Value::Mapping(
                map.into_iter()
                    .map(|(k, v)| (yaml_key(k), Value::from_yaml(v)))
                    .collect(),
            ),
            serde_yaml::Value::Tagged(tagged) => Value::from_yaml(tagged.value),
        }
    }

    fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Sequence(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Mapping(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    fn from_pairs(pairs: IndexMap<String, String>) -> Self {
        Value::Mapping(
            pairs
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        )
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => n.serialize(serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Sequence(items) => items.serialize(serializer),
            Value::Mapping(map) => map.serialize(serializer),
        }
    }
}

fn yaml_number(n: &serde_yaml::Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Number(i.into())
    } else if let Some(u) = n.as_u64() {
        Value::Number(u.into())
    } else {
        // NaN and infinities have no JSON number form
        n.as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(n.to_string()))
    }
}

fn yaml_key(key: serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => "null".to_string(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Parse file contents into a key/value tree. Returns `None` for binary
/// files, which are installed verbatim.
pub fn parse(format: Format, content: &[u8]) -> Result<Option<Value>, String> {
    match format {
        Format::Binary => Ok(None),
        Format::Yaml => serde_yaml::from_slice::<serde_yaml::Value>(content)
            .map(|v| Some(Value::from_yaml(v)))
            .map_err(|e| e.to_string()),
        Format::Json => serde_json::from_slice::<serde_json::Value>(content)
            .map(|v| Some(Value::from_json(v)))
            .map_err(|e| e.to_string()),
        Format::Dotenv => {
            let text = std::str::from_utf8(content).map_err(|e| e.to_string())?;
            Ok(Some(Value::from_pairs(dotenv::parse(text))))
        }
        Format::Ini => {
            let text = std::str::from_utf8(content).map_err(|e| e.to_string())?;
            Ok(Some(ini::parse(text)?))
        }
    }
}

/// Extract the bytes to install for one secret.
///
/// Binary secrets and secrets with an empty key get the whole file. For
/// keyed formats the key path is resolved against `tree`.
pub fn extract(
    format: Format,
    key: &str,
    content: &[u8],
    tree: Option<&Value>,
) -> Result<Vec<u8>, PathError> {
    if format == Format::Binary || key.is_empty() {
        return Ok(content.to_vec());
    }
    let tree = tree.ok_or(PathError::RootNotAMapping)?;
    let value = tree.lookup(key)?;
    Ok(value.render(key, format)?.into_bytes())
}

/// Check that `key` resolves in `tree` to something installable, without
/// rendering it.
pub fn check_key(format: Format, key: &str, tree: &Value) -> Result<(), PathError> {
    if format == Format::Binary || key.is_empty() {
        return Ok(());
    }
    match tree.lookup(key)? {
        Value::String(_) => Ok(()),
        _ if format.allows_nested_values() => Ok(()),
        _ => Err(PathError::NotAString(key.to_string())),
    }
}
