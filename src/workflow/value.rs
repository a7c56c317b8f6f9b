/// Typed accessors over dynamic JSON values
///
/// Node configs and node outputs are heterogeneous, so they stay as
/// `serde_json::Value`. This module gives the places that care about types
/// (condition evaluator, input builders, config readers) a small set of
/// checked accessors instead of ad-hoc `get().and_then()` chains.

use serde_json::{Map, Value};

/// Strings accepted as `true` when a flag is stored as text
const TRUTHY: [&str; 5] = ["true", "1", "yes", "y", "on"];

/// Strings accepted as `false` when a flag is stored as text
const FALSY: [&str; 5] = ["false", "0", "no", "n", "off"];

/// Typed accessor helpers for JSON values
pub trait ValueExt {
    /// Non-empty string field (whitespace-only counts as empty)
    fn str_at(&self, key: &str) -> Option<&str>;

    /// Boolean flag stored either as a JSON bool or as a truthy string
    fn bool_flag(&self, key: &str) -> bool;

    /// Object field
    fn object_at(&self, key: &str) -> Option<&Map<String, Value>>;

    /// Resolve a dot-path (`a.b.0.c`, `a.b[0].c`) into this value
    fn lookup_path(&self, path: &str) -> Option<&Value>;
}

impl ValueExt for Value {
    fn str_at(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    fn bool_flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => parse_bool_str(s).unwrap_or(false),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            _ => false,
        }
    }

    fn object_at(&self, key: &str) -> Option<&Map<String, Value>> {
        self.get(key).and_then(Value::as_object)
    }

    fn lookup_path(&self, path: &str) -> Option<&Value> {
        let normalized = path.replace('[', ".").replace(']', "");
        let mut current = self;
        for segment in normalized.split('.').filter(|s| !s.is_empty()) {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Parse a boolean out of its common textual spellings
pub fn parse_bool_str(raw: &str) -> Option<bool> {
    let lowered = raw.trim().to_lowercase();
    if TRUTHY.contains(&lowered.as_str()) {
        Some(true)
    } else if FALSY.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Render a value as plain text: strings without quotes, everything else as JSON
pub fn to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
