/// Run-scoped execution context
///
/// `OutputStore` keeps every executed node's outputs for the lifetime of one
/// run, keyed by full node id and by a short alias. `Scope` is the lookup
/// context built from it (`{..callerInput, steps: outputs}`) that condition
/// operands and `{{ path }}` placeholders resolve against.

use crate::workflow::value::{to_plain_string, ValueExt};
use regex::Regex;
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::OnceLock};

/// Number of leading id characters used as a node's alias key
pub const ALIAS_LEN: usize = 8;

fn placeholder_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").ok())
        .as_ref()
}

/// Short alias for a node id (first `ALIAS_LEN` characters)
pub fn alias_for(node_id: &str) -> &str {
    match node_id.char_indices().nth(ALIAS_LEN) {
        Some((end, _)) => &node_id[..end],
        None => node_id,
    }
}

/// Outputs of every node executed so far in a run
#[derive(Debug, Default, Clone)]
pub struct OutputStore {
    by_id: HashMap<String, Value>,
    /// alias → owning node id (first writer wins)
    aliases: HashMap<String, String>,
    /// Node ids in the order they first recorded outputs
    order: Vec<String>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node's outputs under its id and its alias
    pub fn record(&mut self, node_id: &str, outputs: Value) {
        if self.by_id.insert(node_id.to_string(), outputs).is_none() {
            self.order.push(node_id.to_string());
        }
        let alias = alias_for(node_id);
        if alias != node_id {
            self.aliases
                .entry(alias.to_string())
                .or_insert_with(|| node_id.to_string());
        }
    }

    /// Outputs by full id, falling back to the alias table
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.by_id.get(key).or_else(|| {
            self.aliases
                .get(key)
                .and_then(|owner| self.by_id.get(owner))
        })
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.by_id.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// JSON snapshot of the store: every full id plus aliases that do not
    /// shadow a full id
    pub fn snapshot(&self) -> Value {
        let mut map = Map::new();
        for node_id in &self.order {
            if let Some(outputs) = self.by_id.get(node_id) {
                map.insert(node_id.clone(), outputs.clone());
            }
        }
        for (alias, owner) in &self.aliases {
            if map.contains_key(alias) {
                continue;
            }
            if let Some(outputs) = self.by_id.get(owner) {
                map.insert(alias.clone(), outputs.clone());
            }
        }
        Value::Object(map)
    }
}

/// Lookup context for operand resolution and placeholder rendering
#[derive(Debug, Clone)]
pub struct Scope {
    input: Value,
    root: Value,
}

impl Scope {
    /// Build a scope from the caller input and the outputs recorded so far
    ///
    /// Object inputs are merged into the root next to `steps`; `steps` always
    /// refers to the output store even if the input carries its own.
    pub fn new(input: &Value, outputs: &OutputStore) -> Self {
        let mut root = match input {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        root.insert("steps".to_string(), outputs.snapshot());
        Self {
            input: input.clone(),
            root: Value::Object(root),
        }
    }

    /// The caller-supplied input this scope was built from
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Resolve a dot-path against the scope (`input` and `input.*` read the
    /// caller input directly)
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path == "input" {
            return Some(&self.input);
        }
        if let Some(rest) = path.strip_prefix("input.") {
            return self.input.lookup_path(rest);
        }
        if path.is_empty() {
            return None;
        }
        self.root.lookup_path(path)
    }

    /// Resolve a condition operand
    ///
    /// Strings wrapped in `{{ }}` are always lookups (missing → `None`).
    /// Other strings are looked up first and fall back to the literal text.
    /// Non-string operands are used as-is.
    pub fn resolve_operand<'a>(&'a self, operand: &'a Value) -> Option<&'a Value> {
        let Value::String(raw) = operand else {
            return Some(operand);
        };
        let trimmed = raw.trim();
        if let Some(path) = whole_placeholder(trimmed) {
            return self.lookup(path);
        }
        if trimmed.is_empty() {
            return Some(operand);
        }
        Some(self.lookup(trimmed).unwrap_or(operand))
    }

    /// Render `{{ path }}` placeholders in a string
    ///
    /// A string that is exactly one placeholder yields the referenced value
    /// with its JSON type intact; otherwise placeholders are substituted as
    /// text and unresolved ones render empty.
    pub fn interpolate(&self, template: &str) -> Value {
        if let Some(path) = whole_placeholder(template.trim()) {
            return self.lookup(path).cloned().unwrap_or(Value::Null);
        }
        let Some(pattern) = placeholder_pattern() else {
            return Value::String(template.to_string());
        };
        let rendered = pattern.replace_all(template, |caps: &regex::Captures| {
            self.lookup(&caps[1])
                .map(to_plain_string)
                .unwrap_or_default()
        });
        Value::String(rendered.into_owned())
    }

    /// Render placeholders in every string nested inside a value
    pub fn interpolate_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) if s.contains("{{") => self.interpolate(s),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.interpolate_value(item)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| (key.clone(), self.interpolate_value(item)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Inner path of a string that consists of exactly one `{{ path }}`
fn whole_placeholder(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    let inner = inner.trim();
    (!inner.is_empty()).then_some(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_alias_is_id_prefix() {
        assert_eq!(alias_for("abcdefgh-1234"), "abcdefgh");
        assert_eq!(alias_for("short"), "short");
    }

    #[test]
    fn test_alias_first_writer_wins() {
        let mut outputs = OutputStore::new();
        outputs.record("abcdefgh-first", json!({"n": 1}));
        outputs.record("abcdefgh-second", json!({"n": 2}));

        assert_eq!(outputs.get("abcdefgh"), Some(&json!({"n": 1})));
        assert_eq!(outputs.get("abcdefgh-second"), Some(&json!({"n": 2})));
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn test_full_id_wins_over_alias() {
        let mut outputs = OutputStore::new();
        outputs.record("abcdefgh-long", json!("via alias"));
        outputs.record("abcdefgh", json!("direct"));

        assert_eq!(outputs.get("abcdefgh"), Some(&json!("direct")));
        assert_eq!(outputs.snapshot()["abcdefgh"], json!("direct"));
    }

    #[test]
    fn test_scope_lookup_paths() {
        let mut outputs = OutputStore::new();
        outputs.record("fetch-node-1", json!({"status": 200, "data": {"items": [1, 2]}}));
        let scope = Scope::new(&json!({"user": {"name": "ada"}}), &outputs);

        assert_eq!(scope.lookup("user.name"), Some(&json!("ada")));
        assert_eq!(scope.lookup("input.user.name"), Some(&json!("ada")));
        assert_eq!(scope.lookup("steps.fetch-no.status"), Some(&json!(200)));
        assert_eq!(scope.lookup("steps.fetch-node-1.data.items[1]"), Some(&json!(2)));
        assert_eq!(scope.lookup("missing.path"), None);
    }

    #[test]
    fn test_resolve_operand_rules() {
        let scope = Scope::new(&json!({"count": 5}), &OutputStore::new());

        let literal = json!("hello");
        assert_eq!(scope.resolve_operand(&literal).unwrap(), &json!("hello"));

        let path = json!("count");
        assert_eq!(scope.resolve_operand(&path).unwrap(), &json!(5));

        let wrapped = json!("{{ count }}");
        assert_eq!(scope.resolve_operand(&wrapped).unwrap(), &json!(5));

        let missing = json!("{{ nope }}");
        assert!(scope.resolve_operand(&missing).is_none());

        let number = json!(3);
        assert_eq!(scope.resolve_operand(&number).unwrap(), &json!(3));
    }

    #[test]
    fn test_interpolate_keeps_type_for_whole_placeholder() {
        let scope = Scope::new(&json!({"id": 42, "name": "ada"}), &OutputStore::new());

        assert_eq!(scope.interpolate("{{ id }}"), json!(42));
        assert_eq!(
            scope.interpolate("https://api.test/users/{{id}}?n={{ name }}&x={{ gone }}"),
            json!("https://api.test/users/42?n=ada&x=")
        );
        assert_eq!(
            scope.interpolate_value(&json!({"q": ["{{ name }}", 1]})),
            json!({"q": ["ada", 1]})
        );
    }
}
