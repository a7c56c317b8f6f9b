/// Typed condition evaluator for `if` nodes
///
/// A node config carries an ordered list of `{type, operator, left, right}`
/// rules plus `combine` (AND/OR), `ignoreCase` and `convertTypes` flags. Each
/// rule is evaluated with the semantics of its declared type; operands are
/// resolved against the run `Scope` first. Type errors are hard errors: a
/// strict-mode mismatch fails the node instead of quietly yielding `false`.

use crate::runtime::context::Scope;
use crate::workflow::value::{parse_bool_str, to_plain_string, ValueExt};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::RegexBuilder;
use serde_json::{json, Value};
use std::cmp::Ordering;

/// Output field holding the boolean result of an `if` node
pub const IF_RESULT_FIELD: &str = "result";

/// Naive date-time layouts tried after RFC 3339
const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Errors raised while reading or evaluating conditions
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("invalid conditions config: {0}")]
    InvalidConfig(String),

    #[error("condition #{index}: unsupported type '{kind}'")]
    UnknownType { index: usize, kind: String },

    #[error("condition #{index}: operator '{operator}' is not supported for type '{kind}'")]
    UnknownOperator {
        index: usize,
        kind: String,
        operator: String,
    },

    #[error("condition #{index}: {side} operand {found} is not a valid {expected}")]
    TypeMismatch {
        index: usize,
        side: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("condition #{index}: invalid regex '{pattern}': {source}")]
    InvalidRegex {
        index: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// How individual rule results are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    And,
    Or,
}

impl Combine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Combine::And => "AND",
            Combine::Or => "OR",
        }
    }
}

/// Value types a rule can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueType {
    String,
    Number,
    DateTime,
    Boolean,
    Array,
    Object,
}

impl ValueType {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "string" | "text" => Some(ValueType::String),
            "number" | "numeric" => Some(ValueType::Number),
            "datetime" | "date" | "date time" | "date_time" => Some(ValueType::DateTime),
            "boolean" | "bool" => Some(ValueType::Boolean),
            "array" | "list" => Some(ValueType::Array),
            "object" | "map" => Some(ValueType::Object),
            _ => None,
        }
    }
}

/// Ordering comparison shared by numbers, datetimes and array lengths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl Cmp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Cmp::Eq => ordering == Ordering::Equal,
            Cmp::Ne => ordering != Ordering::Equal,
            Cmp::Gt => ordering == Ordering::Greater,
            Cmp::Lt => ordering == Ordering::Less,
            Cmp::Ge => ordering != Ordering::Less,
            Cmp::Le => ordering != Ordering::Greater,
        }
    }

    fn parse(normalized: &str) -> Option<Self> {
        let cmp = match normalized {
            "equals" | "equal" | "equal to" | "eq" | "=" | "==" => Cmp::Eq,
            "not equals" | "not equal" | "not equal to" | "ne" | "neq" | "!=" | "<>" => Cmp::Ne,
            "greater than" | "greater" | "gt" | ">" | "after" => Cmp::Gt,
            "less than" | "less" | "lt" | "<" | "before" => Cmp::Lt,
            "greater than or equal" | "greater than or equal to" | "greater or equal"
            | "gte" | ">=" | "≥" | "after or equal" | "after or equal to" | "on or after" => Cmp::Ge,
            "less than or equal" | "less than or equal to" | "less or equal" | "lte" | "<="
            | "≤" | "before or equal" | "before or equal to" | "on or before" => Cmp::Le,
            _ => return None,
        };
        Some(cmp)
    }
}

/// Canonical operator after normalizing the many accepted spellings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Compare(Cmp),
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Matches,
    NotMatches,
    Empty,
    NotEmpty,
    Exists,
    NotExists,
    IsTrue,
    IsFalse,
    Length(Cmp),
}

impl Operator {
    fn parse(raw: &str) -> Option<Self> {
        let normalized = normalize_operator(raw);
        if let Some(rest) = normalized.strip_prefix("length ") {
            return Cmp::parse(strip_verb(rest)).map(Operator::Length);
        }
        if let Some(cmp) = Cmp::parse(&normalized) {
            return Some(Operator::Compare(cmp));
        }
        let op = match normalized.as_str() {
            "contains" | "contain" | "includes" => Operator::Contains,
            "not contains" | "not contain" | "not include" | "not includes" => Operator::NotContains,
            "starts with" | "start with" => Operator::StartsWith,
            "ends with" | "end with" => Operator::EndsWith,
            "matches regex" | "match regex" | "matches" | "match" | "regex" => Operator::Matches,
            "not matches regex" | "not match regex" | "not matches" | "not match" => {
                Operator::NotMatches
            }
            "empty" => Operator::Empty,
            "not empty" => Operator::NotEmpty,
            "exists" | "exist" => Operator::Exists,
            "not exists" | "not exist" => Operator::NotExists,
            "true" => Operator::IsTrue,
            "false" => Operator::IsFalse,
            _ => return None,
        };
        Some(op)
    }
}

/// Lowercase, split camelCase, treat `_`/`-` as spaces, drop leading "is"/"does"
fn normalize_operator(raw: &str) -> String {
    let mut spaced = String::with_capacity(raw.len() + 8);
    let mut previous: Option<char> = None;
    for c in raw.trim().chars() {
        if c.is_uppercase() && previous.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit()) {
            spaced.push(' ');
        }
        spaced.push(if c == '_' || c == '-' { ' ' } else { c });
        previous = Some(c);
    }
    let collapsed = spaced
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    strip_verb(&collapsed).to_string()
}

fn strip_verb(text: &str) -> &str {
    let mut text = text;
    loop {
        match text.strip_prefix("is ").or_else(|| text.strip_prefix("does ")) {
            Some(rest) => text = rest,
            None => return text,
        }
    }
}

/// One parsed rule with its effective flags
#[derive(Debug, Clone)]
struct Condition {
    index: usize,
    kind: String,
    value_type: ValueType,
    operator_raw: String,
    operator: Operator,
    left: Value,
    right: Value,
    ignore_case: bool,
    convert_types: bool,
}

/// Result of evaluating a condition set
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionReport {
    pub result: bool,
    pub combine: Combine,
    /// How many rules ran before the combine mode short-circuited
    pub evaluated: usize,
    pub total: usize,
}

impl ConditionReport {
    /// Outputs recorded for an `if` node
    pub fn to_outputs(&self) -> Value {
        json!({
            IF_RESULT_FIELD: self.result,
            "combine": self.combine.as_str(),
            "evaluated": self.evaluated,
            "total": self.total,
        })
    }
}

/// Parsed condition set of one `if` node
#[derive(Debug, Clone)]
pub struct ConditionEvaluator {
    conditions: Vec<Condition>,
    combine: Combine,
}

impl ConditionEvaluator {
    /// Read a condition set from node config
    ///
    /// `ignoreCase`/`convertTypes` may be set for the whole set and overridden
    /// per rule. Unknown types and operators are rejected here, before any
    /// operand is resolved.
    pub fn from_config(config: &Value) -> Result<Self, ConditionError> {
        let combine = match config.str_at("combine") {
            None => Combine::And,
            Some(raw) => match raw.trim().to_uppercase().as_str() {
                "AND" | "ALL" => Combine::And,
                "OR" | "ANY" => Combine::Or,
                other => {
                    return Err(ConditionError::InvalidConfig(format!(
                        "combine must be AND or OR, got '{}'",
                        other
                    )))
                }
            },
        };
        let ignore_case = config.bool_flag("ignoreCase");
        let convert_types = config.bool_flag("convertTypes");

        let rules = match config.get("conditions") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                return Err(ConditionError::InvalidConfig(
                    "conditions must be an array".to_string(),
                ))
            }
        };

        let mut conditions = Vec::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            if !rule.is_object() {
                return Err(ConditionError::InvalidConfig(format!(
                    "condition #{} must be an object",
                    index
                )));
            }
            let kind = rule
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("string")
                .to_string();
            let value_type = ValueType::parse(&kind).ok_or_else(|| ConditionError::UnknownType {
                index,
                kind: kind.clone(),
            })?;
            let operator_raw = rule
                .get("operator")
                .and_then(Value::as_str)
                .unwrap_or("equals")
                .to_string();
            let operator = Operator::parse(&operator_raw).ok_or_else(|| {
                ConditionError::UnknownOperator {
                    index,
                    kind: kind.clone(),
                    operator: operator_raw.clone(),
                }
            })?;

            conditions.push(Condition {
                index,
                kind,
                value_type,
                operator_raw,
                operator,
                left: rule.get("left").cloned().unwrap_or(Value::Null),
                right: rule.get("right").cloned().unwrap_or(Value::Null),
                ignore_case: flag_override(rule, "ignoreCase", ignore_case),
                convert_types: flag_override(rule, "convertTypes", convert_types),
            });
        }

        Ok(Self { conditions, combine })
    }

    pub fn combine(&self) -> Combine {
        self.combine
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate against a scope; an empty set is `true`
    pub fn evaluate(&self, scope: &Scope) -> Result<ConditionReport, ConditionError> {
        let mut evaluated = 0;
        let mut result = match self.combine {
            Combine::And => true,
            Combine::Or => self.conditions.is_empty(),
        };

        for condition in &self.conditions {
            evaluated += 1;
            let outcome = condition.evaluate(scope)?;
            tracing::debug!("🔍 Condition #{} ({} {}) → {}",
                condition.index, condition.kind, condition.operator_raw, outcome);
            match self.combine {
                Combine::And if !outcome => {
                    result = false;
                    break;
                }
                Combine::Or if outcome => {
                    result = true;
                    break;
                }
                _ => {}
            }
        }

        Ok(ConditionReport {
            result,
            combine: self.combine,
            evaluated,
            total: self.conditions.len(),
        })
    }
}

fn flag_override(rule: &Value, key: &str, inherited: bool) -> bool {
    if rule.get(key).is_some() {
        rule.bool_flag(key)
    } else {
        inherited
    }
}

impl Condition {
    fn evaluate(&self, scope: &Scope) -> Result<bool, ConditionError> {
        let left = scope.resolve_operand(&self.left).filter(|v| !v.is_null());
        let right = scope.resolve_operand(&self.right).filter(|v| !v.is_null());

        match self.value_type {
            ValueType::String => self.eval_string(left, right),
            ValueType::Number => self.eval_number(left, right),
            ValueType::DateTime => self.eval_datetime(left, right),
            ValueType::Boolean => self.eval_boolean(left, right),
            ValueType::Array => self.eval_array(left, right),
            ValueType::Object => self.eval_object(left),
        }
    }

    fn unsupported(&self) -> ConditionError {
        ConditionError::UnknownOperator {
            index: self.index,
            kind: self.kind.clone(),
            operator: self.operator_raw.clone(),
        }
    }

    fn mismatch(&self, side: &'static str, expected: &'static str, found: Option<&Value>) -> ConditionError {
        ConditionError::TypeMismatch {
            index: self.index,
            side,
            expected,
            found: found.map_or_else(|| "<missing>".to_string(), Value::to_string),
        }
    }

    fn fold(&self, text: String) -> String {
        if self.ignore_case {
            text.to_lowercase()
        } else {
            text
        }
    }

    fn eval_string(&self, left: Option<&Value>, right: Option<&Value>) -> Result<bool, ConditionError> {
        let text = |value: Option<&Value>| self.fold(value.map(to_plain_string).unwrap_or_default());

        let outcome = match self.operator {
            Operator::Exists => left.is_some(),
            Operator::NotExists => left.is_none(),
            Operator::Empty => text(left).is_empty(),
            Operator::NotEmpty => !text(left).is_empty(),
            Operator::Compare(Cmp::Eq) => text(left) == text(right),
            Operator::Compare(Cmp::Ne) => text(left) != text(right),
            Operator::Contains => text(left).contains(&text(right)),
            Operator::NotContains => !text(left).contains(&text(right)),
            Operator::StartsWith => text(left).starts_with(&text(right)),
            Operator::EndsWith => text(left).ends_with(&text(right)),
            Operator::Matches | Operator::NotMatches => {
                let pattern = right.map(to_plain_string).unwrap_or_default();
                let regex = RegexBuilder::new(&pattern)
                    .case_insensitive(self.ignore_case)
                    .build()
                    .map_err(|source| ConditionError::InvalidRegex {
                        index: self.index,
                        pattern: pattern.clone(),
                        source,
                    })?;
                let subject = left.map(to_plain_string).unwrap_or_default();
                regex.is_match(&subject) == (self.operator == Operator::Matches)
            }
            _ => return Err(self.unsupported()),
        };
        Ok(outcome)
    }

    fn eval_number(&self, left: Option<&Value>, right: Option<&Value>) -> Result<bool, ConditionError> {
        let Operator::Compare(cmp) = self.operator else {
            return Err(self.unsupported());
        };
        let a = to_number(left, self.convert_types).ok_or_else(|| self.mismatch("left", "number", left))?;
        let b = to_number(right, self.convert_types).ok_or_else(|| self.mismatch("right", "number", right))?;
        Ok(a.partial_cmp(&b).is_some_and(|ordering| cmp.holds(ordering)))
    }

    fn eval_datetime(&self, left: Option<&Value>, right: Option<&Value>) -> Result<bool, ConditionError> {
        let Operator::Compare(cmp) = self.operator else {
            return Err(self.unsupported());
        };
        let a = to_datetime(left, self.convert_types)
            .ok_or_else(|| self.mismatch("left", "datetime", left))?;
        let b = to_datetime(right, self.convert_types)
            .ok_or_else(|| self.mismatch("right", "datetime", right))?;
        Ok(cmp.holds(a.cmp(&b)))
    }

    fn eval_boolean(&self, left: Option<&Value>, right: Option<&Value>) -> Result<bool, ConditionError> {
        let a = to_bool(left, self.convert_types).ok_or_else(|| self.mismatch("left", "boolean", left))?;
        let outcome = match self.operator {
            Operator::IsTrue => a,
            Operator::IsFalse => !a,
            Operator::Compare(cmp @ (Cmp::Eq | Cmp::Ne)) => {
                let b = to_bool(right, self.convert_types)
                    .ok_or_else(|| self.mismatch("right", "boolean", right))?;
                (a == b) == (cmp == Cmp::Eq)
            }
            _ => return Err(self.unsupported()),
        };
        Ok(outcome)
    }

    fn eval_array(&self, left: Option<&Value>, right: Option<&Value>) -> Result<bool, ConditionError> {
        match self.operator {
            Operator::Exists => return Ok(left.is_some()),
            Operator::NotExists => return Ok(left.is_none()),
            _ => {}
        }

        let items = match left {
            None => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(Value::String(raw)) if self.convert_types => match serde_json::from_str(raw) {
                Ok(Value::Array(items)) => items,
                _ => return Err(self.mismatch("left", "array", left)),
            },
            Some(_) => return Err(self.mismatch("left", "array", left)),
        };

        let outcome = match self.operator {
            Operator::Empty => items.is_empty(),
            Operator::NotEmpty => !items.is_empty(),
            Operator::Length(cmp) => {
                // Length operands are entered as text in the editor, so they always parse
                let expected = to_number(right, true)
                    .filter(|n| n.fract() == 0.0 && *n >= 0.0)
                    .ok_or_else(|| self.mismatch("right", "length", right))?;
                cmp.holds(items.len().cmp(&(expected as usize)))
            }
            Operator::Contains | Operator::NotContains => {
                let needle = self.fold(right.map(to_plain_string).unwrap_or_default());
                let found = items
                    .iter()
                    .any(|item| self.fold(to_plain_string(item)) == needle);
                found == (self.operator == Operator::Contains)
            }
            _ => return Err(self.unsupported()),
        };
        Ok(outcome)
    }

    fn eval_object(&self, left: Option<&Value>) -> Result<bool, ConditionError> {
        let outcome = match self.operator {
            Operator::Exists => left.is_some(),
            Operator::NotExists => left.is_none(),
            Operator::Empty | Operator::NotEmpty => {
                let empty = match left {
                    None => true,
                    Some(Value::Object(map)) => map.is_empty(),
                    Some(_) => return Err(self.mismatch("left", "object", left)),
                };
                empty == (self.operator == Operator::Empty)
            }
            _ => return Err(self.unsupported()),
        };
        Ok(outcome)
    }
}

fn to_number(value: Option<&Value>, convert: bool) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if convert => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn to_bool(value: Option<&Value>, convert: bool) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) if convert => parse_bool_str(s),
        _ => None,
    }
}

fn to_datetime(value: Option<&Value>, convert: bool) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => {
            let s = s.trim();
            parse_datetime(s).or_else(|| {
                convert
                    .then(|| s.parse::<i64>().ok())
                    .flatten()
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
            })
        }
        Value::Number(n) if convert => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// RFC 3339, then naive date-times (taken as UTC), then plain dates at midnight
fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::OutputStore;

    fn scope(input: Value) -> Scope {
        Scope::new(&input, &OutputStore::new())
    }

    fn eval(config: Value) -> Result<bool, ConditionError> {
        eval_in(config, &scope(json!({})))
    }

    fn eval_in(config: Value, scope: &Scope) -> Result<bool, ConditionError> {
        ConditionEvaluator::from_config(&config)?
            .evaluate(scope)
            .map(|report| report.result)
    }

    fn rule(kind: &str, operator: &str, left: Value, right: Value) -> Value {
        json!({"conditions": [{"type": kind, "operator": operator, "left": left, "right": right}]})
    }

    #[test]
    fn test_operator_normalization() {
        assert_eq!(normalize_operator("isGreaterThan"), "greater than");
        assert_eq!(normalize_operator("does_not_exist"), "not exist");
        assert_eq!(normalize_operator("  Is  Not-Empty "), "not empty");
        assert_eq!(Operator::parse("lengthGreaterThanOrEqual"), Some(Operator::Length(Cmp::Ge)));
        assert_eq!(Operator::parse("is after or equal"), Some(Operator::Compare(Cmp::Ge)));
        assert_eq!(Operator::parse("teleports"), None);
    }

    #[test]
    fn test_number_convert_types() {
        let config = json!({"conditions": [{"type": "number", "operator": "is greater than",
            "left": "5", "right": "3", "convertTypes": true}]});
        assert!(eval(config).unwrap());

        let strict = json!({"conditions": [{"type": "number", "operator": "is greater than",
            "left": "5", "right": "3", "convertTypes": false}]});
        assert!(matches!(eval(strict), Err(ConditionError::TypeMismatch { side: "left", .. })));
    }

    #[test]
    fn test_number_uses_scope_values() {
        let scope = scope(json!({"order": {"total": 120.5}}));
        assert!(eval_in(rule("number", ">=", json!("order.total"), json!(100)), &scope).unwrap());
        assert!(!eval_in(rule("number", "lt", json!("{{ order.total }}"), json!(100)), &scope).unwrap());
    }

    #[test]
    fn test_string_operators() {
        assert!(eval(rule("string", "equals", json!("Hello"), json!("Hello"))).unwrap());
        assert!(!eval(rule("string", "equals", json!("Hello"), json!("hello"))).unwrap());
        assert!(eval(json!({"ignoreCase": true, "conditions": [
            {"type": "string", "operator": "equals", "left": "Hello", "right": "hello"}]}))
        .unwrap());
        assert!(eval(rule("string", "contains", json!("workflow"), json!("flow"))).unwrap());
        assert!(eval(rule("string", "doesNotContain", json!("workflow"), json!("xyz"))).unwrap());
        assert!(eval(rule("string", "starts_with", json!("workflow"), json!("work"))).unwrap());
        assert!(eval(rule("string", "endsWith", json!("workflow"), json!("flow"))).unwrap());
        assert!(eval(rule("string", "is empty", json!(""), Value::Null)).unwrap());
        assert!(eval(rule("string", "isNotEmpty", json!("x"), Value::Null)).unwrap());
    }

    #[test]
    fn test_string_regex() {
        assert!(eval(rule("string", "matches regex", json!("order-42"), json!(r"^order-\d+$"))).unwrap());
        assert!(eval(rule("string", "not matches regex", json!("order-x"), json!(r"^order-\d+$"))).unwrap());
        let invalid = eval(rule("string", "matches regex", json!("x"), json!("(unclosed")));
        assert!(matches!(invalid, Err(ConditionError::InvalidRegex { .. })));
    }

    #[test]
    fn test_exists_tracks_placeholder_resolution() {
        let scope = scope(json!({"email": "a@b.c"}));
        assert!(eval_in(rule("string", "exists", json!("{{ email }}"), Value::Null), &scope).unwrap());
        assert!(eval_in(rule("string", "does not exist", json!("{{ phone }}"), Value::Null), &scope).unwrap());
    }

    #[test]
    fn test_datetime_formats() {
        assert!(eval(rule("datetime", "after", json!("2024-05-02"), json!("2024-05-01T23:59:59Z"))).unwrap());
        assert!(eval(rule("datetime", "before", json!("2024-05-01 10:00"), json!("2024-05-01 10:00:01"))).unwrap());
        assert!(eval(rule("datetime", "equals",
            json!("2024-05-01T10:00:00.000000001+00:00"), json!("2024-05-01T10:00:00.000000001Z"))).unwrap());
        assert!(matches!(
            eval(rule("datetime", "after", json!("1714557600"), json!("2024-01-01"))),
            Err(ConditionError::TypeMismatch { .. })
        ));
        assert!(eval(json!({"convertTypes": true, "conditions": [
            {"type": "datetime", "operator": "after", "left": "1714557600", "right": "2024-01-01"}]}))
        .unwrap());
    }

    #[test]
    fn test_boolean_coercion_only_when_converting() {
        assert!(eval(rule("boolean", "is true", json!(true), Value::Null)).unwrap());
        assert!(eval(rule("boolean", "isFalse", json!(false), Value::Null)).unwrap());
        assert!(matches!(
            eval(rule("boolean", "is true", json!("yes"), Value::Null)),
            Err(ConditionError::TypeMismatch { .. })
        ));
        assert!(eval(json!({"convertTypes": true, "conditions": [
            {"type": "boolean", "operator": "equals", "left": "on", "right": "1"}]}))
        .unwrap());
    }

    #[test]
    fn test_array_operators() {
        let scope = scope(json!({"tags": ["Urgent", "billing"]}));
        assert!(eval_in(rule("array", "contains", json!("tags"), json!("billing")), &scope).unwrap());
        assert!(!eval_in(rule("array", "contains", json!("tags"), json!("urgent")), &scope).unwrap());
        assert!(eval_in(json!({"ignoreCase": true, "conditions": [
            {"type": "array", "operator": "contains", "left": "tags", "right": "urgent"}]}), &scope)
        .unwrap());
        assert!(eval_in(rule("array", "length equals", json!("tags"), json!("2")), &scope).unwrap());
        assert!(eval_in(rule("array", "lengthGreaterThan", json!("tags"), json!(1)), &scope).unwrap());
        assert!(eval_in(rule("array", "is not empty", json!("tags"), Value::Null), &scope).unwrap());
        assert!(eval_in(rule("array", "is empty", json!("{{ missing }}"), Value::Null), &scope).unwrap());
    }

    #[test]
    fn test_object_operators() {
        let scope = scope(json!({"meta": {}, "user": {"id": 1}}));
        assert!(eval_in(rule("object", "is empty", json!("meta"), Value::Null), &scope).unwrap());
        assert!(eval_in(rule("object", "is not empty", json!("user"), Value::Null), &scope).unwrap());
        assert!(eval_in(rule("object", "exists", json!("{{ user }}"), Value::Null), &scope).unwrap());
        assert!(matches!(
            eval_in(rule("object", "contains", json!("user"), json!("id")), &scope),
            Err(ConditionError::UnknownOperator { .. })
        ));
    }

    #[test]
    fn test_combine_short_circuits() {
        // The second rule would error if it ran
        let bad = json!({"type": "number", "operator": "equals", "left": "x", "right": 1});
        let and = json!({"combine": "AND", "conditions": [
            {"type": "string", "operator": "equals", "left": "a", "right": "b"}, bad.clone()]});
        let report = ConditionEvaluator::from_config(&and).unwrap().evaluate(&scope(json!({}))).unwrap();
        assert!(!report.result);
        assert_eq!(report.evaluated, 1);

        let or = json!({"combine": "or", "conditions": [
            {"type": "string", "operator": "equals", "left": "a", "right": "a"}, bad]});
        assert!(eval(or).unwrap());
    }

    #[test]
    fn test_empty_condition_list_is_true() {
        assert!(eval(json!({})).unwrap());
        assert!(eval(json!({"combine": "OR", "conditions": []})).unwrap());
    }

    #[test]
    fn test_config_errors() {
        assert!(matches!(
            ConditionEvaluator::from_config(&json!({"combine": "XOR"})),
            Err(ConditionError::InvalidConfig(_))
        ));
        assert!(matches!(
            ConditionEvaluator::from_config(&json!({"conditions": [{"type": "geo"}]})),
            Err(ConditionError::UnknownType { .. })
        ));
    }

    #[test]
    fn test_report_outputs() {
        let report = ConditionEvaluator::from_config(&json!({}))
            .unwrap()
            .evaluate(&scope(json!({})))
            .unwrap();
        let outputs = report.to_outputs();
        assert_eq!(outputs[IF_RESULT_FIELD], json!(true));
        assert_eq!(outputs["combine"], json!("AND"));
    }
}
