//! A restricted templating kernel used to expand step `params` and evaluate
//! `when` guards against the current [`crate::state::State`] and loop
//! bindings.
//!
//! Two syntaxes are supported against a [`Scope`]:
//! - `{{name}}` / `{{a.b.c}}` substitution inside a string, expanded in
//!   [`expand_str`] / [`expand_map`].
//! - a small boolean comparison grammar (`{{a.b}} == 'x'`, `{{n}} > 3`) used
//!   for `when` guards, evaluated by [`eval_when`].
//!
//! Values are a tagged sum rather than raw JSON so reference errors can name
//! exactly which dotted path failed to resolve, instead of surfacing a
//! generic deserialization failure.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

/// A templating value: the tagged sum described in the design notes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    Null,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Render this value for substitution into a template string.
    pub fn render(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Null => String::new(),
            Self::List(items) => items
                .iter()
                .map(Value::render)
                .collect::<Vec<_>>()
                .join(", "),
            Self::Map(_) => serde_json::to_string(&self.to_json()).unwrap_or_default(),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::String(s) => JsonValue::String(s.clone()),
            Self::Int(i) => JsonValue::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Null => JsonValue::Null,
            Self::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Self::Map(map) => {
                JsonValue::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }

    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or_default())
                }
            }
            JsonValue::String(s) => Self::String(s.clone()),
            JsonValue::Array(items) => Self::List(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => {
                Self::Map(map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// A lexical scope: State.vars merged with any active `for_each` loop
/// bindings. Lookups walk dotted paths (`a.b.c`) through nested maps.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: HashMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(vars: HashMap<String, Value>) -> Self {
        Self { vars }
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    /// Resolve a dotted path (`a.b.c`) against this scope.
    pub fn resolve(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let head = parts.next()?;
        let mut current = self.vars.get(head)?;
        for part in parts {
            match current {
                Value::Map(map) => current = map.get(part)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

/// Expand all `{{path}}` references in `template` against `scope`.
///
/// A reference with no resolvable path and no default is a `config` error
/// naming the unresolved path.
pub fn expand_str(template: &str, scope: &Scope) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        match rest.find("{{") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + 2..];
                let end = after.find("}}").ok_or_else(|| {
                    Error::config(format!("unterminated template reference in: {template}"))
                })?;
                let path = after[..end].trim();
                let value = scope.resolve(path).ok_or_else(|| {
                    Error::config(format!("unresolved template reference: {{{{{path}}}}}"))
                })?;
                out.push_str(&value.render());
                rest = &after[end + 2..];
            }
        }
    }
    Ok(out)
}

/// Expand every string value in a param map against `scope`; non-string
/// values pass through unchanged.
pub fn expand_map(
    params: &HashMap<String, JsonValue>,
    scope: &Scope,
) -> Result<HashMap<String, JsonValue>> {
    let mut out = HashMap::with_capacity(params.len());
    for (key, value) in params {
        let expanded = expand_json(value, scope)?;
        out.insert(key.clone(), expanded);
    }
    Ok(out)
}

fn expand_json(value: &JsonValue, scope: &Scope) -> Result<JsonValue> {
    match value {
        JsonValue::String(s) => Ok(JsonValue::String(expand_str(s, scope)?)),
        JsonValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(expand_json(item, scope)?);
            }
            Ok(JsonValue::Array(out))
        }
        JsonValue::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), expand_json(v, scope)?);
            }
            Ok(JsonValue::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Resolve a `for_each` dotted path to a list, per the Step Executor's
/// contract: absent or non-list is a `config` error.
pub fn resolve_list<'a>(path: &str, scope: &'a Scope) -> Result<&'a [Value]> {
    scope
        .resolve(path)
        .ok_or_else(|| Error::config(format!("for_each path not found: {path}")))?
        .as_list()
        .ok_or_else(|| Error::config(format!("for_each path is not a list: {path}")))
}

/// Evaluate a `when` guard: `{{path}} OP literal` where OP is one of
/// `==`, `!=`, `>`, `<`, `>=`, `<=`, or a bare `{{path}}` truthiness check.
/// Unresolved references evaluate to `false` rather than erroring, so a
/// guard over an optional variable that was never set simply skips the step.
pub fn eval_when(expr: &str, scope: &Scope) -> Result<bool> {
    let expr = expr.trim();
    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some(idx) = expr.find(op) {
            let lhs = expr[..idx].trim();
            let rhs = expr[idx + op.len()..].trim();
            let lhs_val = resolve_operand(lhs, scope);
            let rhs_val = resolve_operand(rhs, scope);
            return Ok(compare(&lhs_val, op, &rhs_val));
        }
    }
    // Bare reference: truthy if resolvable and not false/null/empty.
    Ok(match resolve_operand(expr, scope) {
        Value::Bool(b) => b,
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::List(items) => !items.is_empty(),
        _ => true,
    })
}

fn resolve_operand(token: &str, scope: &Scope) -> Value {
    let token = token.trim();
    if let Some(path) = token.strip_prefix("{{").and_then(|t| t.strip_suffix("}}")) {
        return scope.resolve(path.trim()).cloned().unwrap_or(Value::Null);
    }
    if let Some(quoted) = token
        .strip_prefix('\'')
        .and_then(|t| t.strip_suffix('\''))
        .or_else(|| token.strip_prefix('"').and_then(|t| t.strip_suffix('"')))
    {
        return Value::String(quoted.to_string());
    }
    if let Ok(i) = token.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = token.parse::<f64>() {
        return Value::Float(f);
    }
    match token {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(token.to_string()),
    }
}

fn compare(lhs: &Value, op: &str, rhs: &Value) -> bool {
    use std::cmp::Ordering;
    let ord = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match op {
        "==" => lhs == rhs,
        "!=" => lhs != rhs,
        ">" => ord == Some(Ordering::Greater),
        "<" => ord == Some(Ordering::Less),
        ">=" => matches!(ord, Some(Ordering::Greater) | Some(Ordering::Equal)),
        "<=" => matches!(ord, Some(Ordering::Less) | Some(Ordering::Equal)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        let mut inner = HashMap::new();
        inner.insert("b".to_string(), Value::String("news".to_string()));
        Scope::new()
            .with("category", Value::String("news".to_string()))
            .with("count", Value::Int(3))
            .with("a", Value::Map(inner))
            .with("symbols", Value::List(vec![
                Value::String("A".to_string()),
                Value::String("B".to_string()),
            ]))
    }

    #[test]
    fn test_expand_str_simple_and_dotted() {
        let s = scope();
        assert_eq!(expand_str("cat={{category}}", &s).unwrap(), "cat=news");
        assert_eq!(expand_str("nested={{a.b}}", &s).unwrap(), "nested=news");
    }

    #[test]
    fn test_expand_str_unresolved_is_config_error() {
        let s = scope();
        let err = expand_str("{{missing}}", &s).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn test_resolve_list_for_for_each() {
        let s = scope();
        let list = resolve_list("symbols", &s).unwrap();
        assert_eq!(list.len(), 2);
        let err = resolve_list("category", &s).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
        let err = resolve_list("nope", &s).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn test_eval_when_equality_and_comparison() {
        let s = scope();
        assert!(eval_when("{{category}} == 'news'", &s).unwrap());
        assert!(!eval_when("{{category}} == 'company'", &s).unwrap());
        assert!(eval_when("{{count}} > 1", &s).unwrap());
        assert!(!eval_when("{{count}} > 10", &s).unwrap());
    }

    #[test]
    fn test_eval_when_bare_reference_truthiness() {
        let s = scope();
        assert!(eval_when("{{category}}", &s).unwrap());
        assert!(!eval_when("{{missing}}", &s).unwrap());
    }
}
