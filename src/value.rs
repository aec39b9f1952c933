//! Value helpers for the context model.
//!
//! Context variables, expression results, and node records all share one
//! tagged value type: `serde_json::Value` (null, bool, number, string,
//! array, object). Opaque handles such as query results are represented as
//! object records so templates can reach into them (`{users.data}`).
//!
//! This module centralizes the coercions the interpreter and the expression
//! engine agree on: truthiness, numeric conversion, literal parsing, and the
//! display form used for databinding substitution.

use serde_json::Value;

/// Truthiness used by `evaluateCondition` and `q:if`:
/// non-empty container / non-zero number / non-empty string / non-null.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i != 0
            } else {
                n.as_f64().map(|f| f != 0.0).unwrap_or(false)
            }
        }
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Numeric coercion used by `q:set` arithmetic operations.
/// Strings parse leniently; anything non-numeric coerces to 0.
pub fn to_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Wrap an f64 back into a Value, collapsing to an integer when exact.
pub fn from_number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

/// Parse a literal attribute value: bool, null, int, float, else string.
pub fn parse_literal(text: &str) -> Value {
    let trimmed = text.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Value::from(f);
    }
    Value::String(trimmed.to_string())
}

/// The display form used when substituting an expression result into text.
///
/// Strings render bare (no quotes), integers without a decimal point,
/// containers as compact JSON, null as an empty string.
pub fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The type name exposed to expressions (`isinstance(x, "int")`).
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "int"
            } else {
                "float"
            }
        }
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Resolve a dot-separated path into a value (`users.data`, `row.name`).
/// Array segments accept numeric indices.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(segment)?;
            }
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}
