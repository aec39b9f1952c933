//! Databinding resolver for `{expr}` substitution.
//!
//! Three entry points with distinct error policies:
//!
//! - [`DataBinding::apply`] - typed: a string that is exactly one `{expr}`
//!   returns the evaluated value unchanged; mixed content substitutes
//!   stringified results. Evaluation failures keep the original `{expr}`
//!   placeholder in place (never raise).
//! - [`DataBinding::resolve`] - the substitution form, always a string.
//! - [`DataBinding::condition`] - used by `q:if` conditions and `q:loop`
//!   ranges, where an expression failure is a rendering error and propagates.

use crate::expr::{ExprError, ExpressionEngine};
use crate::value;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

static BINDING_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^{}]+)\}").expect("binding regex is valid"));

/// `{expr}` resolver bound to a shared expression engine.
#[derive(Clone)]
pub struct DataBinding {
    engine: Arc<ExpressionEngine>,
}

impl DataBinding {
    pub fn new(engine: Arc<ExpressionEngine>) -> Self {
        Self { engine }
    }

    /// The engine backing this resolver.
    pub fn engine(&self) -> &Arc<ExpressionEngine> {
        &self.engine
    }

    /// True when the text contains at least one `{expr}` occurrence.
    pub fn has_binding(text: &str) -> bool {
        BINDING_PATTERN.is_match(text)
    }

    /// Apply databinding, preserving the value type when the whole string is
    /// a single expression.
    pub fn apply(&self, text: &str, context: &HashMap<String, Value>) -> Value {
        if text.is_empty() {
            return Value::String(String::new());
        }

        // Full-match: `{expr}` and nothing else returns the raw value.
        let trimmed = text.trim();
        if let Some(captures) = BINDING_PATTERN.captures(trimmed) {
            if let Some(whole) = captures.get(0) {
                if whole.start() == 0 && whole.end() == trimmed.len() {
                    let expr = captures[1].trim();
                    return match self.engine.evaluate(expr, context) {
                        Ok(v) => v,
                        Err(_) => Value::String(text.to_string()),
                    };
                }
            }
        }

        Value::String(self.resolve(text, context))
    }

    /// Substitute every `{expr}` with the stringified evaluation result.
    /// Failed expressions keep their placeholder.
    pub fn resolve(&self, text: &str, context: &HashMap<String, Value>) -> String {
        if !Self::has_binding(text) {
            return text.to_string();
        }
        BINDING_PATTERN
            .replace_all(text, |captures: &regex::Captures| {
                let expr = captures[1].trim();
                match self.engine.evaluate(expr, context) {
                    Ok(v) => value::display(&v),
                    Err(_) => captures[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Evaluate a condition string for `q:if` / `q:loop`.
    ///
    /// The text may be a bare expression (`count > 0`) or a braced binding
    /// (`{count > 0}`); either way failures propagate to the caller.
    pub fn condition(
        &self,
        text: &str,
        context: &HashMap<String, Value>,
    ) -> Result<bool, ExprError> {
        let expr = Self::strip_braces(text);
        self.engine.evaluate_condition(expr, context)
    }

    /// Evaluate a value expression that may or may not be brace-wrapped,
    /// propagating failures. Used for loop ranges and call arguments.
    pub fn evaluate(
        &self,
        text: &str,
        context: &HashMap<String, Value>,
    ) -> Result<Value, ExprError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }
        if Self::has_binding(trimmed) {
            match self.apply(trimmed, context) {
                // apply() swallowed a failure and kept the placeholder;
                // surface the real error instead.
                Value::String(s) if s == trimmed && Self::has_binding(&s) => {
                    self.engine.evaluate(Self::strip_braces(trimmed), context)
                }
                other => Ok(other),
            }
        } else {
            self.engine.evaluate(trimmed, context)
        }
    }

    fn strip_braces(text: &str) -> &str {
        let trimmed = text.trim();
        if trimmed.starts_with('{') && trimmed.ends_with('}') && trimmed.len() >= 2 {
            trimmed[1..trimmed.len() - 1].trim()
        } else {
            trimmed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn binding() -> DataBinding {
        DataBinding::new(Arc::new(ExpressionEngine::default()))
    }

    fn ctx(vars: &[(&str, Value)]) -> HashMap<String, Value> {
        vars.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_full_match_preserves_type() {
        let b = binding();
        let context = ctx(&[("x", json!([1, 2, 3]))]);
        assert_eq!(b.apply("{x}", &context), json!([1, 2, 3]));
        assert_eq!(b.apply("{len(x)}", &context), json!(3));
    }

    #[test]
    fn test_mixed_content_stringifies() {
        let b = binding();
        let context = ctx(&[("a", json!(1)), ("b", json!("two"))]);
        assert_eq!(b.apply("{a}-{b}", &context), json!("1-two"));
    }

    #[test]
    fn test_failure_keeps_placeholder() {
        let b = binding();
        let context = ctx(&[]);
        assert_eq!(b.resolve("hello {missing}", &context), "hello {missing}");
        assert_eq!(b.apply("{missing}", &context), json!("{missing}"));
    }

    #[test]
    fn test_literal_braces_outside_bindings_pass_through() {
        let b = binding();
        let context = ctx(&[("x", json!(1))]);
        // The unmatched brace pair carries no expression and stays intact.
        assert_eq!(b.resolve("{} {x}", &context), "{} 1");
    }

    #[test]
    fn test_condition_propagates_errors() {
        let b = binding();
        assert!(b.condition("{missing > 1}", &ctx(&[])).is_err());
        assert!(b.condition("x > 1", &ctx(&[("x", json!(5))])).unwrap());
    }

    #[test]
    fn test_evaluate_bare_or_braced() {
        let b = binding();
        let context = ctx(&[("n", json!(4))]);
        assert_eq!(b.evaluate("n + 1", &context).unwrap(), json!(5));
        assert_eq!(b.evaluate("{n + 1}", &context).unwrap(), json!(5));
        assert!(b.evaluate("{missing}", &context).is_err());
    }

    #[test]
    fn test_identity_round_trip() {
        let b = binding();
        for v in [json!(7), json!("s"), json!(true), json!({"k": 1}), Value::Null] {
            let context = ctx(&[("x", v.clone())]);
            assert_eq!(b.apply("{x}", &context), v);
        }
    }
}
