//! # Expression Engine
//!
//! Safe, cached evaluation of the restricted expressions embedded in `{expr}`
//! databinding. The grammar covers literals, identifiers, attribute/index
//! access, arithmetic and comparison operators, boolean combinators, the
//! conditional expression (`a if cond else b`), and calls to a fixed set of
//! safe built-ins. There is no assignment, no statements, and no reflection.
//!
//! ## Pipeline
//!
//! 1. Dangerous-pattern prescreen (regex) - rejects `__name__`, `import`,
//!    `exec`, `eval`, `open`, `globals`, `locals`, `getattr`, `setattr`,
//!    `file`, `input` before any parsing happens.
//! 2. Lexer + recursive-descent parser → a compiled [`Expr`] tree.
//! 3. Tree evaluation against the caller's variable map.
//!
//! Compilation is memoized in a strict LRU keyed by expression text only
//! (never by context); compile errors are cached too so a bad expression is
//! rejected cheaply on every use. Statistics are tracked behind a toggle and
//! auto-disabled when `QUILL_PRODUCTION` is set; [`ExpressionEngine::evaluate_fast`]
//! skips both stats and the prescreen for hot loops.

mod builtins;
mod eval;
mod lexer;
mod parser;

pub use builtins::{is_builtin, SAFE_BUILTIN_NAMES};
pub use parser::{BinOp, CmpOp, Expr};

use crate::value;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default compile-cache capacity.
pub const DEFAULT_CACHE_SIZE: usize = 1000;

/// Forbidden constructs, checked before compilation.
static DANGEROUS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"__\w+__|\b(import|exec|eval|compile|open|file|input|raw_input|globals|locals|vars|dir|getattr|setattr|delattr|hasattr|breakpoint|exit|quit)\b",
    )
    .expect("dangerous-pattern regex is valid")
});

/// Errors raised by expression compilation and evaluation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    /// The expression uses a forbidden construct.
    #[error("Unsafe expression: {0}")]
    Unsafe(String),

    /// The expression does not parse.
    #[error("Syntax error in expression: {0}")]
    Syntax(String),

    /// An identifier was not found in the context.
    #[error("Undefined name '{0}'")]
    UndefinedName(String),

    /// The expression parsed but could not be evaluated.
    #[error("Expression runtime error: {0}")]
    Runtime(String),
}

impl ExprError {
    /// Wire-visible error kind tag.
    pub fn kind(&self) -> &'static str {
        match self {
            ExprError::Unsafe(_) => "UnsafeExpression",
            ExprError::Syntax(_) => "SyntaxError",
            ExprError::UndefinedName(_) => "UndefinedName",
            ExprError::Runtime(_) => "RuntimeError",
        }
    }
}

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub compilations: u64,
    pub evaluations: u64,
    pub total_compile_time: Duration,
    pub total_eval_time: Duration,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn avg_compile_time(&self) -> Duration {
        if self.compilations == 0 {
            Duration::ZERO
        } else {
            self.total_compile_time / self.compilations as u32
        }
    }

    pub fn avg_eval_time(&self) -> Duration {
        if self.evaluations == 0 {
            Duration::ZERO
        } else {
            self.total_eval_time / self.evaluations as u32
        }
    }
}

/// Snapshot of the compile-cache state.
#[derive(Debug, Clone)]
pub struct CacheInfo {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
}

type CompileOutcome = Result<Arc<Expr>, ExprError>;

struct EngineState {
    cache: lru::LruCache<String, CompileOutcome>,
    stats: CacheStats,
}

/// Thread-safe LRU-cached expression engine.
///
/// One engine is shared per runtime; `compile` and `evaluate` may be called
/// from any number of threads concurrently.
pub struct ExpressionEngine {
    state: Mutex<EngineState>,
    enable_stats: bool,
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE, None)
    }
}

impl ExpressionEngine {
    /// Create an engine with the given cache capacity.
    ///
    /// `enable_stats` defaults to off when the `QUILL_PRODUCTION` environment
    /// variable is set, on otherwise.
    pub fn new(max_size: usize, enable_stats: Option<bool>) -> Self {
        let production = std::env::var("QUILL_PRODUCTION")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let capacity = NonZeroUsize::new(max_size.max(1)).expect("capacity is non-zero");
        Self {
            state: Mutex::new(EngineState {
                cache: lru::LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            enable_stats: enable_stats.unwrap_or(!production),
        }
    }

    /// Compile an expression (or fetch the cached compilation).
    pub fn compile(&self, expr: &str) -> CompileOutcome {
        let key = expr.trim();
        let mut state = self.state.lock().expect("expression engine lock");

        if let Some(outcome) = state.cache.get(key) {
            let outcome = outcome.clone();
            if self.enable_stats {
                state.stats.hits += 1;
            }
            return outcome;
        }

        if self.enable_stats {
            state.stats.misses += 1;
        }
        let start = Instant::now();
        let outcome = Self::compile_uncached(key);
        if self.enable_stats {
            state.stats.compilations += 1;
            state.stats.total_compile_time += start.elapsed();
        }
        state.cache.put(key.to_string(), outcome.clone());
        outcome
    }

    fn compile_uncached(expr: &str) -> CompileOutcome {
        if DANGEROUS_PATTERN.is_match(expr) {
            return Err(ExprError::Unsafe(format!(
                "potentially unsafe expression: {}",
                expr
            )));
        }
        let tokens = lexer::tokenize(expr)?;
        if tokens.is_empty() {
            return Err(ExprError::Syntax("empty expression".into()));
        }
        let tree = parser::parse(&tokens)?;
        Ok(Arc::new(tree))
    }

    /// Evaluate an expression with the given context.
    ///
    /// Empty expressions evaluate to null.
    pub fn evaluate(
        &self,
        expr: &str,
        context: &HashMap<String, Value>,
    ) -> Result<Value, ExprError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }

        let compiled = self.compile(trimmed)?;
        let start = Instant::now();
        let result = eval::evaluate(&compiled, context);

        if self.enable_stats {
            let mut state = self.state.lock().expect("expression engine lock");
            state.stats.evaluations += 1;
            state.stats.total_eval_time += start.elapsed();
        }
        result
    }

    /// Zero-overhead evaluation for hot paths.
    ///
    /// Skips the prescreen (the expression must have compiled before or come
    /// from trusted internal code) and all statistics tracking.
    pub fn evaluate_fast(
        &self,
        expr: &str,
        context: &HashMap<String, Value>,
    ) -> Result<Value, ExprError> {
        let key = expr.trim();
        let compiled = {
            let mut state = self.state.lock().expect("expression engine lock");
            match state.cache.get(key) {
                Some(outcome) => outcome.clone(),
                None => {
                    let outcome = Self::compile_uncached(key);
                    state.cache.put(key.to_string(), outcome.clone());
                    outcome
                }
            }
        }?;
        eval::evaluate(&compiled, context)
    }

    /// Evaluate a condition, coercing the result to a boolean with
    /// truthiness semantics.
    pub fn evaluate_condition(
        &self,
        condition: &str,
        context: &HashMap<String, Value>,
    ) -> Result<bool, ExprError> {
        let result = self.evaluate(condition, context)?;
        Ok(value::is_truthy(&result))
    }

    /// Pre-compile a list of expressions to warm up the cache.
    ///
    /// Returns the compile error message for each expression, `None` when it
    /// compiled cleanly.
    pub fn precompile(&self, expressions: &[&str]) -> HashMap<String, Option<String>> {
        expressions
            .iter()
            .map(|expr| {
                let outcome = self.compile(expr);
                (expr.to_string(), outcome.err().map(|e| e.to_string()))
            })
            .collect()
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        self.state.lock().expect("expression engine lock").stats.clone()
    }

    /// Reset statistics counters.
    pub fn reset_stats(&self) {
        self.state.lock().expect("expression engine lock").stats = CacheStats::default();
    }

    /// Drop all cached compilations and reset statistics.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("expression engine lock");
        state.cache.clear();
        state.stats = CacheStats::default();
    }

    /// Cache occupancy and hit counters.
    pub fn cache_info(&self) -> CacheInfo {
        let state = self.state.lock().expect("expression engine lock");
        CacheInfo {
            size: state.cache.len(),
            max_size: state.cache.cap().get(),
            hits: state.stats.hits,
            misses: state.stats.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(vars: &[(&str, Value)]) -> HashMap<String, Value> {
        vars.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_evaluate_simple() {
        let engine = ExpressionEngine::default();
        let result = engine
            .evaluate("x + y * 2", &ctx(&[("x", json!(10)), ("y", json!(5))]))
            .unwrap();
        assert_eq!(result, json!(20));
    }

    #[test]
    fn test_compile_is_cached() {
        let engine = ExpressionEngine::new(10, Some(true));
        let context = ctx(&[("x", json!(1))]);
        engine.evaluate("x + 1", &context).unwrap();
        engine.evaluate("x + 1", &context).unwrap();
        engine.evaluate("x + 1", &context).unwrap();

        let stats = engine.stats();
        assert_eq!(stats.compilations, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.evaluations, 3);
    }

    #[test]
    fn test_purity_across_contexts() {
        let engine = ExpressionEngine::default();
        let a = engine.evaluate("n * 2", &ctx(&[("n", json!(3))])).unwrap();
        let b = engine.evaluate("n * 2", &ctx(&[("n", json!(3))])).unwrap();
        assert_eq!(a, b);
        // A different context re-uses the same compilation but sees its own
        // variables.
        let c = engine.evaluate("n * 2", &ctx(&[("n", json!(5))])).unwrap();
        assert_eq!(c, json!(10));
    }

    #[test]
    fn test_unsafe_expressions_rejected() {
        let engine = ExpressionEngine::default();
        for expr in [
            "__import__('os')",
            "import os",
            "exec('x')",
            "eval('1')",
            "open('/etc/passwd')",
            "globals()",
            "locals()",
            "getattr(x, 'y')",
            "setattr(x, 'y', 1)",
            "file('x')",
            "input()",
            "x.__class__",
        ] {
            let err = engine.evaluate(expr, &ctx(&[])).unwrap_err();
            assert_eq!(err.kind(), "UnsafeExpression", "expr: {}", expr);
        }
    }

    #[test]
    fn test_compile_errors_are_cached() {
        let engine = ExpressionEngine::new(10, Some(true));
        assert!(engine.evaluate("1 +", &ctx(&[])).is_err());
        assert!(engine.evaluate("1 +", &ctx(&[])).is_err());
        let stats = engine.stats();
        assert_eq!(stats.compilations, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_evaluate_condition_truthiness() {
        let engine = ExpressionEngine::default();
        assert!(engine
            .evaluate_condition("items", &ctx(&[("items", json!([1]))]))
            .unwrap());
        assert!(!engine
            .evaluate_condition("items", &ctx(&[("items", json!([]))]))
            .unwrap());
        assert!(engine
            .evaluate_condition("x > 5 and y < 10", &ctx(&[("x", json!(6)), ("y", json!(2))]))
            .unwrap());
    }

    #[test]
    fn test_empty_expression_is_null() {
        let engine = ExpressionEngine::default();
        assert_eq!(engine.evaluate("  ", &ctx(&[])).unwrap(), Value::Null);
    }

    #[test]
    fn test_lru_eviction() {
        let engine = ExpressionEngine::new(2, Some(true));
        let context = ctx(&[]);
        engine.evaluate("1", &context).unwrap();
        engine.evaluate("2", &context).unwrap();
        engine.evaluate("3", &context).unwrap(); // evicts "1"
        assert_eq!(engine.cache_info().size, 2);
    }

    #[test]
    fn test_precompile_reports_errors() {
        let engine = ExpressionEngine::default();
        let report = engine.precompile(&["1 + 1", "bad ("]);
        assert!(report["1 + 1"].is_none());
        assert!(report["bad ("].is_some());
    }

    #[test]
    fn test_fast_path_matches_instrumented_path() {
        let engine = ExpressionEngine::default();
        let context = ctx(&[("x", json!(4))]);
        let slow = engine.evaluate("x * x", &context).unwrap();
        let fast = engine.evaluate_fast("x * x", &context).unwrap();
        assert_eq!(slow, fast);
    }
}
