//! Tree evaluator for compiled expressions.
//!
//! Evaluation is pure with respect to the namespace: the same tree and the
//! same variables always produce the same value. Name resolution checks the
//! caller's context first; bare-name calls resolve through the built-in
//! whitelist. Nothing here mutates the namespace.

use super::builtins;
use super::parser::{BinOp, CmpOp, Expr};
use super::ExprError;
use crate::value;
use serde_json::Value;
use std::collections::HashMap;

/// Evaluate a compiled expression against a variable namespace.
pub fn evaluate(expr: &Expr, namespace: &HashMap<String, Value>) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),

        Expr::Name(name) => namespace
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UndefinedName(name.clone())),

        Expr::Attr(target, attr) => {
            let base = evaluate(target, namespace)?;
            match &base {
                Value::Object(map) => map.get(attr).cloned().ok_or_else(|| {
                    ExprError::Runtime(format!("no attribute '{}' on object", attr))
                }),
                other => Err(ExprError::Runtime(format!(
                    "cannot access attribute '{}' on {}",
                    attr,
                    value::type_name(other)
                ))),
            }
        }

        Expr::Index(target, index) => {
            let base = evaluate(target, namespace)?;
            let key = evaluate(index, namespace)?;
            index_value(&base, &key)
        }

        Expr::Neg(inner) => {
            let v = evaluate(inner, namespace)?;
            match &v {
                Value::Number(n) if n.is_i64() => Ok(Value::from(-n.as_i64().unwrap_or(0))),
                Value::Number(n) => Ok(Value::from(-n.as_f64().unwrap_or(0.0))),
                other => Err(ExprError::Runtime(format!(
                    "cannot negate {}",
                    value::type_name(other)
                ))),
            }
        }

        Expr::Not(inner) => {
            let v = evaluate(inner, namespace)?;
            Ok(Value::Bool(!value::is_truthy(&v)))
        }

        Expr::Binary(op, left, right) => {
            let l = evaluate(left, namespace)?;
            let r = evaluate(right, namespace)?;
            binary(*op, &l, &r)
        }

        // Short-circuit, returning the deciding operand (Python semantics).
        Expr::And(operands) => {
            let mut last = Value::Bool(true);
            for operand in operands {
                last = evaluate(operand, namespace)?;
                if !value::is_truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }

        Expr::Or(operands) => {
            let mut last = Value::Bool(false);
            for operand in operands {
                last = evaluate(operand, namespace)?;
                if value::is_truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }

        Expr::Compare(first, rest) => {
            let mut left = evaluate(first, namespace)?;
            for (op, right_expr) in rest {
                let right = evaluate(right_expr, namespace)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }

        Expr::Conditional {
            condition,
            then,
            otherwise,
        } => {
            let c = evaluate(condition, namespace)?;
            if value::is_truthy(&c) {
                evaluate(then, namespace)
            } else {
                evaluate(otherwise, namespace)
            }
        }

        Expr::Call(name, arg_exprs) => {
            let mut args = Vec::with_capacity(arg_exprs.len());
            for arg in arg_exprs {
                args.push(evaluate(arg, namespace)?);
            }
            if builtins::is_builtin(name) {
                builtins::call(name, &args)
            } else if namespace.contains_key(name) {
                Err(ExprError::Runtime(format!("'{}' is not callable", name)))
            } else {
                Err(ExprError::UndefinedName(name.clone()))
            }
        }

        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate(item, namespace)?);
            }
            Ok(Value::Array(out))
        }

        Expr::Dict(pairs) => {
            let mut map = serde_json::Map::new();
            for (key_expr, value_expr) in pairs {
                let key = match evaluate(key_expr, namespace)? {
                    Value::String(s) => s,
                    other => value::display(&other),
                };
                map.insert(key, evaluate(value_expr, namespace)?);
            }
            Ok(Value::Object(map))
        }
    }
}

fn index_value(base: &Value, key: &Value) -> Result<Value, ExprError> {
    match (base, key) {
        (Value::Array(items), Value::Number(n)) => {
            let raw = n.as_i64().unwrap_or(0);
            // Negative indices count from the end.
            let index = if raw < 0 {
                items.len() as i64 + raw
            } else {
                raw
            };
            if index < 0 || index as usize >= items.len() {
                return Err(ExprError::Runtime(format!(
                    "list index {} out of range (len {})",
                    raw,
                    items.len()
                )));
            }
            Ok(items[index as usize].clone())
        }
        (Value::Object(map), Value::String(name)) => map
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::Runtime(format!("no key '{}' in dict", name))),
        (Value::String(s), Value::Number(n)) => {
            let chars: Vec<char> = s.chars().collect();
            let raw = n.as_i64().unwrap_or(0);
            let index = if raw < 0 { chars.len() as i64 + raw } else { raw };
            if index < 0 || index as usize >= chars.len() {
                return Err(ExprError::Runtime(format!(
                    "string index {} out of range",
                    raw
                )));
            }
            Ok(Value::String(chars[index as usize].to_string()))
        }
        (base, key) => Err(ExprError::Runtime(format!(
            "cannot index {} with {}",
            value::type_name(base),
            value::type_name(key)
        ))),
    }
}

fn binary(op: BinOp, l: &Value, r: &Value) -> Result<Value, ExprError> {
    // String and list concatenation come first; everything else is numeric.
    if op == BinOp::Add {
        match (l, r) {
            (Value::String(a), Value::String(b)) => {
                return Ok(Value::String(format!("{}{}", a, b)));
            }
            (Value::Array(a), Value::Array(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                return Ok(Value::Array(out));
            }
            _ => {}
        }
    }
    if op == BinOp::Mul {
        // String repetition: "ab" * 3.
        if let (Value::String(s), Value::Number(n)) = (l, r) {
            let count = n.as_i64().unwrap_or(0).max(0) as usize;
            return Ok(Value::String(s.repeat(count)));
        }
        if let (Value::Number(n), Value::String(s)) = (l, r) {
            let count = n.as_i64().unwrap_or(0).max(0) as usize;
            return Ok(Value::String(s.repeat(count)));
        }
    }

    let (a, b) = (numeric_operand(op, l)?, numeric_operand(op, r)?);
    let both_int = is_int_like(l) && is_int_like(r);

    match op {
        BinOp::Add => Ok(arith_result(a + b, both_int)),
        BinOp::Sub => Ok(arith_result(a - b, both_int)),
        BinOp::Mul => Ok(arith_result(a * b, both_int)),
        BinOp::Div => {
            if b == 0.0 {
                return Err(ExprError::Runtime("division by zero".into()));
            }
            Ok(Value::from(a / b))
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(ExprError::Runtime("division by zero".into()));
            }
            Ok(arith_result((a / b).floor(), both_int))
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(ExprError::Runtime("modulo by zero".into()));
            }
            // Python-style modulo: result takes the sign of the divisor.
            Ok(arith_result(a - b * (a / b).floor(), both_int))
        }
        BinOp::Pow => {
            let result = a.powf(b);
            Ok(arith_result(result, both_int && b >= 0.0))
        }
    }
}

fn numeric_operand(op: BinOp, v: &Value) -> Result<f64, ExprError> {
    match v {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(ExprError::Runtime(format!(
            "unsupported operand type {} for {:?}",
            value::type_name(other),
            op
        ))),
    }
}

fn is_int_like(v: &Value) -> bool {
    match v {
        Value::Number(n) => n.is_i64() || n.is_u64(),
        Value::Bool(_) => true,
        _ => false,
    }
}

fn arith_result(n: f64, as_int: bool) -> Value {
    if as_int && n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, ExprError> {
    match op {
        CmpOp::Eq => Ok(values_equal(l, r)),
        CmpOp::NotEq => Ok(!values_equal(l, r)),
        CmpOp::In => membership(l, r),
        CmpOp::NotIn => membership(l, r).map(|found| !found),
        ordering_op => {
            let ordering = match (l, r) {
                (Value::Number(a), Value::Number(b)) => {
                    let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                    a.partial_cmp(&b)
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                (a, b) => {
                    return Err(ExprError::Runtime(format!(
                        "cannot order {} and {}",
                        value::type_name(a),
                        value::type_name(b)
                    )))
                }
            };
            let ordering =
                ordering.ok_or_else(|| ExprError::Runtime("incomparable values".into()))?;
            Ok(match ordering_op {
                CmpOp::Lt => ordering == std::cmp::Ordering::Less,
                CmpOp::LtEq => ordering != std::cmp::Ordering::Greater,
                CmpOp::Gt => ordering == std::cmp::Ordering::Greater,
                CmpOp::GtEq => ordering != std::cmp::Ordering::Less,
                _ => unreachable!(),
            })
        }
    }
}

/// Equality treats 1 and 1.0 as equal (numeric comparison), everything else
/// structurally.
fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().unwrap_or(0.0) == b.as_f64().unwrap_or(0.0)
        }
        (a, b) => a == b,
    }
}

fn membership(needle: &Value, haystack: &Value) -> Result<bool, ExprError> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            _ => Ok(false),
        },
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            _ => Err(ExprError::Runtime(
                "'in <string>' requires a string operand".into(),
            )),
        },
        other => Err(ExprError::Runtime(format!(
            "argument of type {} is not iterable",
            value::type_name(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::super::parser::parse;
    use super::*;
    use serde_json::json;

    fn eval_str(input: &str, vars: &[(&str, Value)]) -> Result<Value, ExprError> {
        let expr = parse(&tokenize(input).unwrap()).unwrap();
        let namespace: HashMap<String, Value> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        evaluate(&expr, &namespace)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_str("1 + 2 * 3", &[]).unwrap(), json!(7));
        assert_eq!(eval_str("7 / 2", &[]).unwrap(), json!(3.5));
        assert_eq!(eval_str("7 // 2", &[]).unwrap(), json!(3));
        assert_eq!(eval_str("-7 % 3", &[]).unwrap(), json!(2));
        assert_eq!(eval_str("2 ** 10", &[]).unwrap(), json!(1024));
    }

    #[test]
    fn test_string_operations() {
        assert_eq!(
            eval_str("'a' + 'b'", &[]).unwrap(),
            json!("ab")
        );
        assert_eq!(eval_str("'ab' * 2", &[]).unwrap(), json!("abab"));
        assert_eq!(eval_str("'b' in 'abc'", &[]).unwrap(), json!(true));
    }

    #[test]
    fn test_name_resolution() {
        assert_eq!(
            eval_str("x + 2", &[("x", json!(1))]).unwrap(),
            json!(3)
        );
        assert!(matches!(
            eval_str("missing", &[]),
            Err(ExprError::UndefinedName(_))
        ));
    }

    #[test]
    fn test_attribute_and_index() {
        let users = json!({"data": [{"name": "A"}, {"name": "B"}]});
        assert_eq!(
            eval_str("users.data[1].name", &[("users", users.clone())]).unwrap(),
            json!("B")
        );
        assert_eq!(
            eval_str("users.data[-1].name", &[("users", users)]).unwrap(),
            json!("B")
        );
    }

    #[test]
    fn test_short_circuit_returns_operand() {
        assert_eq!(
            eval_str("x or 'fallback'", &[("x", json!(""))]).unwrap(),
            json!("fallback")
        );
        assert_eq!(
            eval_str("x and y", &[("x", json!(0)), ("y", json!(1))]).unwrap(),
            json!(0)
        );
    }

    #[test]
    fn test_chained_comparison() {
        assert_eq!(
            eval_str("0 <= x < 10", &[("x", json!(5))]).unwrap(),
            json!(true)
        );
        assert_eq!(
            eval_str("0 <= x < 10", &[("x", json!(10))]).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn test_conditional_expression() {
        assert_eq!(
            eval_str("'yes' if n > 0 else 'no'", &[("n", json!(3))]).unwrap(),
            json!("yes")
        );
        assert_eq!(
            eval_str("'yes' if n > 0 else 'no'", &[("n", json!(-1))]).unwrap(),
            json!("no")
        );
    }

    #[test]
    fn test_builtin_call() {
        assert_eq!(
            eval_str("len(items)", &[("items", json!([1, 2, 3]))]).unwrap(),
            json!(3)
        );
        assert_eq!(
            eval_str("sum(range(5))", &[]).unwrap(),
            json!(10)
        );
    }

    #[test]
    fn test_division_by_zero() {
        assert!(matches!(
            eval_str("1 / 0", &[]),
            Err(ExprError::Runtime(_))
        ));
    }

    #[test]
    fn test_numeric_equality_across_kinds() {
        assert_eq!(eval_str("1 == 1.0", &[]).unwrap(), json!(true));
    }
}
