//! Safe built-in functions callable from expressions.
//!
//! The whitelist is fixed; anything not in this table resolves through the
//! caller's context instead (and context values are never callable, so an
//! unknown function name surfaces as `UndefinedName`).

use super::ExprError;
use crate::value;
use serde_json::Value;

/// Maximum number of elements `range()` will materialize.
const RANGE_LIMIT: i64 = 1_000_000;

/// Names of every safe built-in, in whitelist order.
pub const SAFE_BUILTIN_NAMES: &[&str] = &[
    "abs", "min", "max", "len", "sum", "round", "int", "float", "str", "bool", "list", "dict",
    "tuple", "sorted", "range", "enumerate", "zip", "isinstance", "all", "any", "hash",
];

/// True when `name` is a callable built-in.
pub fn is_builtin(name: &str) -> bool {
    SAFE_BUILTIN_NAMES.contains(&name)
}

/// Invoke a built-in by name.
pub fn call(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match name {
        "abs" => builtin_abs(args),
        "min" => builtin_min_max(args, true),
        "max" => builtin_min_max(args, false),
        "len" => builtin_len(args),
        "sum" => builtin_sum(args),
        "round" => builtin_round(args),
        "int" => builtin_int(args),
        "float" => builtin_float(args),
        "str" => builtin_str(args),
        "bool" => builtin_bool(args),
        "list" | "tuple" => builtin_list(args),
        "dict" => builtin_dict(args),
        "sorted" => builtin_sorted(args),
        "range" => builtin_range(args),
        "enumerate" => builtin_enumerate(args),
        "zip" => builtin_zip(args),
        "isinstance" => builtin_isinstance(args),
        "all" => builtin_all_any(args, true),
        "any" => builtin_all_any(args, false),
        "hash" => builtin_hash(args),
        other => Err(ExprError::UndefinedName(other.to_string())),
    }
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), ExprError> {
    if args.len() != expected {
        return Err(ExprError::Runtime(format!(
            "{}() takes {} argument(s), got {}",
            name,
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn as_f64(name: &str, v: &Value) -> Result<f64, ExprError> {
    match v {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(ExprError::Runtime(format!(
            "{}() expects a number, got {}",
            name,
            value::type_name(other)
        ))),
    }
}

fn builtin_abs(args: &[Value]) -> Result<Value, ExprError> {
    arity("abs", args, 1)?;
    match &args[0] {
        Value::Number(n) if n.is_i64() => Ok(Value::from(n.as_i64().unwrap_or(0).abs())),
        other => Ok(value::from_number(as_f64("abs", other)?.abs())),
    }
}

fn builtin_min_max(args: &[Value], take_min: bool) -> Result<Value, ExprError> {
    let name = if take_min { "min" } else { "max" };
    let items: Vec<Value> = match args {
        [] => {
            return Err(ExprError::Runtime(format!(
                "{}() expects at least one argument",
                name
            )))
        }
        [Value::Array(items)] => items.clone(),
        _ => args.to_vec(),
    };
    if items.is_empty() {
        return Err(ExprError::Runtime(format!("{}() of an empty sequence", name)));
    }

    let mut best = items[0].clone();
    for item in &items[1..] {
        let ordering = compare_values(name, item, &best)?;
        let replace = if take_min {
            ordering == std::cmp::Ordering::Less
        } else {
            ordering == std::cmp::Ordering::Greater
        };
        if replace {
            best = item.clone();
        }
    }
    Ok(best)
}

/// Ordering used by min/max/sorted: numbers with numbers, strings with
/// strings; anything else is a runtime error.
fn compare_values(name: &str, a: &Value, b: &Value) -> Result<std::cmp::Ordering, ExprError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            Ok(x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal))
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        _ => Err(ExprError::Runtime(format!(
            "{}() cannot compare {} with {}",
            name,
            value::type_name(a),
            value::type_name(b)
        ))),
    }
}

fn builtin_len(args: &[Value]) -> Result<Value, ExprError> {
    arity("len", args, 1)?;
    let n = match &args[0] {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        other => {
            return Err(ExprError::Runtime(format!(
                "len() of {}",
                value::type_name(other)
            )))
        }
    };
    Ok(Value::from(n as i64))
}

fn builtin_sum(args: &[Value]) -> Result<Value, ExprError> {
    arity("sum", args, 1)?;
    let items = match &args[0] {
        Value::Array(items) => items,
        other => {
            return Err(ExprError::Runtime(format!(
                "sum() expects a list, got {}",
                value::type_name(other)
            )))
        }
    };
    let mut total = 0.0;
    for item in items {
        total += as_f64("sum", item)?;
    }
    Ok(value::from_number(total))
}

fn builtin_round(args: &[Value]) -> Result<Value, ExprError> {
    if args.is_empty() || args.len() > 2 {
        return Err(ExprError::Runtime(format!(
            "round() takes 1 or 2 arguments, got {}",
            args.len()
        )));
    }
    let x = as_f64("round", &args[0])?;
    if args.len() == 2 {
        let digits = as_f64("round", &args[1])? as i32;
        let factor = 10f64.powi(digits);
        Ok(value::from_number((x * factor).round() / factor))
    } else {
        Ok(Value::from((x.round()) as i64))
    }
}

fn builtin_int(args: &[Value]) -> Result<Value, ExprError> {
    arity("int", args, 1)?;
    match &args[0] {
        Value::Number(n) => Ok(Value::from(n.as_f64().unwrap_or(0.0).trunc() as i64)),
        Value::Bool(b) => Ok(Value::from(if *b { 1i64 } else { 0 })),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .or_else(|_| s.trim().parse::<f64>().map(|f| f.trunc() as i64))
            .map(Value::from)
            .map_err(|_| ExprError::Runtime(format!("int() could not parse '{}'", s))),
        other => Err(ExprError::Runtime(format!(
            "int() of {}",
            value::type_name(other)
        ))),
    }
}

fn builtin_float(args: &[Value]) -> Result<Value, ExprError> {
    arity("float", args, 1)?;
    match &args[0] {
        Value::Number(n) => Ok(Value::from(n.as_f64().unwrap_or(0.0))),
        Value::Bool(b) => Ok(Value::from(if *b { 1.0 } else { 0.0 })),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::from)
            .map_err(|_| ExprError::Runtime(format!("float() could not parse '{}'", s))),
        other => Err(ExprError::Runtime(format!(
            "float() of {}",
            value::type_name(other)
        ))),
    }
}

fn builtin_str(args: &[Value]) -> Result<Value, ExprError> {
    arity("str", args, 1)?;
    Ok(Value::String(value::display(&args[0])))
}

fn builtin_bool(args: &[Value]) -> Result<Value, ExprError> {
    arity("bool", args, 1)?;
    Ok(Value::Bool(value::is_truthy(&args[0])))
}

fn builtin_list(args: &[Value]) -> Result<Value, ExprError> {
    arity("list", args, 1)?;
    match &args[0] {
        Value::Array(items) => Ok(Value::Array(items.clone())),
        Value::String(s) => Ok(Value::Array(
            s.chars().map(|c| Value::String(c.to_string())).collect(),
        )),
        Value::Object(o) => Ok(Value::Array(
            o.keys().map(|k| Value::String(k.clone())).collect(),
        )),
        Value::Null => Ok(Value::Array(vec![])),
        other => Err(ExprError::Runtime(format!(
            "list() of {}",
            value::type_name(other)
        ))),
    }
}

fn builtin_dict(args: &[Value]) -> Result<Value, ExprError> {
    if args.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    arity("dict", args, 1)?;
    match &args[0] {
        Value::Object(o) => Ok(Value::Object(o.clone())),
        Value::Array(pairs) => {
            let mut map = serde_json::Map::new();
            for pair in pairs {
                match pair {
                    Value::Array(kv) if kv.len() == 2 => {
                        let key = match &kv[0] {
                            Value::String(s) => s.clone(),
                            other => value::display(other),
                        };
                        map.insert(key, kv[1].clone());
                    }
                    _ => {
                        return Err(ExprError::Runtime(
                            "dict() expects a list of [key, value] pairs".into(),
                        ))
                    }
                }
            }
            Ok(Value::Object(map))
        }
        other => Err(ExprError::Runtime(format!(
            "dict() of {}",
            value::type_name(other)
        ))),
    }
}

fn builtin_sorted(args: &[Value]) -> Result<Value, ExprError> {
    arity("sorted", args, 1)?;
    let mut items = match &args[0] {
        Value::Array(items) => items.clone(),
        Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
        other => {
            return Err(ExprError::Runtime(format!(
                "sorted() of {}",
                value::type_name(other)
            )))
        }
    };
    let mut error = None;
    items.sort_by(|a, b| match compare_values("sorted", a, b) {
        Ok(ordering) => ordering,
        Err(e) => {
            error.get_or_insert(e);
            std::cmp::Ordering::Equal
        }
    });
    if let Some(e) = error {
        return Err(e);
    }
    Ok(Value::Array(items))
}

fn builtin_range(args: &[Value]) -> Result<Value, ExprError> {
    let (start, stop, step) = match args.len() {
        1 => (0, as_f64("range", &args[0])? as i64, 1),
        2 => (
            as_f64("range", &args[0])? as i64,
            as_f64("range", &args[1])? as i64,
            1,
        ),
        3 => (
            as_f64("range", &args[0])? as i64,
            as_f64("range", &args[1])? as i64,
            as_f64("range", &args[2])? as i64,
        ),
        n => {
            return Err(ExprError::Runtime(format!(
                "range() takes 1 to 3 arguments, got {}",
                n
            )))
        }
    };
    if step == 0 {
        return Err(ExprError::Runtime("range() step must not be zero".into()));
    }
    let span = if step > 0 {
        (stop - start).max(0) / step + i64::from((stop - start).max(0) % step != 0)
    } else {
        (start - stop).max(0) / (-step) + i64::from((start - stop).max(0) % (-step) != 0)
    };
    if span > RANGE_LIMIT {
        return Err(ExprError::Runtime(format!(
            "range() too large ({} elements)",
            span
        )));
    }
    let mut items = Vec::with_capacity(span as usize);
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        items.push(Value::from(current));
        current += step;
    }
    Ok(Value::Array(items))
}

fn builtin_enumerate(args: &[Value]) -> Result<Value, ExprError> {
    if args.is_empty() || args.len() > 2 {
        return Err(ExprError::Runtime(format!(
            "enumerate() takes 1 or 2 arguments, got {}",
            args.len()
        )));
    }
    let start = if args.len() == 2 {
        as_f64("enumerate", &args[1])? as i64
    } else {
        0
    };
    let items = match &args[0] {
        Value::Array(items) => items.clone(),
        Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
        other => {
            return Err(ExprError::Runtime(format!(
                "enumerate() of {}",
                value::type_name(other)
            )))
        }
    };
    Ok(Value::Array(
        items
            .into_iter()
            .enumerate()
            .map(|(i, item)| Value::Array(vec![Value::from(start + i as i64), item]))
            .collect(),
    ))
}

fn builtin_zip(args: &[Value]) -> Result<Value, ExprError> {
    let mut sequences = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Value::Array(items) => sequences.push(items),
            other => {
                return Err(ExprError::Runtime(format!(
                    "zip() of {}",
                    value::type_name(other)
                )))
            }
        }
    }
    let shortest = sequences.iter().map(|s| s.len()).min().unwrap_or(0);
    let mut rows = Vec::with_capacity(shortest);
    for i in 0..shortest {
        rows.push(Value::Array(
            sequences.iter().map(|s| s[i].clone()).collect(),
        ));
    }
    Ok(Value::Array(rows))
}

fn builtin_isinstance(args: &[Value]) -> Result<Value, ExprError> {
    arity("isinstance", args, 2)?;
    let actual = value::type_name(&args[0]);
    let matches = |name: &str| {
        name == actual
            || (name == "number" && (actual == "int" || actual == "float"))
            || (name == "int" && actual == "bool")
    };
    match &args[1] {
        Value::String(name) => Ok(Value::Bool(matches(name))),
        Value::Array(names) => Ok(Value::Bool(names.iter().any(|n| match n {
            Value::String(name) => matches(name),
            _ => false,
        }))),
        other => Err(ExprError::Runtime(format!(
            "isinstance() expects a type name, got {}",
            value::type_name(other)
        ))),
    }
}

fn builtin_all_any(args: &[Value], require_all: bool) -> Result<Value, ExprError> {
    let name = if require_all { "all" } else { "any" };
    arity(name, args, 1)?;
    let items = match &args[0] {
        Value::Array(items) => items,
        other => {
            return Err(ExprError::Runtime(format!(
                "{}() expects a list, got {}",
                name,
                value::type_name(other)
            )))
        }
    };
    let result = if require_all {
        items.iter().all(value::is_truthy)
    } else {
        items.iter().any(value::is_truthy)
    };
    Ok(Value::Bool(result))
}

/// Stable FNV-1a over the canonical JSON encoding, so `hash(x)` is
/// reproducible across processes (expression purity).
fn builtin_hash(args: &[Value]) -> Result<Value, ExprError> {
    arity("hash", args, 1)?;
    let encoded = serde_json::to_string(&args[0])
        .map_err(|e| ExprError::Runtime(format!("hash() serialization failed: {}", e)))?;
    let mut state: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in encoded.as_bytes() {
        state ^= u64::from(*byte);
        state = state.wrapping_mul(0x0000_0100_0000_01b3);
    }
    Ok(Value::from(state as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_min_max_forms() {
        assert_eq!(call("min", &[json!(3), json!(1), json!(2)]).unwrap(), json!(1));
        assert_eq!(call("max", &[json!([3, 1, 2])]).unwrap(), json!(3));
        assert!(call("min", &[json!([])]).is_err());
    }

    #[test]
    fn test_len_and_sum() {
        assert_eq!(call("len", &[json!("héllo")]).unwrap(), json!(5));
        assert_eq!(call("len", &[json!([1, 2])]).unwrap(), json!(2));
        assert_eq!(call("sum", &[json!([1, 2, 3.5])]).unwrap(), json!(6.5));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(call("int", &[json!("42")]).unwrap(), json!(42));
        assert_eq!(call("int", &[json!(3.9)]).unwrap(), json!(3));
        assert_eq!(call("float", &[json!("2.5")]).unwrap(), json!(2.5));
        assert_eq!(call("str", &[json!(7)]).unwrap(), json!("7"));
        assert_eq!(call("bool", &[json!("")]).unwrap(), json!(false));
    }

    #[test]
    fn test_range() {
        assert_eq!(call("range", &[json!(3)]).unwrap(), json!([0, 1, 2]));
        assert_eq!(
            call("range", &[json!(1), json!(7), json!(2)]).unwrap(),
            json!([1, 3, 5])
        );
        assert!(call("range", &[json!(1), json!(2), json!(0)]).is_err());
    }

    #[test]
    fn test_enumerate_zip() {
        assert_eq!(
            call("enumerate", &[json!(["a", "b"])]).unwrap(),
            json!([[0, "a"], [1, "b"]])
        );
        assert_eq!(
            call("zip", &[json!([1, 2, 3]), json!(["a", "b"])]).unwrap(),
            json!([[1, "a"], [2, "b"]])
        );
    }

    #[test]
    fn test_sorted() {
        assert_eq!(
            call("sorted", &[json!([3, 1, 2])]).unwrap(),
            json!([1, 2, 3])
        );
        assert!(call("sorted", &[json!([1, "a"])]).is_err());
    }

    #[test]
    fn test_isinstance() {
        assert_eq!(
            call("isinstance", &[json!(1), json!("int")]).unwrap(),
            json!(true)
        );
        assert_eq!(
            call("isinstance", &[json!(1.5), json!(["int", "float"])]).unwrap(),
            json!(true)
        );
        assert_eq!(
            call("isinstance", &[json!("x"), json!("int")]).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn test_hash_is_stable() {
        let a = call("hash", &[json!({"k": [1, 2]})]).unwrap();
        let b = call("hash", &[json!({"k": [1, 2]})]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_all_any() {
        assert_eq!(call("all", &[json!([1, "x", true])]).unwrap(), json!(true));
        assert_eq!(call("all", &[json!([1, 0])]).unwrap(), json!(false));
        assert_eq!(call("any", &[json!([0, "", 2])]).unwrap(), json!(true));
    }
}
