//! Runtime values.
//!
//! Sandboxed code works directly on JSON values: task inputs, outputs and
//! model replies are all JSON, so there is no conversion at the boundary.

use std::cmp::Ordering;

pub use serde_json::{Map, Value};

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `nil` and `false` are falsy; everything else is truthy.
pub fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

/// Renders a value for string concatenation and prompts.
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Default cap on string bytes and collection entries.
pub const DEFAULT_MAX_VALUE_SIZE: usize = 1_000_000;

/// Rejects a string of `size` bytes or a collection of `size` entries when
/// it would exceed `limit`.
pub fn check_size(size: usize, limit: usize) -> Result<(), String> {
    if size > limit {
        return Err(format!("value exceeds the size limit of {limit}"));
    }
    Ok(())
}

/// Byte length of `s` once every `from` is replaced by `to`. `from` must
/// not be empty.
pub fn replaced_len(s: &str, from: &str, to: &str) -> usize {
    let n = s.matches(from).count();
    (s.len() - n * from.len()).saturating_add(n.saturating_mul(to.len()))
}

/// Serialized size in bytes, used for telemetry.
pub fn json_size<T: serde::Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

pub fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

pub fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

pub fn float(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Equality that treats `1` and `1.0` as equal.
pub fn equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => match (as_int(a), as_int(b)) {
            (Some(x), Some(y)) => x == y,
            _ => as_float(a) == as_float(b),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| equals(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| equals(v, other)))
        }
        _ => a == b,
    }
}

/// Ordering for numbers and strings; `None` when the pair is not comparable.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => match (as_int(a), as_int(b)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => as_float(a)?.partial_cmp(&as_float(b)?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_names() {
        assert_eq!(type_name(&json!(null)), "nil");
        assert_eq!(type_name(&json!(3)), "integer");
        assert_eq!(type_name(&json!(3.5)), "number");
        assert_eq!(type_name(&json!({})), "object");
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(false)));
        assert!(truthy(&json!(0)));
        assert!(truthy(&json!("")));
    }

    #[test]
    fn test_numeric_equality_across_kinds() {
        assert!(equals(&json!(1), &json!(1.0)));
        assert!(equals(&json!({"a": [1, 2]}), &json!({"a": [1.0, 2]})));
        assert!(!equals(&json!("1"), &json!(1)));
    }

    #[test]
    fn test_compare() {
        assert_eq!(compare(&json!(2), &json!(10)), Some(Ordering::Less));
        assert_eq!(compare(&json!("b"), &json!("a")), Some(Ordering::Greater));
        assert_eq!(compare(&json!(1), &json!("a")), None);
    }

    #[test]
    fn test_display_and_size() {
        assert_eq!(display(&json!("hi")), "hi");
        assert_eq!(display(&json!([1, 2])), "[1,2]");
        assert_eq!(json_size(&json!({"a": 1})), 7);
    }
}
