//! Collection, numeric and conversion helpers, plus `fail`, `log` and `now`.

use std::cmp::Ordering;

use serde_json::Value;
use tracing::info;

use super::Args;
use crate::sandbox::value::{as_float, as_int, check_size, compare, display, equals, float, type_name};

pub(super) const NAMES: &[&str] = &[
    "len",
    "keys",
    "values",
    "get",
    "merge",
    "push",
    "first",
    "last",
    "slice",
    "range",
    "sum",
    "min",
    "max",
    "sort",
    "reverse",
    "uniq",
    "to_i",
    "to_f",
    "round",
    "abs",
    "type_of",
    "to_json",
    "parse_json",
    "is_nil",
    "fail",
    "log",
    "now",
];

/// Largest array `range` will build.
const MAX_RANGE: i64 = 100_000;

/// Runs data helper `name`, or returns `None` when it is not one. `limit`
/// caps the entry count of any collection built.
pub(super) fn call(name: &str, args: &[Value], limit: usize) -> Option<Result<Value, String>> {
    if !NAMES.contains(&name) {
        return None;
    }
    let sized = |size: usize| check_size(size, limit).map_err(|e| format!("{name}: {e}"));
    Some(dispatch(name, &Args::new(name, args), &sized))
}

fn dispatch(name: &str, a: &Args, sized: &dyn Fn(usize) -> Result<(), String>) -> Result<Value, String> {
    let value = match name {
        "len" => {
            a.arity(1, 1)?;
            let n = match a.value(0)? {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => return Err(format!("len: {} has no length", type_name(other))),
            };
            Value::from(n)
        }
        "keys" => {
            a.arity(1, 1)?;
            Value::Array(a.object(0)?.keys().cloned().map(Value::from).collect())
        }
        "values" => {
            a.arity(1, 1)?;
            Value::Array(a.object(0)?.values().cloned().collect())
        }
        "get" => {
            a.arity(2, 3)?;
            let default = a.get(2).cloned().unwrap_or(Value::Null);
            let found = match (a.value(0)?, a.value(1)?) {
                (Value::Object(map), Value::String(key)) => map.get(key).cloned(),
                (Value::Array(items), index) => as_int(index)
                    .and_then(|i| index_of(items.len(), i))
                    .map(|i| items[i].clone()),
                (Value::Null, _) => None,
                (container, _) => {
                    return Err(format!("get: cannot index {}", type_name(container)))
                }
            };
            found.unwrap_or(default)
        }
        "merge" => {
            a.arity(2, 2)?;
            let (left, right) = (a.object(0)?, a.object(1)?);
            sized(left.len().saturating_add(right.len()))?;
            let mut merged = left.clone();
            for (key, value) in right {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        "push" => {
            a.arity(2, 2)?;
            let items = a.array(0)?;
            sized(items.len().saturating_add(1))?;
            let mut items = items.clone();
            items.push(a.value(1)?.clone());
            Value::Array(items)
        }
        "first" => {
            a.arity(1, 1)?;
            a.array(0)?.first().cloned().unwrap_or(Value::Null)
        }
        "last" => {
            a.arity(1, 1)?;
            a.array(0)?.last().cloned().unwrap_or(Value::Null)
        }
        "slice" => {
            a.arity(2, 3)?;
            let start = a.int(1)?;
            let len = match a.get(2) {
                None | Some(Value::Null) => None,
                Some(_) => Some(a.int(2)?),
            };
            slice(a.value(0)?, start, len)?
        }
        "range" => {
            a.arity(1, 2)?;
            let (start, end) = if a.get(1).is_some() {
                (a.int(0)?, a.int(1)?)
            } else {
                (0, a.int(0)?)
            };
            if end.saturating_sub(start) > MAX_RANGE {
                return Err(format!("range: more than {MAX_RANGE} elements"));
            }
            Value::Array((start..end).map(Value::from).collect())
        }
        "sum" => {
            a.arity(1, 1)?;
            sum(a.array(0)?)?
        }
        "min" => {
            a.arity(1, 1)?;
            extreme(a.array(0)?, Ordering::Less)?
        }
        "max" => {
            a.arity(1, 1)?;
            extreme(a.array(0)?, Ordering::Greater)?
        }
        "sort" => {
            a.arity(1, 1)?;
            let mut items = a.array(0)?.clone();
            let mut incomparable = false;
            items.sort_by(|x, y| {
                compare(x, y).unwrap_or_else(|| {
                    incomparable = true;
                    Ordering::Equal
                })
            });
            if incomparable {
                return Err("sort: elements are not comparable".into());
            }
            Value::Array(items)
        }
        "reverse" => {
            a.arity(1, 1)?;
            match a.value(0)? {
                Value::Array(items) => Value::Array(items.iter().rev().cloned().collect()),
                Value::String(s) => Value::from(s.chars().rev().collect::<String>()),
                other => return Err(format!("reverse: cannot reverse {}", type_name(other))),
            }
        }
        "uniq" => {
            a.arity(1, 1)?;
            let mut seen: Vec<Value> = Vec::new();
            for item in a.array(0)? {
                if !seen.iter().any(|s| equals(s, item)) {
                    seen.push(item.clone());
                }
            }
            Value::Array(seen)
        }
        "to_i" => {
            a.arity(1, 1)?;
            Value::from(to_i(a.value(0)?)?)
        }
        "to_f" => {
            a.arity(1, 1)?;
            float(to_f(a.value(0)?)?)
        }
        "round" => {
            a.arity(1, 2)?;
            let n = a.num(0)?;
            let digits = match a.get(1) {
                None => 0,
                Some(_) => a.int(1)?.clamp(0, 15),
            };
            if digits == 0 {
                Value::from(n.round() as i64)
            } else {
                let factor = 10f64.powi(digits as i32);
                float((n * factor).round() / factor)
            }
        }
        "abs" => {
            a.arity(1, 1)?;
            match as_int(a.value(0)?) {
                Some(i) => Value::from(
                    i.checked_abs()
                        .ok_or_else(|| "abs: integer overflow".to_string())?,
                ),
                None => float(a.num(0)?.abs()),
            }
        }
        "type_of" => {
            a.arity(1, 1)?;
            Value::from(type_name(a.value(0)?))
        }
        "to_json" => {
            a.arity(1, 1)?;
            Value::from(a.value(0)?.to_string())
        }
        "parse_json" => {
            a.arity(1, 1)?;
            serde_json::from_str(a.str(0)?).map_err(|e| format!("parse_json: {e}"))?
        }
        "is_nil" => {
            a.arity(1, 1)?;
            Value::Bool(a.value(0)?.is_null())
        }
        "fail" => {
            a.arity(0, 1)?;
            let message = a.get(0).map(display).unwrap_or_default();
            return Err(if message.is_empty() {
                "failed".to_string()
            } else {
                message
            });
        }
        "log" => {
            a.arity(1, 8)?;
            let parts: Vec<String> = (0..8).filter_map(|i| a.get(i)).map(display).collect();
            info!(target: "taskweave::sandbox", "{}", parts.join(" "));
            Value::Null
        }
        "now" => {
            a.arity(0, 0)?;
            Value::from(chrono::Utc::now().to_rfc3339())
        }
        other => return Err(format!("unknown helper `{other}`")),
    };
    Ok(value)
}

/// Resolves a possibly negative index against `len`.
fn index_of(len: usize, index: i64) -> Option<usize> {
    let resolved = if index < 0 {
        (len as i64).checked_add(index)?
    } else {
        index
    };
    (0..len as i64).contains(&resolved).then_some(resolved as usize)
}

fn slice(value: &Value, start: i64, len: Option<i64>) -> Result<Value, String> {
    let bounds = |total: usize| -> (usize, usize) {
        let from = if start < 0 {
            (total as i64 + start).max(0) as usize
        } else {
            (start as usize).min(total)
        };
        let count = len.map(|l| l.max(0) as usize).unwrap_or(total);
        (from, from.saturating_add(count).min(total))
    };
    match value {
        Value::Array(items) => {
            let (from, to) = bounds(items.len());
            Ok(Value::Array(items[from..to].to_vec()))
        }
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (from, to) = bounds(chars.len());
            Ok(Value::from(chars[from..to].iter().collect::<String>()))
        }
        other => Err(format!("slice: cannot slice {}", type_name(other))),
    }
}

fn sum(items: &[Value]) -> Result<Value, String> {
    if items.iter().all(|v| as_int(v).is_some()) {
        let mut total: i64 = 0;
        for item in items {
            let n = as_int(item).unwrap_or_default();
            total = total
                .checked_add(n)
                .ok_or_else(|| "sum: integer overflow".to_string())?;
        }
        return Ok(Value::from(total));
    }
    let mut total = 0.0;
    for item in items {
        total += as_float(item)
            .ok_or_else(|| format!("sum: cannot add {}", type_name(item)))?;
    }
    Ok(float(total))
}

fn extreme(items: &[Value], wanted: Ordering) -> Result<Value, String> {
    let mut best: Option<&Value> = None;
    for item in items {
        best = match best {
            None => Some(item),
            Some(current) => match compare(item, current) {
                Some(ord) if ord == wanted => Some(item),
                Some(_) => Some(current),
                None => return Err("elements are not comparable".into()),
            },
        };
    }
    Ok(best.cloned().unwrap_or(Value::Null))
}

fn to_i(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(_) => match as_int(value) {
            Some(i) => Ok(i),
            None => Ok(as_float(value).unwrap_or_default().trunc() as i64),
        },
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .or_else(|_| trimmed.parse::<f64>().map(|f| f.trunc() as i64))
                .map_err(|_| format!("to_i: `{s}` is not a number"))
        }
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Null => Ok(0),
        other => Err(format!("to_i: cannot convert {}", type_name(other))),
    }
}

fn to_f(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(_) => Ok(as_float(value).unwrap_or_default()),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("to_f: `{s}` is not a number")),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Ok(0.0),
        other => Err(format!("to_f: cannot convert {}", type_name(other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::value::DEFAULT_MAX_VALUE_SIZE;
    use serde_json::json;

    fn run(name: &str, args: &[Value]) -> Result<Value, String> {
        call(name, args, DEFAULT_MAX_VALUE_SIZE).expect("data helper")
    }

    #[test]
    fn test_len_counts_characters_and_entries() {
        assert_eq!(run("len", &[json!("héllo")]), Ok(json!(5)));
        assert_eq!(run("len", &[json!({"a": 1})]), Ok(json!(1)));
        assert_eq!(run("len", &[json!(null)]), Ok(json!(0)));
        assert!(run("len", &[json!(3)]).is_err());
    }

    #[test]
    fn test_get_with_default_and_negative_index() {
        assert_eq!(run("get", &[json!({"a": 1}), json!("a")]), Ok(json!(1)));
        assert_eq!(run("get", &[json!({"a": 1}), json!("b"), json!(0)]), Ok(json!(0)));
        assert_eq!(run("get", &[json!([1, 2, 3]), json!(-1)]), Ok(json!(3)));
        assert_eq!(run("get", &[json!([1]), json!(5)]), Ok(json!(null)));
    }

    #[test]
    fn test_merge_prefers_right() {
        assert_eq!(
            run("merge", &[json!({"a": 1, "b": 1}), json!({"b": 2})]),
            Ok(json!({"a": 1, "b": 2}))
        );
    }

    #[test]
    fn test_growth_is_capped() {
        let limited = |name: &str, args: &[Value]| call(name, args, 2).expect("data helper");
        assert_eq!(limited("push", &[json!([1]), json!(2)]), Ok(json!([1, 2])));
        let err = limited("push", &[json!([1, 2]), json!(3)]).unwrap_err();
        assert_eq!(err, "push: value exceeds the size limit of 2");
        assert!(limited("merge", &[json!({"a": 1}), json!({"b": 2, "c": 3})]).is_err());
    }

    #[test]
    fn test_slice_and_range() {
        assert_eq!(run("slice", &[json!([1, 2, 3, 4]), json!(1), json!(2)]), Ok(json!([2, 3])));
        assert_eq!(run("slice", &[json!("abcdef"), json!(-2)]), Ok(json!("ef")));
        assert_eq!(run("slice", &[json!([1]), json!(9)]), Ok(json!([])));
        assert_eq!(run("range", &[json!(3)]), Ok(json!([0, 1, 2])));
        assert_eq!(run("range", &[json!(2), json!(4)]), Ok(json!([2, 3])));
        assert!(run("range", &[json!(0), json!(1_000_000)]).is_err());
    }

    #[test]
    fn test_sum_keeps_integers_when_possible() {
        assert_eq!(run("sum", &[json!([1, 2, 3])]), Ok(json!(6)));
        assert_eq!(run("sum", &[json!([1, 2.5])]), Ok(json!(3.5)));
        assert_eq!(run("sum", &[json!([])]), Ok(json!(0)));
        assert!(run("sum", &[json!([i64::MAX, 1])]).is_err());
        assert!(run("sum", &[json!(["a"])]).is_err());
    }

    #[test]
    fn test_min_max_sort() {
        assert_eq!(run("min", &[json!([3, 1.5, 2])]), Ok(json!(1.5)));
        assert_eq!(run("max", &[json!(["b", "c", "a"])]), Ok(json!("c")));
        assert_eq!(run("max", &[json!([])]), Ok(json!(null)));
        assert_eq!(run("sort", &[json!([3, 1, 2])]), Ok(json!([1, 2, 3])));
        assert!(run("sort", &[json!([1, "a"])]).is_err());
    }

    #[test]
    fn test_uniq_and_reverse() {
        assert_eq!(run("uniq", &[json!([1, 1.0, 2, 1])]), Ok(json!([1, 2])));
        assert_eq!(run("reverse", &[json!("abc")]), Ok(json!("cba")));
        assert_eq!(run("reverse", &[json!([1, 2])]), Ok(json!([2, 1])));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(run("to_i", &[json!(" 42 ")]), Ok(json!(42)));
        assert_eq!(run("to_i", &[json!("3.9")]), Ok(json!(3)));
        assert_eq!(run("to_i", &[json!(-2.7)]), Ok(json!(-2)));
        assert!(run("to_i", &[json!("abc")]).is_err());
        assert_eq!(run("to_f", &[json!("2.5")]), Ok(json!(2.5)));
        assert_eq!(run("round", &[json!(2.5)]), Ok(json!(3)));
        assert_eq!(run("round", &[json!(3.14159), json!(2)]), Ok(json!(3.14)));
        assert_eq!(run("abs", &[json!(-4)]), Ok(json!(4)));
    }

    #[test]
    fn test_json_helpers() {
        assert_eq!(run("to_json", &[json!({"a": [1]})]), Ok(json!("{\"a\":[1]}")));
        assert_eq!(run("parse_json", &[json!("{\"a\": 1}")]), Ok(json!({"a": 1})));
        assert!(run("parse_json", &[json!("{")]).is_err());
        assert_eq!(run("type_of", &[json!(1.5)]), Ok(json!("number")));
        assert_eq!(run("is_nil", &[json!(null)]), Ok(json!(true)));
    }

    #[test]
    fn test_fail_raises_message() {
        assert_eq!(run("fail", &[json!("bad input")]), Err("bad input".into()));
        assert_eq!(run("fail", &[]), Err("failed".into()));
    }

    #[test]
    fn test_log_returns_nil() {
        assert_eq!(run("log", &[json!("hello"), json!(1)]), Ok(json!(null)));
    }
}
