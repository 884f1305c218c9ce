//! String helpers.

use serde_json::Value;

use super::Args;
use crate::sandbox::value::{check_size, display, equals, replaced_len, type_name};

pub(super) const NAMES: &[&str] = &[
    "upcase",
    "downcase",
    "strip",
    "capitalize",
    "split",
    "join",
    "replace",
    "contains",
    "starts_with",
    "ends_with",
    "truncate",
    "lines",
    "format",
    "to_s",
];

/// Runs string helper `name`, or returns `None` when it is not one.
/// `limit` caps the byte length of any string built.
pub(super) fn call(name: &str, args: &[Value], limit: usize) -> Option<Result<Value, String>> {
    if !NAMES.contains(&name) {
        return None;
    }
    let sized = |size: usize| check_size(size, limit).map_err(|e| format!("{name}: {e}"));
    Some(dispatch(name, &Args::new(name, args), &sized))
}

fn dispatch(name: &str, a: &Args, sized: &dyn Fn(usize) -> Result<(), String>) -> Result<Value, String> {
    let value = match name {
        "upcase" => {
            a.arity(1, 1)?;
            Value::from(a.str(0)?.to_uppercase())
        }
        "downcase" => {
            a.arity(1, 1)?;
            Value::from(a.str(0)?.to_lowercase())
        }
        "strip" => {
            a.arity(1, 1)?;
            Value::from(a.str(0)?.trim())
        }
        "capitalize" => {
            a.arity(1, 1)?;
            Value::from(capitalize(a.str(0)?))
        }
        "split" => {
            a.arity(1, 2)?;
            let s = a.str(0)?;
            let parts: Vec<Value> = match a.opt_str(1)? {
                Some("") => s.chars().map(|c| Value::from(c.to_string())).collect(),
                Some(sep) => s.split(sep).map(Value::from).collect(),
                None => s.split_whitespace().map(Value::from).collect(),
            };
            Value::Array(parts)
        }
        "join" => {
            a.arity(1, 2)?;
            let sep = a.opt_str(1)?.unwrap_or("");
            let parts: Vec<String> = a.array(0)?.iter().map(display).collect();
            let seps = parts.len().saturating_sub(1).saturating_mul(sep.len());
            sized(parts.iter().fold(seps, |n, p| n.saturating_add(p.len())))?;
            Value::from(parts.join(sep))
        }
        "replace" => {
            a.arity(3, 3)?;
            let from = a.str(1)?;
            if from.is_empty() {
                return Err("replace: pattern must not be empty".into());
            }
            let (s, to) = (a.str(0)?, a.str(2)?);
            sized(replaced_len(s, from, to))?;
            Value::from(s.replace(from, to))
        }
        "contains" => {
            a.arity(2, 2)?;
            Value::Bool(contains(a.value(0)?, a.value(1)?)?)
        }
        "starts_with" => {
            a.arity(2, 2)?;
            Value::Bool(a.str(0)?.starts_with(a.str(1)?))
        }
        "ends_with" => {
            a.arity(2, 2)?;
            Value::Bool(a.str(0)?.ends_with(a.str(1)?))
        }
        "truncate" => {
            a.arity(2, 3)?;
            let limit = a.int(1)?;
            if limit < 0 {
                return Err("truncate: length must not be negative".into());
            }
            let suffix = a.opt_str(2)?.unwrap_or("...");
            Value::from(truncate(a.str(0)?, limit as usize, suffix))
        }
        "lines" => {
            a.arity(1, 1)?;
            Value::Array(a.str(0)?.lines().map(Value::from).collect())
        }
        "format" => {
            a.arity(2, 2)?;
            let template = a.str(0)?;
            let fields = a.object(1)?;
            let mut out = template.to_string();
            for (key, value) in fields {
                let (placeholder, value) = (format!("{{{key}}}"), display(value));
                sized(replaced_len(&out, &placeholder, &value))?;
                out = out.replace(&placeholder, &value);
            }
            Value::from(out)
        }
        "to_s" => {
            a.arity(1, 1)?;
            Value::from(display(a.value(0)?))
        }
        other => return Err(format!("unknown helper `{other}`")),
    };
    Ok(value)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, String> {
    match haystack {
        Value::String(s) => match needle {
            Value::String(n) => Ok(s.contains(n.as_str())),
            other => Err(format!(
                "contains: cannot search a string for {}",
                type_name(other)
            )),
        },
        Value::Array(items) => Ok(items.iter().any(|item| equals(item, needle))),
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            other => Err(format!("contains: object keys are strings, got {}", type_name(other))),
        },
        Value::Null => Ok(false),
        other => Err(format!("contains: cannot search {}", type_name(other))),
    }
}

/// Cuts `s` to at most `limit` characters, appending `suffix` when cut.
fn truncate(s: &str, limit: usize, suffix: &str) -> String {
    if s.chars().count() <= limit {
        return s.to_string();
    }
    let mut out: String = s.chars().take(limit).collect();
    out.push_str(suffix);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::value::DEFAULT_MAX_VALUE_SIZE;
    use serde_json::json;

    fn run(name: &str, args: &[Value]) -> Result<Value, String> {
        call(name, args, DEFAULT_MAX_VALUE_SIZE).expect("string helper")
    }

    #[test]
    fn test_case_helpers() {
        assert_eq!(run("upcase", &[json!("abc")]), Ok(json!("ABC")));
        assert_eq!(run("downcase", &[json!("ÀB")]), Ok(json!("àb")));
        assert_eq!(run("capitalize", &[json!("hELLO")]), Ok(json!("Hello")));
        assert_eq!(run("capitalize", &[json!("")]), Ok(json!("")));
        assert_eq!(run("strip", &[json!("  x \n")]), Ok(json!("x")));
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(run("split", &[json!("a b  c")]), Ok(json!(["a", "b", "c"])));
        assert_eq!(run("split", &[json!("a,b"), json!(",")]), Ok(json!(["a", "b"])));
        assert_eq!(run("split", &[json!("ab"), json!("")]), Ok(json!(["a", "b"])));
        assert_eq!(run("join", &[json!(["a", 1, true]), json!("-")]), Ok(json!("a-1-true")));
    }

    #[test]
    fn test_contains_is_polymorphic() {
        assert_eq!(run("contains", &[json!("haystack"), json!("st")]), Ok(json!(true)));
        assert_eq!(run("contains", &[json!([1, 2]), json!(2.0)]), Ok(json!(true)));
        assert_eq!(run("contains", &[json!({"k": 1}), json!("k")]), Ok(json!(true)));
        assert_eq!(run("contains", &[json!(null), json!("k")]), Ok(json!(false)));
        assert!(run("contains", &[json!(5), json!(5)]).is_err());
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(run("truncate", &[json!("héllo"), json!(2)]), Ok(json!("hé...")));
        assert_eq!(run("truncate", &[json!("hi"), json!(5)]), Ok(json!("hi")));
        assert_eq!(
            run("truncate", &[json!("abcdef"), json!(3), json!("…")]),
            Ok(json!("abc…"))
        );
        assert!(run("truncate", &[json!("a"), json!(-1)]).is_err());
    }

    #[test]
    fn test_format_substitutes_known_keys() {
        assert_eq!(
            run("format", &[json!("{a} + {b} = {c}"), json!({"a": 1, "b": 2})]),
            Ok(json!("1 + 2 = {c}"))
        );
    }

    #[test]
    fn test_growth_is_capped() {
        let limited = |name: &str, args: &[Value]| call(name, args, 10).expect("string helper");
        assert_eq!(
            limited("replace", &[json!("aaaaa"), json!("a"), json!("bb")]),
            Ok(json!("bbbbbbbbbb"))
        );
        let err = limited("replace", &[json!("aaaaa"), json!("a"), json!("bbb")]).unwrap_err();
        assert_eq!(err, "replace: value exceeds the size limit of 10");
        let err = limited("format", &[json!("{x}{x}{x}"), json!({"x": "abcd"})]).unwrap_err();
        assert!(err.starts_with("format: value exceeds"));
        assert!(limited("join", &[json!(["12345", "67890"]), json!(",")]).is_err());
        assert!(limited("upcase", &[json!("short")]).is_ok());
    }

    #[test]
    fn test_replace_rejects_empty_pattern() {
        assert_eq!(run("replace", &[json!("aXa"), json!("a"), json!("b")]), Ok(json!("bXb")));
        assert!(run("replace", &[json!("a"), json!(""), json!("b")]).is_err());
    }

    #[test]
    fn test_non_string_helpers_pass_through() {
        assert!(call("len", &[], DEFAULT_MAX_VALUE_SIZE).is_none());
    }
}
