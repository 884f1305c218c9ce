//! Task input and output schemas.
//!
//! A schema is an ordered list of `field: type` pairs. Inputs are checked
//! strictly; outputs (which often come from a language model) are
//! normalised and coerced before they are checked.

use std::fmt;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::Error;
use crate::sandbox::value::type_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(FieldType::String),
            "integer" => Some(FieldType::Integer),
            "number" => Some(FieldType::Number),
            "boolean" => Some(FieldType::Boolean),
            "array" => Some(FieldType::Array),
            "object" => Some(FieldType::Object),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }

    /// Checks `value` and returns it in canonical form: integers written
    /// as whole floats become integers.
    pub fn check(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (FieldType::String, Value::String(_))
            | (FieldType::Boolean, Value::Bool(_))
            | (FieldType::Array, Value::Array(_))
            | (FieldType::Object, Value::Object(_))
            | (FieldType::Number, Value::Number(_)) => Some(value.clone()),
            (FieldType::Integer, Value::Number(n)) => {
                if n.is_i64() || n.is_u64() {
                    Some(value.clone())
                } else {
                    whole(n.as_f64()?).map(Value::from)
                }
            }
            _ => None,
        }
    }

    /// Like [`check`](Self::check), but also parses strings into
    /// integers, numbers and booleans.
    fn coerce(self, value: &Value) -> Option<Value> {
        if let Some(ok) = self.check(value) {
            return Some(ok);
        }
        let s = value.as_str()?.trim();
        match self {
            FieldType::Integer => s
                .parse::<i64>()
                .ok()
                .or_else(|| whole(s.parse::<f64>().ok()?))
                .map(Value::from),
            FieldType::Number => s
                .parse::<i64>()
                .map(Value::from)
                .ok()
                .or_else(|| {
                    let f = s.parse::<f64>().ok().filter(|f| f.is_finite())?;
                    serde_json::Number::from_f64(f).map(Value::Number)
                }),
            FieldType::Boolean => match s.to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn whole(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15).then_some(f as i64)
}

/// Lower-cases, trims and maps `-` and spaces to `_`.
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Normalises object keys in `value` down to `depth` levels. The first
/// key wins when two keys normalise to the same name.
pub fn normalize_keys(value: Value, depth: usize) -> Value {
    if depth == 0 {
        return value;
    }
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let key = normalize_key(&key);
                if !out.contains_key(&key) {
                    out.insert(key, normalize_keys(child, depth - 1));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| normalize_keys(item, depth - 1))
                .collect(),
        ),
        other => other,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: Vec<(String, FieldType)>,
}

impl Schema {
    pub fn new(fields: Vec<(String, FieldType)>) -> Self {
        Self { fields }
    }

    /// Builds a schema from `{ field: "type", ... }`.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let map = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            other => {
                return Err(format!(
                    "schema must be a map of field names to types, got {}",
                    type_name(other)
                ))
            }
        };
        let mut fields = Vec::with_capacity(map.len());
        for (name, kind) in map {
            let kind = kind
                .as_str()
                .and_then(FieldType::parse)
                .ok_or_else(|| {
                    format!(
                        "field `{name}` has unknown type {kind}; expected string, integer, number, boolean, array or object"
                    )
                })?;
            fields.push((name.clone(), kind));
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[(String, FieldType)] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Checks every declared input. Undeclared inputs pass through.
    pub fn check_inputs(&self, task: &str, inputs: &Value) -> Result<Map<String, Value>, Error> {
        let Value::Object(map) = inputs else {
            return Err(contract(
                task,
                None,
                format!("inputs must be an object, got {}", type_name(inputs)),
            ));
        };
        let mut checked = map.clone();
        for (name, kind) in &self.fields {
            let value = match map.get(name) {
                None | Some(Value::Null) => {
                    return Err(contract(
                        task,
                        Some(name),
                        format!("missing required input `{name}`"),
                    ))
                }
                Some(value) => value,
            };
            let canonical = kind.check(value).ok_or_else(|| {
                contract(
                    task,
                    Some(name),
                    format!("input `{name}` must be {kind}, got {}", type_name(value)),
                )
            })?;
            checked.insert(name.clone(), canonical);
        }
        Ok(checked)
    }

    /// Normalises keys, coerces declared fields and checks that every one
    /// is present. Undeclared keys are kept after the declared ones.
    pub fn coerce_outputs(
        &self,
        task: &str,
        outputs: Value,
        depth: usize,
    ) -> Result<Map<String, Value>, Error> {
        let kind = type_name(&outputs);
        let Value::Object(map) = normalize_keys(outputs, depth.max(1)) else {
            return Err(contract(
                task,
                None,
                format!("result must be an object, got {kind}"),
            ));
        };
        let mut rest = map;
        let mut coerced = Map::with_capacity(rest.len());
        for (name, kind) in &self.fields {
            let value = match rest.remove(&normalize_key(name)) {
                None | Some(Value::Null) => {
                    return Err(contract(
                        task,
                        Some(name),
                        format!("missing required output `{name}`"),
                    ))
                }
                Some(value) => value,
            };
            let value = kind.coerce(&value).ok_or_else(|| {
                contract(
                    task,
                    Some(name),
                    format!("output `{name}` must be {kind}, got {}", type_name(&value)),
                )
            })?;
            coerced.insert(name.clone(), value);
        }
        for (key, value) in rest {
            coerced.entry(key).or_insert(value);
        }
        Ok(coerced)
    }

    /// One `- name (type)` line per field, for prompts.
    pub fn describe(&self) -> String {
        self.fields
            .iter()
            .map(|(name, kind)| format!("- {name} ({kind})"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// JSON Schema with every field required.
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, kind)| (name.clone(), json!({ "type": kind.as_str() })))
            .collect();
        let required: Vec<&str> = self.fields.iter().map(|(name, _)| name.as_str()).collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

fn contract(task: &str, field: Option<&str>, message: String) -> Error {
    Error::Contract {
        task: task.to_string(),
        field: field.map(str::to_string),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(value: Value) -> Schema {
        Schema::from_value(&value).unwrap()
    }

    fn field_of(err: &Error) -> Option<&str> {
        match err {
            Error::Contract { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    #[test]
    fn test_from_value_keeps_order_and_rejects_unknown_types() {
        let s = schema(json!({"b": "integer", "a": "string"}));
        let names: Vec<&str> = s.fields().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        let err = Schema::from_value(&json!({"a": "float"})).unwrap_err();
        assert!(err.contains("unknown type"));
        assert!(Schema::from_value(&json!(["a"])).is_err());
        assert!(Schema::from_value(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_check_inputs_missing_field() {
        let s = schema(json!({"email": "string"}));
        let err = s.check_inputs("notify", &json!({})).unwrap_err();
        assert_eq!(field_of(&err), Some("email"));
        assert!(err.to_string().contains("missing required input `email`"));
    }

    #[test]
    fn test_check_inputs_numeric_rules() {
        let s = schema(json!({"n": "number", "i": "integer"}));
        let ok = s.check_inputs("t", &json!({"n": 2, "i": 4.0})).unwrap();
        assert_eq!(ok["n"], json!(2));
        assert_eq!(ok["i"], json!(4));
        let err = s.check_inputs("t", &json!({"n": 1, "i": 4.5})).unwrap_err();
        assert_eq!(field_of(&err), Some("i"));
        let err = s.check_inputs("t", &json!({"n": "1", "i": 4})).unwrap_err();
        assert!(err.to_string().contains("input `n` must be number, got string"));
    }

    #[test]
    fn test_check_inputs_passes_extras_through() {
        let s = schema(json!({"a": "integer"}));
        let ok = s.check_inputs("t", &json!({"a": 1, "trace": "x"})).unwrap();
        assert_eq!(ok.get("trace"), Some(&json!("x")));
    }

    #[test]
    fn test_check_inputs_requires_object() {
        let s = schema(json!({"a": "integer"}));
        let err = s.check_inputs("t", &json!([1])).unwrap_err();
        assert_eq!(field_of(&err), None);
    }

    #[test]
    fn test_coerce_outputs_normalises_keys() {
        let s = schema(json!({"total_count": "integer", "is_valid": "boolean"}));
        let out = s
            .coerce_outputs("t", json!({" Total-Count ": "42", "Is Valid": "TRUE"}), 8)
            .unwrap();
        assert_eq!(out, *json!({"total_count": 42, "is_valid": true}).as_object().unwrap());
    }

    #[test]
    fn test_coerce_outputs_nested_depth() {
        let s = schema(json!({"data": "object"}));
        let out = s
            .coerce_outputs("t", json!({"Data": {"Inner-Key": {"Deep Key": 1}}}), 2)
            .unwrap();
        assert_eq!(out["data"], json!({"inner_key": {"Deep Key": 1}}));
    }

    #[test]
    fn test_coerce_outputs_missing_field_names_it() {
        let s = schema(json!({"result": "integer"}));
        let err = s.coerce_outputs("double", json!({"answer": 8}), 8).unwrap_err();
        assert_eq!(field_of(&err), Some("result"));
    }

    #[test]
    fn test_coerce_outputs_rejects_uncoercible() {
        let s = schema(json!({"n": "number"}));
        let err = s.coerce_outputs("t", json!({"n": "many"}), 8).unwrap_err();
        assert!(err.to_string().contains("output `n` must be number, got string"));
        let err = s.coerce_outputs("t", json!(5), 8).unwrap_err();
        assert!(err.to_string().contains("result must be an object, got integer"));
    }

    #[test]
    fn test_describe_and_json_schema() {
        let s = schema(json!({"sum": "integer", "note": "string"}));
        assert_eq!(s.describe(), "- sum (integer)\n- note (string)");
        let js = s.to_json_schema();
        assert_eq!(js["properties"]["sum"]["type"], "integer");
        assert_eq!(js["required"], json!(["sum", "note"]));
    }
}
