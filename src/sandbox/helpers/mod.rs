//! The helper namespace injected into sandboxed code.
//!
//! This is the only standard library definitions can reach. Anything not
//! listed by [`helper_names`] does not exist inside the sandbox.

mod data;
mod env;
mod http;
mod strings;

pub use env::{EnvHelper, EnvSource, ProcessEnv, StaticEnv};
pub use http::{check_url, is_blocked_ip, HttpHelper};

use serde_json::{Map, Value};

use super::value::{as_float, as_int, type_name, DEFAULT_MAX_VALUE_SIZE};

/// Helper handled by the interpreter itself because it needs the run context.
pub const EXECUTE_TASK: &str = "execute_task";

/// Every helper name, in a stable order.
pub fn helper_names() -> impl Iterator<Item = &'static str> {
    std::iter::once(EXECUTE_TASK)
        .chain(strings::NAMES.iter().copied())
        .chain(data::NAMES.iter().copied())
        .chain(env::NAMES.iter().copied())
        .chain(http::NAMES.iter().copied())
}

pub struct Helpers {
    env: EnvHelper,
    http: HttpHelper,
    max_value_size: usize,
}

impl Helpers {
    pub fn new(env: EnvHelper, http: HttpHelper) -> Self {
        Self {
            env,
            http,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
        }
    }

    /// Caps the strings and collections helpers may build.
    pub fn with_max_value_size(mut self, max_value_size: usize) -> Self {
        self.max_value_size = max_value_size;
        self
    }

    pub fn max_value_size(&self) -> usize {
        self.max_value_size
    }

    /// Calls helper `name`. Errors are plain messages; the interpreter adds
    /// origin and line.
    pub async fn call(&self, name: &str, args: &[Value]) -> Result<Value, String> {
        if let Some(result) = strings::call(name, args, self.max_value_size) {
            return result;
        }
        if let Some(result) = data::call(name, args, self.max_value_size) {
            return result;
        }
        if env::NAMES.contains(&name) {
            return self.env.call(name, &Args::new(name, args));
        }
        if http::NAMES.contains(&name) {
            return self.http.call(name, &Args::new(name, args)).await;
        }
        Err(format!("unknown helper `{name}`"))
    }
}

impl Default for Helpers {
    fn default() -> Self {
        Self::new(EnvHelper::default(), HttpHelper::default())
    }
}

// ── Argument access ──────────────────────────────────────

/// Positional arguments of one helper call, with typed accessors that
/// produce uniform error messages.
pub(super) struct Args<'a> {
    name: &'a str,
    values: &'a [Value],
}

impl<'a> Args<'a> {
    pub(super) fn new(name: &'a str, values: &'a [Value]) -> Self {
        Self { name, values }
    }

    pub(super) fn arity(&self, min: usize, max: usize) -> Result<(), String> {
        let n = self.values.len();
        if n < min || n > max {
            let expected = if min == max {
                format!("{min}")
            } else {
                format!("{min} to {max}")
            };
            return Err(format!(
                "{} expects {expected} argument(s), got {n}",
                self.name
            ));
        }
        Ok(())
    }

    pub(super) fn get(&self, i: usize) -> Option<&'a Value> {
        self.values.get(i)
    }

    pub(super) fn value(&self, i: usize) -> Result<&'a Value, String> {
        self.values
            .get(i)
            .ok_or_else(|| format!("{}: missing argument {}", self.name, i + 1))
    }

    fn mismatch(&self, i: usize, expected: &str, found: &Value) -> String {
        format!(
            "{}: expected {expected} for argument {}, got {}",
            self.name,
            i + 1,
            type_name(found)
        )
    }

    pub(super) fn str(&self, i: usize) -> Result<&'a str, String> {
        let value = self.value(i)?;
        value.as_str().ok_or_else(|| self.mismatch(i, "string", value))
    }

    pub(super) fn opt_str(&self, i: usize) -> Result<Option<&'a str>, String> {
        match self.get(i) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.str(i).map(Some),
        }
    }

    pub(super) fn int(&self, i: usize) -> Result<i64, String> {
        let value = self.value(i)?;
        as_int(value).ok_or_else(|| self.mismatch(i, "integer", value))
    }

    pub(super) fn num(&self, i: usize) -> Result<f64, String> {
        let value = self.value(i)?;
        as_float(value).ok_or_else(|| self.mismatch(i, "number", value))
    }

    pub(super) fn array(&self, i: usize) -> Result<&'a Vec<Value>, String> {
        let value = self.value(i)?;
        value.as_array().ok_or_else(|| self.mismatch(i, "array", value))
    }

    pub(super) fn object(&self, i: usize) -> Result<&'a Map<String, Value>, String> {
        let value = self.value(i)?;
        value.as_object().ok_or_else(|| self.mismatch(i, "object", value))
    }

    pub(super) fn opt_object(&self, i: usize) -> Result<Option<&'a Map<String, Value>>, String> {
        match self.get(i) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.object(i).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_helper_names_are_unique() {
        let mut names: Vec<&str> = helper_names().collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[tokio::test]
    async fn test_dispatch_reaches_each_module() {
        let env = StaticEnv::from_pairs([("APP_NAME", "weave")]);
        let helpers = Helpers::new(
            EnvHelper::new(std::sync::Arc::new(env), Vec::new()),
            HttpHelper::disabled(),
        );
        assert_eq!(helpers.call("upcase", &[json!("a")]).await, Ok(json!("A")));
        assert_eq!(helpers.call("len", &[json!([1, 2])]).await, Ok(json!(2)));
        assert_eq!(
            helpers.call("env_get", &[json!("APP_NAME")]).await,
            Ok(json!("weave"))
        );
        assert!(helpers
            .call("http_get", &[json!("https://example.com")])
            .await
            .unwrap_err()
            .contains("disabled"));
    }

    #[tokio::test]
    async fn test_value_size_limit_applies_to_helpers() {
        let helpers = Helpers::default().with_max_value_size(8);
        assert_eq!(helpers.max_value_size(), 8);
        assert_eq!(
            helpers.call("join", &[json!(["ab", "cd"]), json!("-")]).await,
            Ok(json!("ab-cd"))
        );
        let err = helpers
            .call("join", &[json!(["abcd", "efgh"]), json!("-")])
            .await
            .unwrap_err();
        assert_eq!(err, "join: value exceeds the size limit of 8");
        assert!(helpers
            .call("push", &[json!([1, 2, 3, 4, 5, 6, 7, 8]), json!(9)])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_helper() {
        let helpers = Helpers::default();
        let err = helpers.call("system", &[]).await.unwrap_err();
        assert!(err.contains("unknown helper `system`"));
    }

    #[test]
    fn test_arity_message() {
        let values = [json!(1)];
        let args = Args::new("join", &values);
        assert_eq!(
            args.arity(2, 2).unwrap_err(),
            "join expects 2 argument(s), got 1"
        );
        assert_eq!(
            args.str(0).unwrap_err(),
            "join: expected string for argument 1, got integer"
        );
    }
}
