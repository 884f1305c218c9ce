//! Environment variable helpers.
//!
//! Names are validated before lookup, and an optional list of prefixes
//! narrows which variables definitions may read at all.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::Args;

pub(super) const NAMES: &[&str] = &["env_get", "env_required"];

/// Where variables are read from.
pub trait EnvSource: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// The process environment.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// A fixed set of variables, for embedding hosts and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticEnv(HashMap<String, String>);

impl StaticEnv {
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl EnvSource for StaticEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
}

pub struct EnvHelper {
    source: Arc<dyn EnvSource>,
    allow_prefixes: Vec<String>,
}

impl EnvHelper {
    /// An empty `allow_prefixes` permits every well-formed name.
    pub fn new(source: Arc<dyn EnvSource>, allow_prefixes: Vec<String>) -> Self {
        Self {
            source,
            allow_prefixes,
        }
    }

    pub(super) fn call(&self, name: &str, args: &Args) -> Result<Value, String> {
        match name {
            "env_get" => {
                args.arity(1, 2)?;
                let var = args.str(0)?;
                self.check_name(var)?;
                Ok(match self.source.var(var) {
                    Some(value) => Value::from(value),
                    None => args.get(1).cloned().unwrap_or(Value::Null),
                })
            }
            "env_required" => {
                args.arity(1, 1)?;
                let var = args.str(0)?;
                self.check_name(var)?;
                match self.source.var(var) {
                    Some(value) if !value.is_empty() => Ok(Value::from(value)),
                    _ => Err(format!("required environment variable {var} is not set")),
                }
            }
            other => Err(format!("unknown helper `{other}`")),
        }
    }

    fn check_name(&self, var: &str) -> Result<(), String> {
        if !is_valid_name(var) {
            return Err(format!(
                "invalid environment variable name `{var}`: use upper-case letters, digits and underscores"
            ));
        }
        if !self.allow_prefixes.is_empty()
            && !self.allow_prefixes.iter().any(|p| var.starts_with(p.as_str()))
        {
            return Err(format!("environment variable {var} is not allowed"));
        }
        Ok(())
    }
}

impl Default for EnvHelper {
    fn default() -> Self {
        Self::new(Arc::new(ProcessEnv), Vec::new())
    }
}

/// `[A-Z_][A-Z0-9_]*`
fn is_valid_name(var: &str) -> bool {
    let mut chars = var.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
