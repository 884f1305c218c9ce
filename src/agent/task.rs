//! Task definitions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::backoff::{RetryPolicy, MAX_RETRY_DELAY};
use crate::config::parse_duration;
use crate::dsl::Block;
use crate::sandbox::value::{as_float, as_int, type_name};

use super::schema::Schema;

/// How a task was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Instructions only; resolved by a language model.
    Neural,
    /// Code only.
    Symbolic,
    /// Both instructions and code. The code resolves it.
    Hybrid,
}

/// Which resolver actually handles a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolver {
    Neural,
    Symbolic,
}

impl fmt::Display for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolver::Neural => write!(f, "neural"),
            Resolver::Symbolic => write!(f, "symbolic"),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Neural => write!(f, "neural"),
            TaskKind::Symbolic => write!(f, "symbolic"),
            TaskKind::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Partial retry settings layered over a base [`RetryPolicy`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RetryOverrides {
    pub max_attempts: Option<u32>,
    pub base_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub jitter: Option<f64>,
}

impl RetryOverrides {
    pub fn apply(&self, base: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            base_delay: self.base_delay.unwrap_or(base.base_delay),
            max_delay: self.max_delay.unwrap_or(base.max_delay),
            jitter: self.jitter.unwrap_or(base.jitter),
        }
    }

    /// Reads the retry keys out of an options map, ignoring other keys.
    pub fn from_options(options: &Map<String, Value>) -> Result<Self, String> {
        Ok(Self {
            max_attempts: match options.get("max_attempts") {
                Some(v) => Some(attempts(v)?),
                None => None,
            },
            base_delay: options.get("base_delay").map(retry_delay).transpose()?,
            max_delay: options.get("max_delay").map(retry_delay).transpose()?,
            jitter: match options.get("jitter") {
                Some(v) => Some(
                    as_float(v)
                        .filter(|j| (0.0..=1.0).contains(j))
                        .ok_or_else(|| "jitter must be a number between 0 and 1".to_string())?,
                ),
                None => None,
            },
        })
    }
}

fn retry_delay(value: &Value) -> Result<Duration, String> {
    Ok(duration(value)?.min(MAX_RETRY_DELAY))
}

fn attempts(value: &Value) -> Result<u32, String> {
    as_int(value)
        .filter(|n| *n >= 1)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| format!("max_attempts must be a positive integer, got {value}"))
}

/// Reads `"30s"`-style strings or a number of seconds.
pub fn duration(value: &Value) -> Result<Duration, String> {
    match value {
        Value::String(s) => parse_duration(s),
        Value::Number(_) => as_float(value)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .ok_or_else(|| format!("invalid duration {value}")),
        other => Err(format!("duration must be a string or number, got {}", type_name(other))),
    }
}

#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub input_schema: Schema,
    pub output_schema: Schema,
    pub instructions: Option<String>,
    pub code: Option<Arc<Block>>,
    pub retry: RetryOverrides,
    pub timeout: Option<Duration>,
    /// Label of the source the task was loaded from.
    pub origin: String,
}

const TASK_OPTIONS: &[&str] = &["inputs", "outputs", "instructions", "retry", "timeout"];

impl TaskDefinition {
    /// Builds a task from the options map of `task(name, { ... })` and an
    /// optional code block.
    pub fn from_options(
        name: &str,
        options: &Map<String, Value>,
        code: Option<Arc<Block>>,
        origin: &str,
    ) -> Result<Self, String> {
        if name.trim().is_empty() {
            return Err("task name must not be empty".into());
        }
        if let Some(unknown) = options.keys().find(|k| !TASK_OPTIONS.contains(&k.as_str())) {
            return Err(format!("task `{name}`: unknown option `{unknown}`"));
        }
        let schema = |key: &str| -> Result<Schema, String> {
            Schema::from_value(options.get(key).unwrap_or(&Value::Null))
                .map_err(|e| format!("task `{name}` {key}: {e}"))
        };
        let instructions = match options.get("instructions") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
            Some(_) => {
                return Err(format!(
                    "task `{name}`: instructions must be a non-empty string"
                ))
            }
        };
        if instructions.is_none() && code.is_none() {
            return Err(format!(
                "task `{name}` needs instructions, a code block, or both"
            ));
        }
        let retry = match options.get("retry") {
            None | Some(Value::Null) => RetryOverrides::default(),
            Some(Value::Object(map)) => RetryOverrides::from_options(map)
                .map_err(|e| format!("task `{name}` retry: {e}"))?,
            Some(n @ Value::Number(_)) => RetryOverrides {
                max_attempts: Some(attempts(n).map_err(|e| format!("task `{name}` retry: {e}"))?),
                ..RetryOverrides::default()
            },
            Some(other) => {
                return Err(format!(
                    "task `{name}`: retry must be a map or a number of attempts, got {}",
                    type_name(other)
                ))
            }
        };
        let timeout = options
            .get("timeout")
            .map(duration)
            .transpose()
            .map_err(|e| format!("task `{name}` timeout: {e}"))?;

        Ok(Self {
            name: name.to_string(),
            input_schema: schema("inputs")?,
            output_schema: schema("outputs")?,
            instructions,
            code,
            retry,
            timeout,
            origin: origin.to_string(),
        })
    }

    pub fn kind(&self) -> TaskKind {
        match (&self.instructions, &self.code) {
            (Some(_), Some(_)) => TaskKind::Hybrid,
            (None, Some(_)) => TaskKind::Symbolic,
            _ => TaskKind::Neural,
        }
    }

    pub fn resolver(&self) -> Resolver {
        match self.kind() {
            TaskKind::Neural => Resolver::Neural,
            TaskKind::Symbolic | TaskKind::Hybrid => Resolver::Symbolic,
        }
    }
}
