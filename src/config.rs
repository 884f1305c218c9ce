use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{RetryPolicy, MAX_RETRY_DELAY};
use crate::error::{Error, Result};
use crate::sandbox::helpers::{helper_names, EnvHelper, HttpHelper, ProcessEnv};
use crate::sandbox::{CapabilitySet, Helpers, Sandbox};

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub retry: RetryConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Step budget for one evaluation of sandboxed code
    pub max_steps: u64,
    /// Largest string (bytes) or collection (entries) sandboxed code may build
    pub max_value_size: usize,
    /// Limit on nested `execute_task` calls
    pub max_task_depth: usize,
    #[serde(deserialize_with = "duration")]
    pub run_timeout: Duration,
    #[serde(deserialize_with = "duration")]
    pub task_timeout: Duration,
    /// Include inputs and outputs in telemetry events
    pub capture_content: bool,
    /// How deep output keys are normalised
    pub normalize_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: crate::sandbox::DEFAULT_MAX_STEPS,
            max_value_size: crate::sandbox::value::DEFAULT_MAX_VALUE_SIZE,
            max_task_depth: 8,
            run_timeout: Duration::from_secs(300),
            task_timeout: Duration::from_secs(30),
            capture_content: false,
            normalize_depth: 8,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(deserialize_with = "duration")]
    pub base_delay: Duration,
    #[serde(deserialize_with = "duration")]
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay: policy.base_delay,
            max_delay: policy.max_delay,
            jitter: policy.jitter,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    /// Helpers removed from the capability set
    pub disabled_helpers: Vec<String>,
    /// Prefixes of environment variables definitions may read; empty allows all
    pub env_allow: Vec<String>,
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub enabled: bool,
    #[serde(deserialize_with = "duration")]
    pub timeout: Duration,
    pub max_response_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(10),
            max_response_bytes: 1024 * 1024,
        }
    }
}

fn duration<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Parses `"250ms"`, `"30s"`, `"5m"`, `"2h"` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration `{raw}`"))?;
    let seconds = match unit.trim() {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("invalid duration unit `{other}` in `{raw}`")),
    };
    Duration::try_from_secs_f64(seconds).map_err(|_| format!("invalid duration `{raw}`"))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        // Expand environment variables like ${TASKWEAVE_ENV_PREFIX}
        let expanded = shellexpand::env(content).map_err(|e| Error::Config(e.to_string()))?;
        let config: Config =
            toml::from_str(&expanded).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::Config("retry.jitter must be between 0 and 1".into()));
        }
        if self.runtime.max_steps == 0 {
            return Err(Error::Config("runtime.max_steps must be at least 1".into()));
        }
        if self.runtime.max_value_size == 0 {
            return Err(Error::Config("runtime.max_value_size must be at least 1".into()));
        }
        let known: Vec<&str> = helper_names().collect();
        if let Some(unknown) = self
            .sandbox
            .disabled_helpers
            .iter()
            .find(|name| !known.contains(&name.as_str()))
        {
            return Err(Error::Config(format!(
                "sandbox.disabled_helpers: unknown helper `{unknown}`"
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: self.retry.base_delay.min(MAX_RETRY_DELAY),
            max_delay: self.retry.max_delay.min(MAX_RETRY_DELAY),
            jitter: self.retry.jitter,
        }
    }

    /// The standard capability set minus `disabled_helpers`.
    pub fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::standard()
            .without_helpers(self.sandbox.disabled_helpers.iter().map(String::as_str))
    }

    pub fn helpers(&self) -> Helpers {
        let http = &self.sandbox.http;
        Helpers::new(
            EnvHelper::new(Arc::new(ProcessEnv), self.sandbox.env_allow.clone()),
            HttpHelper::new(http.enabled, http.timeout, http.max_response_bytes),
        )
    }

    pub fn sandbox(&self) -> Sandbox {
        Sandbox::new(self.capabilities(), self.helpers())
            .with_max_steps(self.runtime.max_steps)
            .with_max_value_size(self.runtime.max_value_size)
    }
}
