//! Task execution: input checks, resolver attempts with retry, output
//! coercion and per-attempt telemetry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::attributes;
use crate::backoff::RetryPolicy;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::llm::{build_prompt, parse_response, LanguageModel, ProviderError, TokenUsage, ToolCallRecord};
use crate::sandbox::value::json_size;
use crate::sandbox::{BlockCall, Role, Sandbox};
use crate::telemetry::{SpanStatus, Telemetry};
use crate::tools::ToolBox;

use super::context::TaskContext;
use super::task::{Resolver, TaskDefinition};

/// Outcome of one `execute_task` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub task: String,
    pub outputs: Map<String, Value>,
    pub duration: Duration,
    pub attempt_count: u32,
    pub resolver_used: Resolver,
    #[serde(serialize_with = "error_message")]
    pub error: Option<Error>,
}

fn error_message<S: serde::Serializer>(error: &Option<Error>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_outputs(self) -> Result<Map<String, Value>> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.outputs),
        }
    }
}

/// Runtime-level defaults the executor falls back to.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub retry: RetryPolicy,
    pub task_timeout: Duration,
    /// Include inputs and outputs in attempt events
    pub capture_content: bool,
    pub normalize_depth: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ExecutorSettings {
    fn from(config: &Config) -> Self {
        Self {
            retry: config.retry_policy(),
            task_timeout: config.runtime.task_timeout,
            capture_content: config.runtime.capture_content,
            normalize_depth: config.runtime.normalize_depth,
        }
    }
}

type Failure = (AttemptError, Resolution);

fn failure(error: AttemptError) -> Failure {
    (error, Resolution::default())
}

/// How a failed attempt affects the retry loop.
enum AttemptError {
    /// Worth another attempt while the budget lasts.
    Retryable(String),
    /// Stops retrying; surfaces as a resolver error.
    Terminal(String),
    /// Stops retrying; surfaces unchanged.
    Fatal(Error),
}

impl AttemptError {
    fn message(&self) -> String {
        match self {
            AttemptError::Retryable(m) | AttemptError::Terminal(m) => m.clone(),
            AttemptError::Fatal(e) => e.to_string(),
        }
    }
}

/// What a resolver produced before output coercion. A failed attempt
/// still carries the tool calls and usage it incurred.
#[derive(Default)]
struct Resolution {
    value: Value,
    tool_calls: Vec<ToolCallRecord>,
    usage: Option<TokenUsage>,
}

pub struct TaskExecutor {
    sandbox: Arc<Sandbox>,
    model: Option<Arc<dyn LanguageModel>>,
    tools: Option<Arc<ToolBox>>,
    telemetry: Telemetry,
    settings: ExecutorSettings,
}

impl TaskExecutor {
    pub fn new(sandbox: Arc<Sandbox>, telemetry: Telemetry, settings: ExecutorSettings) -> Self {
        Self {
            sandbox,
            model: None,
            tools: None,
            telemetry,
            settings,
        }
    }

    pub fn with_model(mut self, model: Option<Arc<dyn LanguageModel>>) -> Self {
        self.model = model;
        self
    }

    /// Tools offered to the model on neural attempts.
    pub fn with_tools(mut self, tools: Option<Arc<ToolBox>>) -> Self {
        self.tools = tools;
        self
    }

    /// Runs `task` to completion. Failures are reported in
    /// [`ExecutionResult::error`], never as a panic or a lost result.
    pub async fn execute(&self, task: &TaskDefinition, inputs: Value, ctx: &TaskContext<'_>) -> ExecutionResult {
        let started = Instant::now();
        let resolver = task.resolver();
        let span = info_span!("task", task = %task.name, %resolver, run_id = %ctx.run_id());
        let (outcome, attempts) = self.run_attempts(task, inputs, ctx).instrument(span).await;
        let duration = started.elapsed();

        let mut attrs = attributes! {
            "run_id" => ctx.run_id(),
            "task" => task.name,
            "kind" => task.kind().to_string(),
            "resolver" => resolver.to_string(),
            "attempts" => attempts,
            "duration_ms" => duration.as_millis() as u64,
        };
        let status = match &outcome {
            Ok(outputs) => {
                attrs.insert("output_size".into(), Value::from(json_size(outputs)));
                SpanStatus::Ok
            }
            Err(e) => SpanStatus::Error(e.to_string()),
        };
        self.telemetry.span("task.execute", &attrs, &status);

        let (outputs, error) = match outcome {
            Ok(outputs) => (outputs, None),
            Err(e) => (Map::new(), Some(e)),
        };
        ExecutionResult {
            task: task.name.clone(),
            outputs,
            duration,
            attempt_count: attempts,
            resolver_used: resolver,
            error,
        }
    }

    async fn run_attempts(
        &self,
        task: &TaskDefinition,
        inputs: Value,
        ctx: &TaskContext<'_>,
    ) -> (Result<Map<String, Value>>, u32) {
        let inputs = match task.input_schema.check_inputs(&task.name, &inputs) {
            Ok(inputs) => inputs,
            Err(e) => {
                debug!("Task {} rejected its inputs: {e}", task.name);
                return (Err(e), 0);
            }
        };

        let constraints = &ctx.agent().constraints;
        let policy = task.retry.apply(constraints.retry.apply(self.settings.retry));
        let timeout = task
            .timeout
            .or(constraints.timeout)
            .unwrap_or(self.settings.task_timeout);
        let cancel = ctx.cancel_token();
        let mut backoff = policy.backoff();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return (Err(Error::Cancelled), attempt);
            }
            attempt += 1;
            let attempt_id = Uuid::new_v4().to_string();
            let started = Instant::now();

            let resolved = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(failure(AttemptError::Fatal(Error::Cancelled))),
                result = tokio::time::timeout(timeout, self.resolve(task, &inputs, ctx)) => match result {
                    Ok(result) => result,
                    Err(_) => Err(failure(AttemptError::Retryable(format!(
                        "attempt timed out after {timeout:?}"
                    )))),
                },
            };
            let (outcome, resolution) = match resolved {
                Ok(mut resolution) => {
                    let value = std::mem::take(&mut resolution.value);
                    let outcome = task
                        .output_schema
                        .coerce_outputs(&task.name, value, self.settings.normalize_depth)
                        .map_err(AttemptError::Fatal);
                    (outcome, resolution)
                }
                Err((e, resolution)) => (Err(e), resolution),
            };

            self.record_attempt(
                task,
                ctx,
                attempt,
                &attempt_id,
                started.elapsed(),
                &inputs,
                &outcome,
                &resolution,
            );

            match outcome {
                Ok(outputs) => {
                    debug!("Task {} succeeded on attempt {attempt}", task.name);
                    return (Ok(outputs), attempt);
                }
                Err(AttemptError::Fatal(e)) => return (Err(e), attempt),
                Err(AttemptError::Terminal(message)) => {
                    return (Err(resolver_error(task, attempt, message)), attempt);
                }
                Err(AttemptError::Retryable(message)) => {
                    if attempt >= policy.max_attempts {
                        warn!(
                            "Task {} failed after {attempt} attempt(s): {message}",
                            task.name
                        );
                        return (Err(resolver_error(task, attempt, message)), attempt);
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        "Task {} attempt {attempt}/{} failed: {message}. Retrying in {delay:?}",
                        task.name, policy.max_attempts
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return (Err(Error::Cancelled), attempt),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn resolve(
        &self,
        task: &TaskDefinition,
        inputs: &Map<String, Value>,
        ctx: &TaskContext<'_>,
    ) -> std::result::Result<Resolution, Failure> {
        match (task.resolver(), &task.code) {
            (Resolver::Symbolic, Some(code)) => {
                let mut bindings = inputs.clone();
                bindings.insert("inputs".into(), Value::Object(inputs.clone()));
                let call = BlockCall::new(&task.origin, Role::Agent, bindings)
                    .with_host(ctx)
                    .with_cancel(ctx.cancel_token())
                    .with_max_steps(ctx.agent().constraints.max_steps);
                let value = self
                    .sandbox
                    .run_block(code, call)
                    .await
                    .map_err(|e| failure(classify_symbolic(e)))?;
                Ok(Resolution {
                    value,
                    ..Resolution::default()
                })
            }
            _ => self.resolve_neural(task, inputs, ctx).await,
        }
    }

    async fn resolve_neural(
        &self,
        task: &TaskDefinition,
        inputs: &Map<String, Value>,
        ctx: &TaskContext<'_>,
    ) -> std::result::Result<Resolution, Failure> {
        let Some(model) = &self.model else {
            return Err(failure(AttemptError::Terminal(
                "no language model configured".into(),
            )));
        };
        let prompt = build_prompt(task, inputs, ctx.agent().persona.as_deref());
        let tools = self.tools.as_deref().filter(|t| !t.is_empty());
        let completion = model
            .complete(&prompt, tools)
            .await
            .map_err(|e| failure(classify_provider(e)))?;
        let mut resolution = Resolution {
            value: Value::Null,
            tool_calls: completion.tool_calls,
            usage: completion.usage,
        };
        match parse_response(&completion.content) {
            Ok(value) => {
                resolution.value = value;
                Ok(resolution)
            }
            Err(e) => Err((
                AttemptError::Retryable(format!("unparseable reply: {e}")),
                resolution,
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_attempt(
        &self,
        task: &TaskDefinition,
        ctx: &TaskContext<'_>,
        attempt: u32,
        attempt_id: &str,
        elapsed: Duration,
        inputs: &Map<String, Value>,
        outcome: &std::result::Result<Map<String, Value>, AttemptError>,
        resolution: &Resolution,
    ) {
        let mut attrs = attributes! {
            "run_id" => ctx.run_id(),
            "task" => task.name,
            "resolver" => task.resolver().to_string(),
            "attempt" => attempt,
            "attempt_id" => attempt_id,
            "duration_ms" => elapsed.as_millis() as u64,
            "input_size" => json_size(inputs),
        };
        match outcome {
            Ok(outputs) => {
                attrs.insert("status".into(), Value::from("ok"));
                attrs.insert("output_size".into(), Value::from(json_size(outputs)));
                attrs.insert("error".into(), Value::Null);
            }
            Err(e) => {
                attrs.insert("status".into(), Value::from("error"));
                attrs.insert("output_size".into(), Value::from(0));
                attrs.insert("error".into(), Value::from(e.message()));
            }
        }
        if self.settings.capture_content {
            attrs.insert("inputs".into(), Value::Object(inputs.clone()));
            if let Ok(outputs) = outcome {
                attrs.insert("outputs".into(), Value::Object(outputs.clone()));
            }
        }
        if let Some(usage) = resolution.usage {
            attrs.insert("input_tokens".into(), Value::from(usage.input_tokens));
            attrs.insert("output_tokens".into(), Value::from(usage.output_tokens));
        }
        self.telemetry.event("task.attempt", &attrs);

        for call in &resolution.tool_calls {
            let attrs = attributes! {
                "run_id" => ctx.run_id(),
                "task" => task.name,
                "tool" => call.tool,
                "attempt_id" => attempt_id,
                "argument_size" => json_size(&call.arguments),
                "result_size" => json_size(&call.result),
            };
            self.telemetry.event("task.tool_call", &attrs);
        }
    }
}

fn resolver_error(task: &TaskDefinition, attempts: u32, message: String) -> Error {
    Error::Resolver {
        task: task.name.clone(),
        attempts,
        message,
    }
}

/// Runtime errors in task code are retried. Errors from nested tasks and
/// cancellation pass through untouched.
fn classify_symbolic(error: Error) -> AttemptError {
    match error {
        Error::Execution { .. } => AttemptError::Retryable(error.to_string()),
        other => AttemptError::Fatal(other),
    }
}

fn classify_provider(error: anyhow::Error) -> AttemptError {
    if let Some(provider) = error.downcast_ref::<ProviderError>() {
        return if provider.is_retryable() {
            AttemptError::Retryable(provider.to_string())
        } else {
            AttemptError::Terminal(provider.to_string())
        };
    }
    if let Some(Error::Cancelled) = error.downcast_ref::<Error>() {
        return AttemptError::Fatal(Error::Cancelled);
    }
    AttemptError::Retryable(format!("{error:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::definition::{AgentBuilder, AgentDefinition};
    use crate::llm::ScriptedModel;
    use crate::telemetry::MemorySink;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    async fn load(source: &str) -> AgentDefinition {
        let sandbox = Sandbox::default();
        let mut builder = AgentBuilder::new("test.tw");
        sandbox.eval(source, "test.tw", &mut builder).await.unwrap();
        builder.finish().unwrap()
    }

    fn fast_settings() -> ExecutorSettings {
        ExecutorSettings {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: 0.0,
            },
            ..ExecutorSettings::default()
        }
    }

    fn executor(sink: &Arc<MemorySink>) -> TaskExecutor {
        TaskExecutor::new(
            Arc::new(Sandbox::default()),
            Telemetry::new(vec![sink.clone()]),
            fast_settings(),
        )
    }

    async fn run(
        executor: &TaskExecutor,
        agent: &AgentDefinition,
        task: &str,
        inputs: Value,
    ) -> ExecutionResult {
        let ctx = TaskContext::new(agent, executor, 8, CancellationToken::new(), "run-1".into());
        let task = agent.task(task).unwrap().clone();
        executor.execute(&task, inputs, &ctx).await
    }

    const AGENT: &str = r#"
agent("math") {
  task(:add, { inputs: { a: "integer", b: "integer" }, outputs: { sum: "integer" } }) {
    { sum: a + b }
  }
  task(:broken, { outputs: { x: "integer" }, retry: 2 }) {
    fail("always broken")
  }
  task(:shape, { outputs: { total: "integer" } }) {
    { "Total": "12", extra: true }
  }
  task(:missing, { outputs: { total: "integer" } }) {
    { other: 1 }
  }
  task(:double, {
    inputs: { n: "integer" },
    outputs: { result: "integer" },
    instructions: "Double the number."
  })
  main { nil }
}
"#;

    #[tokio::test]
    async fn test_symbolic_success() {
        let sink = Arc::new(MemorySink::new());
        let exec = executor(&sink);
        let agent = load(AGENT).await;
        let result = run(&exec, &agent, "add", json!({"a": 2, "b": 3})).await;
        assert!(result.is_success());
        assert_eq!(Value::Object(result.outputs), json!({"sum": 5}));
        assert_eq!(result.attempt_count, 1);
        assert_eq!(result.resolver_used, Resolver::Symbolic);

        let attempts = sink.events("task.attempt");
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0]["status"], json!("ok"));
        assert_eq!(attempts[0]["run_id"], json!("run-1"));
        assert!(!attempts[0].contains_key("inputs"));
        assert_eq!(sink.spans("task.execute").len(), 1);
    }

    #[tokio::test]
    async fn test_input_contract_skips_resolver() {
        let sink = Arc::new(MemorySink::new());
        let exec = executor(&sink);
        let agent = load(AGENT).await;
        let result = run(&exec, &agent, "add", json!({"a": 2})).await;
        assert_eq!(result.attempt_count, 0);
        match result.error {
            Some(Error::Contract { field, .. }) => assert_eq!(field.as_deref(), Some("b")),
            other => panic!("expected contract error, got {other:?}"),
        }
        assert!(sink.events("task.attempt").is_empty());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_uses_task_override() {
        let sink = Arc::new(MemorySink::new());
        let exec = executor(&sink);
        let agent = load(AGENT).await;
        let result = run(&exec, &agent, "broken", json!({})).await;
        assert_eq!(result.attempt_count, 2);
        match result.error {
            Some(Error::Resolver { attempts, message, .. }) => {
                assert_eq!(attempts, 2);
                assert!(message.contains("always broken"));
            }
            other => panic!("expected resolver error, got {other:?}"),
        }
        assert_eq!(sink.events("task.attempt").len(), 2);
    }

    #[tokio::test]
    async fn test_outputs_are_normalised() {
        let sink = Arc::new(MemorySink::new());
        let exec = executor(&sink);
        let agent = load(AGENT).await;
        let result = run(&exec, &agent, "shape", json!({})).await;
        assert_eq!(
            Value::Object(result.outputs),
            json!({"total": 12, "extra": true})
        );
    }

    #[tokio::test]
    async fn test_missing_output_is_not_retried() {
        let sink = Arc::new(MemorySink::new());
        let exec = executor(&sink);
        let agent = load(AGENT).await;
        let result = run(&exec, &agent, "missing", json!({})).await;
        assert_eq!(result.attempt_count, 1);
        assert!(matches!(result.error, Some(Error::Contract { .. })));
    }

    #[tokio::test]
    async fn test_neural_with_scripted_model() {
        let sink = Arc::new(MemorySink::new());
        let model = Arc::new(
            ScriptedModel::new()
                .fail(Some(503), "overloaded")
                .reply("not json at all")
                .reply("```json\n{\"result\": 8}\n```"),
        );
        let exec = executor(&sink).with_model(Some(model.clone()));
        let agent = load(AGENT).await;
        let result = run(&exec, &agent, "double", json!({"n": 4})).await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(Value::Object(result.outputs), json!({"result": 8}));
        assert_eq!(result.attempt_count, 3);
        assert_eq!(result.resolver_used, Resolver::Neural);
        assert_eq!(model.call_count(), 3);
        assert!(model.prompts()[0].user.contains("Double the number."));

        let attempts = sink.events("task.attempt");
        assert_eq!(attempts.len(), 3);
        assert!(attempts[1]["error"].as_str().unwrap().contains("unparseable reply"));
        assert!(attempts[1].contains_key("input_tokens"));
        assert!(attempts[2].contains_key("input_tokens"));
    }

    #[tokio::test]
    async fn test_unparseable_reply_keeps_its_telemetry() {
        let sink = Arc::new(MemorySink::new());
        let tools = Arc::new(ToolBox::new(Arc::new(Sandbox::default())));
        tools
            .load(
                "tool(\"echo\") {\n  parameter(\"text\", { required: true })\n  execute { text }\n}",
                "echo.tw",
            )
            .await
            .unwrap();
        let model = Arc::new(
            ScriptedModel::new()
                .reply_after_tools(vec![("echo".into(), json!({"text": "hi"}))], "sorry, no json")
                .reply("{\"result\": 8}"),
        );
        let exec = executor(&sink)
            .with_model(Some(model.clone()))
            .with_tools(Some(tools));
        let agent = load(AGENT).await;
        let result = run(&exec, &agent, "double", json!({"n": 4})).await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.attempt_count, 2);

        let attempts = sink.events("task.attempt");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0]["status"], json!("error"));
        assert!(attempts[0].contains_key("input_tokens"));
        assert!(attempts[1].contains_key("input_tokens"));

        let calls = sink.events("task.tool_call");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["tool"], json!("echo"));
        assert_eq!(calls[0]["attempt_id"], attempts[0]["attempt_id"]);
    }

    #[tokio::test]
    async fn test_huge_retry_delays_do_not_panic() {
        let sink = Arc::new(MemorySink::new());
        let exec = executor(&sink);
        let agent = load(
            r#"
agent("patient") {
  task(:nope, { outputs: { x: "integer" }, retry: {
    max_attempts: 3,
    base_delay: "10000000000000000000s",
    max_delay: "10000000000000000000s"
  } }) {
    fail("nope")
  }
  main { nil }
}
"#,
        )
        .await;
        let cancel = CancellationToken::new();
        let ctx = TaskContext::new(&agent, &exec, 8, cancel.clone(), "run-3".into());
        let task = agent.task("nope").unwrap().clone();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let result = exec.execute(&task, json!({}), &ctx).await;
        stopper.await.unwrap();
        assert!(matches!(result.error, Some(Error::Cancelled)));
        assert_eq!(result.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_client_errors_are_terminal() {
        let sink = Arc::new(MemorySink::new());
        let model = Arc::new(ScriptedModel::new().fail(Some(401), "bad key"));
        let exec = executor(&sink).with_model(Some(model.clone()));
        let agent = load(AGENT).await;
        let result = run(&exec, &agent, "double", json!({"n": 4})).await;
        assert_eq!(result.attempt_count, 1);
        assert!(result.error.unwrap().to_string().contains("provider returned 401"));
    }

    #[tokio::test]
    async fn test_neural_without_model() {
        let sink = Arc::new(MemorySink::new());
        let exec = executor(&sink);
        let agent = load(AGENT).await;
        let result = run(&exec, &agent, "double", json!({"n": 4})).await;
        assert_eq!(result.attempt_count, 1);
        assert!(result
            .error
            .unwrap()
            .to_string()
            .contains("no language model configured"));
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retried() {
        let sink = Arc::new(MemorySink::new());
        let exec = executor(&sink);
        let agent = load(
            r#"
agent("slow") {
  task(:spin, { outputs: { x: "integer" }, timeout: "20ms", retry: 2 }) {
    while true { }
  }
  main { nil }
}
"#,
        )
        .await;
        let sandbox = Arc::new(Sandbox::default().with_max_steps(u64::MAX));
        let exec = TaskExecutor::new(sandbox, exec.telemetry.clone(), fast_settings());
        let result = run(&exec, &agent, "spin", json!({})).await;
        assert_eq!(result.attempt_count, 2);
        assert!(result.error.unwrap().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let sink = Arc::new(MemorySink::new());
        let exec = executor(&sink);
        let agent = load(AGENT).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = TaskContext::new(&agent, &exec, 8, cancel, "run-2".into());
        let task = agent.task("add").unwrap().clone();
        let result = exec.execute(&task, json!({"a": 1, "b": 1}), &ctx).await;
        assert!(matches!(result.error, Some(Error::Cancelled)));
        assert_eq!(result.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_capture_content() {
        let sink = Arc::new(MemorySink::new());
        let settings = ExecutorSettings {
            capture_content: true,
            ..fast_settings()
        };
        let exec = TaskExecutor::new(
            Arc::new(Sandbox::default()),
            Telemetry::new(vec![sink.clone()]),
            settings,
        );
        let agent = load(AGENT).await;
        run(&exec, &agent, "add", json!({"a": 1, "b": 2})).await;
        let attempts = sink.events("task.attempt");
        assert_eq!(attempts[0]["inputs"], json!({"a": 1, "b": 2}));
        assert_eq!(attempts[0]["outputs"], json!({"sum": 3}));
    }
}
