//! The agent runtime: loads definitions, runs `main` under a deadline and
//! hands the outputs to the configured output handler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::attributes;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::llm::LanguageModel;
use crate::sandbox::value::type_name;
use crate::sandbox::{BlockCall, Role, Sandbox};
use crate::telemetry::{SpanStatus, Telemetry};
use crate::tools::ToolBox;

use super::context::TaskContext;
use super::definition::{AgentBuilder, AgentDefinition};
use super::executor::{ExecutionResult, ExecutorSettings, TaskExecutor};

/// Where the outputs of a finished run go.
#[async_trait]
pub trait OutputHandler: Send + Sync {
    async fn deliver(&self, outputs: &Map<String, Value>, context: &TaskContext<'_>) -> anyhow::Result<()>;
}

/// Logs run outputs. The default handler.
pub struct LogOutput;

#[async_trait]
impl OutputHandler for LogOutput {
    async fn deliver(&self, outputs: &Map<String, Value>, context: &TaskContext<'_>) -> anyhow::Result<()> {
        let rendered = serde_json::to_string(outputs)?;
        info!(
            run_id = context.run_id(),
            "Agent {} produced {rendered}",
            context.agent().name
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub agent: String,
    pub outputs: Map<String, Value>,
    pub duration: Duration,
    pub history: Vec<ExecutionResult>,
}

/// The agent runtime: loads definitions through the sandbox and runs them.
///
/// One runtime can load and run any number of agents; each run gets its
/// own [`TaskContext`] and cancellation token.
pub struct AgentRuntime {
    config: Config,
    sandbox: Arc<Sandbox>,
    tools: Arc<ToolBox>,
    model: Option<Arc<dyn LanguageModel>>,
    telemetry: Telemetry,
    output: Arc<dyn OutputHandler>,
}

impl AgentRuntime {
    pub fn new(config: Config) -> Self {
        let sandbox = Arc::new(config.sandbox());
        Self {
            tools: Arc::new(ToolBox::new(sandbox.clone())),
            sandbox,
            config,
            model: None,
            telemetry: Telemetry::default(),
            output: Arc::new(LogOutput),
        }
    }

    /// Replaces the sandbox. Tools loaded so far are discarded.
    pub fn with_sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = Arc::new(sandbox);
        self.tools = Arc::new(ToolBox::new(self.sandbox.clone()));
        self
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_output(mut self, output: Arc<dyn OutputHandler>) -> Self {
        self.output = output;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn tools(&self) -> &ToolBox {
        &self.tools
    }

    /// Validates and evaluates an agent source.
    pub async fn load(&self, source: &str, origin: &str) -> Result<AgentDefinition> {
        let mut builder = AgentBuilder::new(origin);
        self.sandbox.eval(source, origin, &mut builder).await?;
        let agent = builder.finish().map_err(|message| Error::Execution {
            origin: origin.to_string(),
            line: 0,
            message,
        })?;
        info!(
            "Loaded agent {} from {origin}: {} task(s), mode {}",
            agent.name,
            agent.tasks().len(),
            agent.mode
        );
        Ok(agent)
    }

    /// Validates and evaluates a tool source into the runtime's tool box.
    pub async fn load_tools(&self, source: &str, origin: &str) -> Result<Vec<String>> {
        self.tools.load(source, origin).await
    }

    pub async fn run(&self, agent: &AgentDefinition, inputs: Value) -> Result<RunOutcome> {
        self.run_with_cancel(agent, inputs, CancellationToken::new()).await
    }

    /// Runs `main` with `inputs` bound. Cancelling `cancel` stops the run at
    /// the next step, attempt or backoff boundary.
    pub async fn run_with_cancel(
        &self,
        agent: &AgentDefinition,
        inputs: Value,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("run", agent = %agent.name, run_id = %run_id);
        let started = Instant::now();

        let result = self
            .run_main(agent, inputs, cancel, &run_id)
            .instrument(span)
            .await;

        let duration = started.elapsed();
        let (status, tasks) = match &result {
            Ok((_, history)) => (SpanStatus::Ok, history.len()),
            Err(e) => (SpanStatus::Error(e.to_string()), 0),
        };
        let attrs = attributes! {
            "run_id" => run_id,
            "agent" => agent.name,
            "mode" => agent.mode.to_string(),
            "duration_ms" => duration.as_millis() as u64,
            "tasks_executed" => tasks,
        };
        self.telemetry.span("agent.run", &attrs, &status);

        let (outputs, history) = result?;
        info!("Agent {} finished in {duration:?}", agent.name);
        Ok(RunOutcome {
            run_id,
            agent: agent.name.clone(),
            outputs,
            duration,
            history,
        })
    }

    async fn run_main(
        &self,
        agent: &AgentDefinition,
        inputs: Value,
        cancel: CancellationToken,
        run_id: &str,
    ) -> Result<(Map<String, Value>, Vec<ExecutionResult>)> {
        let main = agent.main().ok_or_else(|| Error::Execution {
            origin: agent.origin.clone(),
            line: 0,
            message: format!("agent `{}` has no main block", agent.name),
        })?;
        let inputs = match inputs {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(Error::Execution {
                    origin: agent.origin.clone(),
                    line: 0,
                    message: format!("run inputs must be an object, got {}", type_name(&other)),
                })
            }
        };

        let tools = (!self.tools.is_empty()).then(|| self.tools.clone());
        let executor = TaskExecutor::new(
            self.sandbox.clone(),
            self.telemetry.clone(),
            ExecutorSettings::from(&self.config),
        )
        .with_model(self.model.clone())
        .with_tools(tools);
        let ctx = TaskContext::new(
            agent,
            &executor,
            self.config.runtime.max_task_depth,
            cancel.clone(),
            run_id.to_string(),
        );

        info!("Running agent {}", agent.name);
        let mut bindings = Map::new();
        bindings.insert("inputs".into(), Value::Object(inputs));
        let call = BlockCall::new(&agent.origin, Role::Agent, bindings)
            .with_host(&ctx)
            .with_cancel(&cancel)
            .with_max_steps(agent.constraints.max_steps);

        let deadline = self.config.runtime.run_timeout;
        let value = match tokio::time::timeout(deadline, self.sandbox.run_block(main, call)).await {
            Ok(value) => value?,
            Err(_) => {
                cancel.cancel();
                warn!("Agent {} exceeded its run timeout of {deadline:?}", agent.name);
                return Err(Error::Cancelled);
            }
        };

        let outputs = into_outputs(value);
        self.output
            .deliver(&outputs, &ctx)
            .await
            .map_err(|e| Error::Delivery(format!("{e:#}")))?;
        Ok((outputs, ctx.history()))
    }
}

/// `main`'s value as a run output: maps as-is, `nil` as an empty map and
/// anything else under `result`.
fn into_outputs(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => Map::from_iter([("result".to_string(), other)]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::llm::ScriptedModel;
    use crate::telemetry::MemorySink;
    use serde_json::json;

    const CALCULATOR: &str = r#"
agent("calculator") {
  task(:add, { inputs: { a: "integer", b: "integer" }, outputs: { sum: "integer" } }) {
    { sum: a + b }
  }
  main {
    execute_task(:add, inputs)
  }
}
"#;

    /// Keeps delivered outputs for inspection.
    #[derive(Default)]
    struct Collect(Mutex<Vec<Map<String, Value>>>);

    #[async_trait]
    impl OutputHandler for Collect {
        async fn deliver(&self, outputs: &Map<String, Value>, _: &TaskContext<'_>) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(outputs.clone());
            Ok(())
        }
    }

    struct Reject;

    #[async_trait]
    impl OutputHandler for Reject {
        async fn deliver(&self, _: &Map<String, Value>, _: &TaskContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("webhook returned 500")
        }
    }

    #[tokio::test]
    async fn test_run_delivers_outputs() {
        let collect = Arc::new(Collect::default());
        let sink = Arc::new(MemorySink::new());
        let runtime = AgentRuntime::new(Config::default())
            .with_output(collect.clone())
            .with_telemetry(Telemetry::new(vec![sink.clone()]));
        let agent = runtime.load(CALCULATOR, "calc.tw").await.unwrap();
        let outcome = runtime.run(&agent, json!({"a": 2, "b": 3})).await.unwrap();

        assert_eq!(Value::Object(outcome.outputs.clone()), json!({"sum": 5}));
        assert_eq!(outcome.agent, "calculator");
        assert_eq!(outcome.history.len(), 1);
        assert_eq!(collect.0.lock().unwrap().len(), 1);

        let runs = sink.spans("agent.run");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, Some(SpanStatus::Ok));
        assert_eq!(runs[0].attributes["run_id"], json!(outcome.run_id));
        assert_eq!(runs[0].attributes["tasks_executed"], json!(1));
    }

    #[tokio::test]
    async fn test_scalar_results_are_wrapped() {
        let runtime = AgentRuntime::new(Config::default());
        let agent = runtime
            .load("agent(\"n\") {\n  main { 40 + 2 }\n}", "n.tw")
            .await
            .unwrap();
        let outcome = runtime.run(&agent, Value::Null).await.unwrap();
        assert_eq!(Value::Object(outcome.outputs), json!({"result": 42}));

        let agent = runtime
            .load("agent(\"e\") {\n  main { nil }\n}", "e.tw")
            .await
            .unwrap();
        let outcome = runtime.run(&agent, Value::Null).await.unwrap();
        assert!(outcome.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_missing_main() {
        let runtime = AgentRuntime::new(Config::default());
        let agent = runtime
            .load("agent(\"idle\") {\n  description(\"no entry point\")\n}", "idle.tw")
            .await
            .unwrap();
        let err = runtime.run(&agent, Value::Null).await.unwrap_err();
        assert!(err.to_string().contains("has no main block"));
    }

    #[tokio::test]
    async fn test_inputs_must_be_an_object() {
        let runtime = AgentRuntime::new(Config::default());
        let agent = runtime.load(CALCULATOR, "calc.tw").await.unwrap();
        let err = runtime.run(&agent, json!([1, 2])).await.unwrap_err();
        assert!(err.to_string().contains("run inputs must be an object, got array"));
    }

    #[tokio::test]
    async fn test_task_errors_propagate_unchanged() {
        let runtime = AgentRuntime::new(Config::default());
        let agent = runtime.load(CALCULATOR, "calc.tw").await.unwrap();
        let err = runtime.run(&agent, json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, Error::Contract { ref field, .. } if field.as_deref() == Some("b")));
    }

    #[tokio::test]
    async fn test_delivery_failure() {
        let runtime = AgentRuntime::new(Config::default()).with_output(Arc::new(Reject));
        let agent = runtime.load(CALCULATOR, "calc.tw").await.unwrap();
        let err = runtime.run(&agent, json!({"a": 1, "b": 1})).await.unwrap_err();
        assert!(matches!(err, Error::Delivery(ref m) if m.contains("webhook returned 500")));
    }

    #[tokio::test]
    async fn test_run_timeout_cancels() {
        let mut config = Config::default();
        config.runtime.run_timeout = Duration::from_millis(30);
        config.runtime.max_steps = u64::MAX;
        let runtime = AgentRuntime::new(config);
        let agent = runtime
            .load("agent(\"spin\") {\n  main {\n    while true { }\n  }\n}", "spin.tw")
            .await
            .unwrap();
        let err = runtime.run(&agent, Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_external_cancel() {
        let runtime = AgentRuntime::new(Config::default());
        let agent = runtime.load(CALCULATOR, "calc.tw").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runtime
            .run_with_cancel(&agent, json!({"a": 1, "b": 1}), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_neural_task_uses_tools_and_persona() {
        let model = Arc::new(ScriptedModel::new().reply_after_tools(
            vec![("word_count".into(), json!({"text": "one two three"}))],
            "{\"count\": 3}",
        ));
        let sink = Arc::new(MemorySink::new());
        let runtime = AgentRuntime::new(Config::default())
            .with_model(model.clone())
            .with_telemetry(Telemetry::new(vec![sink.clone()]));
        runtime
            .load_tools(
                r#"
tool("word_count") {
  description("Counts words")
  parameter("text", { type: "string", required: true })
  execute { len(split(text)) }
}
"#,
                "tools.tw",
            )
            .await
            .unwrap();
        let agent = runtime
            .load(
                r#"
agent("counter") {
  persona("You count carefully.")
  task(:count, {
    inputs: { text: "string" },
    outputs: { count: "integer" },
    instructions: "Count the words in the text."
  })
  main {
    execute_task(:count, inputs)
  }
}
"#,
                "counter.tw",
            )
            .await
            .unwrap();
        let outcome = runtime
            .run(&agent, json!({"text": "one two three"}))
            .await
            .unwrap();
        assert_eq!(Value::Object(outcome.outputs), json!({"count": 3}));
        assert!(model.prompts()[0].system.starts_with("You count carefully."));

        let calls = sink.events("task.tool_call");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["tool"], json!("word_count"));
        let attempts = sink.events("task.attempt");
        assert_eq!(calls[0]["attempt_id"], attempts[0]["attempt_id"]);
    }
}
