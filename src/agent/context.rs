//! Per-run state shared by `main` and the tasks it calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::sandbox::TaskHost;

use super::definition::AgentDefinition;
use super::executor::{ExecutionResult, TaskExecutor};

pub struct TaskContext<'a> {
    agent: &'a AgentDefinition,
    executor: &'a TaskExecutor,
    /// Completed calls, oldest first
    history: Mutex<Vec<ExecutionResult>>,
    depth: AtomicUsize,
    max_depth: usize,
    cancel: CancellationToken,
    run_id: String,
}

/// Decrements the nesting depth when a task call finishes, however it ends.
struct DepthGuard<'a>(&'a AtomicUsize);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<'a> TaskContext<'a> {
    pub fn new(
        agent: &'a AgentDefinition,
        executor: &'a TaskExecutor,
        max_depth: usize,
        cancel: CancellationToken,
        run_id: String,
    ) -> Self {
        Self {
            agent,
            executor,
            history: Mutex::new(Vec::new()),
            depth: AtomicUsize::new(0),
            max_depth,
            cancel,
            run_id,
        }
    }

    pub fn agent(&self) -> &AgentDefinition {
        self.agent
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs the named task and returns its validated outputs.
    ///
    /// Every call, successful or not, is appended to the history.
    pub async fn execute_task(&self, name: &str, inputs: Value) -> Result<Map<String, Value>> {
        let task = self
            .agent
            .task(name)
            .ok_or_else(|| Error::UnknownTask(name.to_string()))?
            .clone();

        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = DepthGuard(&self.depth);
        if depth > self.max_depth {
            return Err(Error::Execution {
                origin: task.origin.clone(),
                line: 0,
                message: format!(
                    "task `{name}` exceeds the nesting limit of {}",
                    self.max_depth
                ),
            });
        }

        debug!("Executing task {name} (depth {depth})");
        let result = self.executor.execute(&task, inputs, self).await;
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        result.into_outputs()
    }

    /// Snapshot of every call made so far.
    pub fn history(&self) -> Vec<ExecutionResult> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Outputs of the most recent successful call of `task`.
    pub fn last_outputs(&self, task: &str) -> Option<Map<String, Value>> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|r| r.task == task && r.is_success())
            .map(|r| r.outputs.clone())
    }
}

#[async_trait]
impl TaskHost for TaskContext<'_> {
    async fn call_task(&self, name: &str, inputs: Value) -> Result<Value> {
        self.execute_task(name, inputs).await.map(Value::Object)
    }
}
