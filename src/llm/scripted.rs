//! A language model that replays a fixed script.
//!
//! Used by tests and dry runs: each `complete` call consumes the next
//! scripted step. Tool calls in a step are really invoked through the
//! supplied [`ToolBox`], so tool definitions are exercised end to end.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::tools::ToolBox;

use super::{Completion, LanguageModel, Prompt, ProviderError, TokenUsage, ToolCallRecord};

enum Step {
    Reply {
        content: String,
        tool_calls: Vec<(String, Value)>,
    },
    Fail(ProviderError),
}

#[derive(Default)]
pub struct ScriptedModel {
    steps: Mutex<VecDeque<Step>>,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a plain reply.
    pub fn reply(self, content: impl Into<String>) -> Self {
        self.push(Step::Reply {
            content: content.into(),
            tool_calls: Vec::new(),
        })
    }

    /// Queues a reply preceded by tool calls.
    pub fn reply_after_tools(self, tool_calls: Vec<(String, Value)>, content: impl Into<String>) -> Self {
        self.push(Step::Reply {
            content: content.into(),
            tool_calls,
        })
    }

    /// Queues a provider failure.
    pub fn fail(self, status: Option<u16>, message: impl Into<String>) -> Self {
        self.push(Step::Fail(ProviderError::new(status, message)))
    }

    /// Every prompt received so far, oldest first.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn push(self, step: Step) -> Self {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(step);
        self
    }
}

/// Rough token estimate: four characters per token.
fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &Prompt, tools: Option<&ToolBox>) -> Result<Completion> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.clone());
        let step = self
            .steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        let (content, calls) = match step {
            Some(Step::Reply {
                content,
                tool_calls,
            }) => (content, tool_calls),
            Some(Step::Fail(error)) => return Err(error.into()),
            None => return Err(anyhow!("scripted model has no replies left")),
        };

        let mut tool_calls = Vec::with_capacity(calls.len());
        for (tool, arguments) in calls {
            let toolbox = tools.ok_or_else(|| anyhow!("model called `{tool}` but no tools were offered"))?;
            let result = toolbox.invoke(&tool, arguments.clone()).await?;
            tool_calls.push(ToolCallRecord {
                tool,
                arguments,
                result,
            });
        }

        let usage = TokenUsage {
            input_tokens: estimate_tokens(&prompt.system) + estimate_tokens(&prompt.user),
            output_tokens: estimate_tokens(&content),
        };
        Ok(Completion {
            content,
            tool_calls,
            usage: Some(usage),
        })
    }

    fn description(&self) -> String {
        "scripted".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> Prompt {
        Prompt {
            system: "sys".into(),
            user: "user".into(),
        }
    }

    #[tokio::test]
    async fn test_replays_in_order() {
        let model = ScriptedModel::new()
            .fail(Some(503), "overloaded")
            .reply("{\"result\": 8}");

        let err = model.complete(&prompt(), None).await.unwrap_err();
        assert_eq!(err.downcast_ref::<ProviderError>().unwrap().status, Some(503));

        let ok = model.complete(&prompt(), None).await.unwrap();
        assert_eq!(ok.content, "{\"result\": 8}");
        assert_eq!(ok.usage.unwrap().input_tokens, 2);
        assert_eq!(model.call_count(), 2);

        assert!(model.complete(&prompt(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_tool_calls_require_toolbox() {
        let model = ScriptedModel::new()
            .reply_after_tools(vec![("lookup".into(), serde_json::json!({}))], "{}");
        let err = model.complete(&prompt(), None).await.unwrap_err();
        assert!(err.to_string().contains("no tools were offered"));
    }
}
