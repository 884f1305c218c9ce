//! `LanguageModel` trait: the seam neural tasks resolve through.
//!
//! The runtime ships no HTTP provider; hosts plug their own client in.
//! Providers report failures as [`ProviderError`] so the executor can tell
//! retryable failures (rate limits, outages, transport) from terminal ones.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::tools::ToolBox;

/// What a neural task sends to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A tool call the model made while producing its reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub arguments: Value,
    pub result: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: Option<TokenUsage>,
}

/// Failure reported by a model provider.
///
/// `status` is the HTTP status when there was one; `None` means the
/// request never got an answer (connection refused, reset, DNS).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Transport failures, 429 and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self.status {
            None => true,
            Some(code) => code == 429 || code >= 500,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "provider returned {code}: {}", self.message),
            None => write!(f, "provider unreachable: {}", self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Sends one prompt and returns the reply.
    ///
    /// When `tools` is `Some`, the model may call them before answering;
    /// the calls it made are reported in [`Completion::tool_calls`].
    async fn complete(&self, prompt: &Prompt, tools: Option<&ToolBox>) -> Result<Completion>;

    /// Human-readable description of the provider and model.
    fn description(&self) -> String;
}
