pub mod client;
pub mod prompt;
pub mod scripted;

pub use client::{Completion, LanguageModel, Prompt, ProviderError, TokenUsage, ToolCallRecord};
pub use prompt::{build_prompt, parse_response};
pub use scripted::ScriptedModel;
