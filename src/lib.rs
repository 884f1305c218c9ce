//! taskweave: a sandboxed runtime for agent definitions.
//!
//! Agents are written in a small definition language, validated against a
//! capability allowlist, and run as a `main` block that calls neural,
//! symbolic or hybrid tasks through `execute_task`.

pub mod agent;
pub mod backoff;
pub mod config;
pub mod dsl;
pub mod error;
pub mod llm;
pub mod sandbox;
pub mod telemetry;
pub mod tools;

pub use agent::{AgentDefinition, AgentRuntime, RunOutcome};
pub use config::Config;
pub use error::{Error, Result, Violation, ViolationKind};
