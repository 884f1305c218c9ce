pub mod context;
pub mod definition;
pub mod executor;
pub mod runtime;
pub mod schema;
pub mod task;

pub use context::TaskContext;
pub use definition::{AgentBuilder, AgentDefinition, Constraints, Mode};
pub use executor::{ExecutionResult, ExecutorSettings, TaskExecutor};
pub use runtime::{AgentRuntime, LogOutput, OutputHandler, RunOutcome};
pub use schema::{FieldType, Schema};
pub use task::{Resolver, TaskDefinition, TaskKind};
