//! Agent definitions and the builder that records them at load time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::warn;

use crate::dsl::Block;
use crate::sandbox::{BlockUse, DefinitionBuilder, DslCall, Role};

use super::task::{duration, RetryOverrides, TaskDefinition};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Autonomous,
    Scheduled,
    Reactive,
}

impl Mode {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "autonomous" => Some(Mode::Autonomous),
            "scheduled" => Some(Mode::Scheduled),
            "reactive" => Some(Mode::Reactive),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Autonomous => write!(f, "autonomous"),
            Mode::Scheduled => write!(f, "scheduled"),
            Mode::Reactive => write!(f, "reactive"),
        }
    }
}

/// Agent-wide limits. Unset values fall back to runtime configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Constraints {
    pub retry: RetryOverrides,
    pub timeout: Option<Duration>,
    pub max_steps: Option<u64>,
}

const CONSTRAINT_KEYS: &[&str] = &[
    "timeout",
    "max_attempts",
    "base_delay",
    "max_delay",
    "jitter",
    "max_steps",
];

impl Constraints {
    fn from_options(options: &Map<String, Value>) -> Result<Self, String> {
        if let Some(unknown) = options.keys().find(|k| !CONSTRAINT_KEYS.contains(&k.as_str())) {
            return Err(format!("unknown constraint `{unknown}`"));
        }
        let max_steps = match options.get("max_steps") {
            None => None,
            Some(v) => Some(
                v.as_u64()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| format!("max_steps must be a positive integer, got {v}"))?,
            ),
        };
        Ok(Self {
            retry: RetryOverrides::from_options(options)?,
            timeout: options.get("timeout").map(duration).transpose()?,
            max_steps,
        })
    }
}

/// A loaded agent. Immutable once built.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub description: Option<String>,
    pub mode: Mode,
    /// Cron expression, stored verbatim.
    pub schedule: Option<String>,
    pub objectives: Vec<String>,
    pub persona: Option<String>,
    pub constraints: Constraints,
    pub origin: String,
    tasks: Vec<Arc<TaskDefinition>>,
    main: Option<Arc<Block>>,
}

impl AgentDefinition {
    pub fn task(&self, name: &str) -> Option<&Arc<TaskDefinition>> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> &[Arc<TaskDefinition>] {
        &self.tasks
    }

    pub fn main(&self) -> Option<&Arc<Block>> {
        self.main.as_ref()
    }
}

/// Collects definition calls for one agent source.
pub struct AgentBuilder {
    origin: String,
    name: Option<String>,
    inside: bool,
    description: Option<String>,
    mode: Option<Mode>,
    schedule: Option<String>,
    objectives: Vec<String>,
    persona: Option<String>,
    constraints: Constraints,
    tasks: Vec<Arc<TaskDefinition>>,
    main: Option<Arc<Block>>,
}

impl AgentBuilder {
    pub fn new(origin: &str) -> Self {
        Self {
            origin: origin.to_string(),
            name: None,
            inside: false,
            description: None,
            mode: None,
            schedule: None,
            objectives: Vec::new(),
            persona: None,
            constraints: Constraints::default(),
            tasks: Vec::new(),
            main: None,
        }
    }

    pub fn finish(self) -> Result<AgentDefinition, String> {
        let name = self
            .name
            .ok_or_else(|| "source does not define an agent".to_string())?;
        let mode = match (self.mode, &self.schedule) {
            (Some(mode), _) => mode,
            (None, Some(_)) => Mode::Scheduled,
            (None, None) => Mode::Autonomous,
        };
        Ok(AgentDefinition {
            name,
            description: self.description,
            mode,
            schedule: self.schedule,
            objectives: self.objectives,
            persona: self.persona,
            constraints: self.constraints,
            origin: self.origin,
            tasks: self.tasks,
            main: self.main,
        })
    }

    fn define_agent(&mut self, call: &DslCall<'_>) -> Result<BlockUse, String> {
        call.expect_args(1, 1)?;
        call.require_block()?;
        if self.name.is_some() {
            return Err("a source may define only one agent".into());
        }
        let name = call.str_arg(0)?.trim();
        if name.is_empty() {
            return Err("agent name must not be empty".into());
        }
        self.name = Some(name.to_string());
        self.inside = true;
        Ok(BlockUse::Evaluate)
    }

    fn define_task(&mut self, call: &DslCall<'_>) -> Result<BlockUse, String> {
        call.expect_args(1, 2)?;
        let name = call.str_arg(0)?;
        if self.tasks.iter().any(|t| t.name == name) {
            return Err(format!("task `{name}` is already defined"));
        }
        let code = call.block.map(|b| Arc::new(b.clone()));
        let task = TaskDefinition::from_options(name, &call.options_arg(1)?, code, &self.origin)?;
        self.tasks.push(Arc::new(task));
        Ok(BlockUse::Captured)
    }

    fn define_main(&mut self, call: &DslCall<'_>) -> Result<BlockUse, String> {
        call.expect_args(0, 0)?;
        let block = call.require_block()?;
        if self.main.is_some() {
            warn!(
                "{}:{}: main redefined, replacing the earlier entry point",
                self.origin, call.line
            );
        }
        self.main = Some(Arc::new(block.clone()));
        Ok(BlockUse::Captured)
    }
}

impl DefinitionBuilder for AgentBuilder {
    fn role(&self) -> Role {
        Role::Agent
    }

    fn dispatch(&mut self, call: DslCall<'_>) -> Result<BlockUse, String> {
        if call.name == "agent" {
            return self.define_agent(&call);
        }
        if !self.inside {
            return Err(format!("`{}` must be called inside an agent block", call.name));
        }
        if call.block.is_some() && !matches!(call.name, "task" | "main") {
            return Err(format!("`{}` does not take a block", call.name));
        }
        match call.name {
            "description" => {
                call.expect_args(1, 1)?;
                self.description = Some(call.str_arg(0)?.to_string());
            }
            "mode" => {
                call.expect_args(1, 1)?;
                let raw = call.str_arg(0)?;
                let mode = Mode::parse(raw).ok_or_else(|| {
                    format!("unknown mode `{raw}`; expected autonomous, scheduled or reactive")
                })?;
                self.mode = Some(mode);
            }
            "schedule" => {
                call.expect_args(1, 1)?;
                let cron = call.str_arg(0)?.trim();
                if cron.is_empty() {
                    return Err("schedule must not be empty".into());
                }
                self.schedule = Some(cron.to_string());
            }
            "objective" => {
                call.expect_args(1, 1)?;
                self.objectives.push(call.str_arg(0)?.to_string());
            }
            "persona" => {
                call.expect_args(1, 1)?;
                self.persona = Some(call.str_arg(0)?.to_string());
            }
            "constraints" => {
                call.expect_args(1, 1)?;
                self.constraints = Constraints::from_options(&call.options_arg(0)?)?;
            }
            "task" => return self.define_task(&call),
            "main" => return self.define_main(&call),
            other => return Err(format!("`{other}` is not an agent definition method")),
        }
        Ok(BlockUse::Evaluate)
    }

    fn leave(&mut self, name: &str) -> Result<(), String> {
        if name == "agent" {
            self.inside = false;
        }
        Ok(())
    }
}
