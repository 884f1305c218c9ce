//! Safe execution of untrusted definitions.
//!
//! Source is validated against a [`CapabilitySet`] before anything runs.
//! Clean sources are then interpreted against a caller-supplied
//! [`DefinitionBuilder`]; the only callable names are the builder's
//! definition methods and the helper namespace. There is no path from
//! sandboxed code to files, processes or the network other than through
//! the helpers.

pub mod capabilities;
pub mod helpers;
mod interpreter;
pub mod validator;
pub mod value;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dsl::ast::{Block, Program};
use crate::error::{Error, Result, Violation};

pub use capabilities::{CapabilitySet, Role};
pub use helpers::Helpers;
pub use validator::Validator;

use interpreter::Interpreter;

/// Default step budget for one evaluation.
pub const DEFAULT_MAX_STEPS: u64 = 100_000;

/// A definition-method call as the builder sees it: arguments already
/// evaluated, block still unevaluated.
pub struct DslCall<'a> {
    pub name: &'a str,
    pub args: Vec<Value>,
    pub block: Option<&'a Block>,
    pub line: usize,
}

impl DslCall<'_> {
    pub fn expect_args(&self, min: usize, max: usize) -> std::result::Result<(), String> {
        let n = self.args.len();
        if n < min || n > max {
            return Err(if min == max {
                format!("`{}` takes {min} argument(s), got {n}", self.name)
            } else {
                format!("`{}` takes {min} to {max} arguments, got {n}", self.name)
            });
        }
        Ok(())
    }

    pub fn str_arg(&self, i: usize) -> std::result::Result<&str, String> {
        match self.args.get(i) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(format!(
                "`{}` expects a string for argument {}, got {}",
                self.name,
                i + 1,
                value::type_name(other)
            )),
            None => Err(format!("`{}` is missing argument {}", self.name, i + 1)),
        }
    }

    /// An optional options map; absent or `nil` yields an empty map.
    pub fn options_arg(&self, i: usize) -> std::result::Result<Map<String, Value>, String> {
        match self.args.get(i) {
            None | Some(Value::Null) => Ok(Map::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(other) => Err(format!(
                "`{}` expects an options map for argument {}, got {}",
                self.name,
                i + 1,
                value::type_name(other)
            )),
        }
    }

    pub fn require_block(&self) -> std::result::Result<&Block, String> {
        self.block
            .ok_or_else(|| format!("`{}` requires a block", self.name))
    }
}

/// What the interpreter should do with the block of a definition call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockUse {
    /// Evaluate now, as a nested definition scope.
    Evaluate,
    /// The builder kept the block as code; do not evaluate it.
    Captured,
}

/// Receives definition-method calls while a source is evaluated.
///
/// Errors are plain messages; the interpreter attaches origin and line.
pub trait DefinitionBuilder: Send {
    fn role(&self) -> Role;

    fn dispatch(&mut self, call: DslCall<'_>) -> std::result::Result<BlockUse, String>;

    /// Called after an evaluated block of `name` finishes.
    fn leave(&mut self, _name: &str) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Runs tasks on behalf of sandboxed `execute_task` calls.
#[async_trait]
pub trait TaskHost: Send + Sync {
    async fn call_task(&self, name: &str, inputs: Value) -> Result<Value>;
}

/// Everything needed to run one captured block.
pub struct BlockCall<'a> {
    pub origin: &'a str,
    pub role: Role,
    pub bindings: Map<String, Value>,
    pub host: Option<&'a dyn TaskHost>,
    pub cancel: Option<&'a CancellationToken>,
    /// Overrides the sandbox's step budget.
    pub max_steps: Option<u64>,
}

impl<'a> BlockCall<'a> {
    pub fn new(origin: &'a str, role: Role, bindings: Map<String, Value>) -> Self {
        Self {
            origin,
            role,
            bindings,
            host: None,
            cancel: None,
            max_steps: None,
        }
    }

    pub fn with_host(mut self, host: &'a dyn TaskHost) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_max_steps(mut self, max_steps: Option<u64>) -> Self {
        self.max_steps = max_steps;
        self
    }
}

pub struct Sandbox {
    capabilities: CapabilitySet,
    helpers: Helpers,
    max_steps: u64,
}

impl Sandbox {
    pub fn new(capabilities: CapabilitySet, helpers: Helpers) -> Self {
        Self {
            capabilities,
            helpers,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Caps string bytes and collection entries that code may build.
    pub fn with_max_value_size(mut self, max_value_size: usize) -> Self {
        self.helpers = self.helpers.with_max_value_size(max_value_size);
        self
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn max_steps(&self) -> u64 {
        self.max_steps
    }

    pub fn max_value_size(&self) -> usize {
        self.helpers.max_value_size()
    }

    /// Validates without executing.
    pub fn validate(&self, source: &str, role: Role) -> std::result::Result<Program, Vec<Violation>> {
        Validator::new(&self.capabilities).validate(source, role)
    }

    /// Validates `source` and, when clean, evaluates it against `builder`.
    ///
    /// On any violation nothing is executed and the builder is untouched.
    pub async fn eval<'a>(
        &'a self,
        source: &str,
        origin: &'a str,
        builder: &'a mut dyn DefinitionBuilder,
    ) -> Result<()> {
        let role = builder.role();
        let program = self.validate(source, role).map_err(|violations| {
            warn!(
                "{origin}: rejected {role} definition with {} violation(s)",
                violations.len()
            );
            Error::Load {
                origin: origin.to_string(),
                violations,
            }
        })?;
        debug!("{origin}: {role} definition validated");

        let mut interp = Interpreter::new(
            origin,
            role,
            &self.capabilities,
            &self.helpers,
            self.max_steps,
        );
        interp.builder = Some(builder);
        interp.run(&program.body, Map::new()).await?;
        Ok(())
    }

    /// Runs a block captured at load time.
    pub async fn run_block(&self, block: &Block, call: BlockCall<'_>) -> Result<Value> {
        let mut interp = Interpreter::new(
            call.origin,
            call.role,
            &self.capabilities,
            &self.helpers,
            call.max_steps.unwrap_or(self.max_steps),
        );
        interp.host = call.host;
        interp.cancel = call.cancel;
        interp.run(block, call.bindings).await
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(CapabilitySet::standard(), Helpers::default())
    }
}
