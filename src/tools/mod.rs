//! Tool definitions a language model can call during neural tasks.
//!
//! Tools are written in the definition language under the tool role and
//! collected into a [`ToolBox`]. The tool box hands JSON-schema specs to
//! model clients and runs the `execute` body when a tool is invoked.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::agent::schema::FieldType;
use crate::dsl::Block;
use crate::error::{Error, Result};
use crate::sandbox::value::type_name;
use crate::sandbox::{BlockCall, BlockUse, DefinitionBuilder, DslCall, Role, Sandbox};

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: FieldType,
    pub required: bool,
    pub description: Option<String>,
    pub default: Option<Value>,
}

const PARAMETER_OPTIONS: &[&str] = &["type", "required", "description", "default"];

impl ParameterSpec {
    fn from_options(name: &str, options: &Map<String, Value>) -> std::result::Result<Self, String> {
        if let Some(unknown) = options.keys().find(|k| !PARAMETER_OPTIONS.contains(&k.as_str())) {
            return Err(format!("parameter `{name}`: unknown option `{unknown}`"));
        }
        let kind = match options.get("type") {
            None => FieldType::String,
            Some(Value::String(t)) => FieldType::parse(t)
                .ok_or_else(|| format!("parameter `{name}`: unknown type `{t}`"))?,
            Some(other) => {
                return Err(format!(
                    "parameter `{name}`: type must be a string, got {}",
                    type_name(other)
                ))
            }
        };
        let required = match options.get("required") {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(format!(
                    "parameter `{name}`: required must be a boolean, got {}",
                    type_name(other)
                ))
            }
        };
        let description = match options.get("description") {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(format!(
                    "parameter `{name}`: description must be a string, got {}",
                    type_name(other)
                ))
            }
        };
        let default = match options.get("default") {
            None | Some(Value::Null) => None,
            Some(value) => Some(kind.check(value).ok_or_else(|| {
                format!("parameter `{name}`: default must be {kind}, got {}", type_name(value))
            })?),
        };
        Ok(Self {
            name: name.to_string(),
            kind,
            required,
            description,
            default,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    pub origin: String,
    body: Arc<Block>,
}

/// What a model client sees of a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn spec(&self) -> ToolSpec {
        let mut properties = Map::new();
        for p in &self.parameters {
            let mut prop = json!({ "type": p.kind.as_str() });
            if let Some(description) = &p.description {
                prop["description"] = Value::from(description.as_str());
            }
            if let Some(default) = &p.default {
                prop["default"] = default.clone();
            }
            properties.insert(p.name.clone(), prop);
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    /// Checks `arguments` against the parameters and returns the locals
    /// the body runs with. Optional parameters without a value are `nil`.
    fn bind(&self, arguments: Value) -> Result<Map<String, Value>> {
        let contract = |field: Option<&str>, message: String| Error::Contract {
            task: self.name.clone(),
            field: field.map(str::to_string),
            message,
        };
        let mut given = match arguments {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(contract(
                    None,
                    format!("arguments must be an object, got {}", type_name(&other)),
                ))
            }
        };
        let mut bindings = Map::new();
        for p in &self.parameters {
            let value = match given.remove(&p.name) {
                Some(Value::Null) | None => match (&p.default, p.required) {
                    (Some(default), _) => default.clone(),
                    (None, true) => {
                        return Err(contract(
                            Some(&p.name),
                            format!("missing required parameter `{}`", p.name),
                        ))
                    }
                    (None, false) => Value::Null,
                },
                Some(value) => p.kind.check(&value).ok_or_else(|| {
                    contract(
                        Some(&p.name),
                        format!(
                            "parameter `{}` must be {}, got {}",
                            p.name,
                            p.kind,
                            type_name(&value)
                        ),
                    )
                })?,
            };
            bindings.insert(p.name.clone(), value);
        }
        if let Some(unknown) = given.keys().next() {
            return Err(contract(
                Some(unknown),
                format!("unknown parameter `{unknown}`"),
            ));
        }
        Ok(bindings)
    }
}

// ── Builder ──────────────────────────────────────────────

struct PendingTool {
    name: String,
    description: Option<String>,
    parameters: Vec<ParameterSpec>,
    body: Option<Arc<Block>>,
}

/// Collects the tools declared by one source.
pub struct ToolBuilder {
    origin: String,
    current: Option<PendingTool>,
    tools: Vec<ToolDefinition>,
}

impl ToolBuilder {
    pub fn new(origin: &str) -> Self {
        Self {
            origin: origin.to_string(),
            current: None,
            tools: Vec::new(),
        }
    }

    pub fn finish(self) -> std::result::Result<Vec<ToolDefinition>, String> {
        if self.tools.is_empty() {
            return Err("source does not define a tool".into());
        }
        Ok(self.tools)
    }

    fn start(&mut self, call: &DslCall<'_>) -> std::result::Result<BlockUse, String> {
        call.expect_args(1, 1)?;
        call.require_block()?;
        if self.current.is_some() {
            return Err("tool definitions cannot be nested".into());
        }
        let name = call.str_arg(0)?;
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(format!(
                "tool name `{name}` must be letters, digits, `_` or `-`"
            ));
        }
        if self.tools.iter().any(|t| t.name == name) {
            return Err(format!("tool `{name}` is already defined"));
        }
        self.current = Some(PendingTool {
            name: name.to_string(),
            description: None,
            parameters: Vec::new(),
            body: None,
        });
        Ok(BlockUse::Evaluate)
    }
}

impl DefinitionBuilder for ToolBuilder {
    fn role(&self) -> Role {
        Role::Tool
    }

    fn dispatch(&mut self, call: DslCall<'_>) -> std::result::Result<BlockUse, String> {
        if call.name == "tool" {
            return self.start(&call);
        }
        let Some(tool) = self.current.as_mut() else {
            return Err(format!("`{}` must be called inside a tool block", call.name));
        };
        match call.name {
            "description" => {
                call.expect_args(1, 1)?;
                tool.description = Some(call.str_arg(0)?.to_string());
            }
            "parameter" => {
                call.expect_args(1, 2)?;
                let name = call.str_arg(0)?;
                if tool.parameters.iter().any(|p| p.name == name) {
                    return Err(format!("parameter `{name}` is already declared"));
                }
                let spec = ParameterSpec::from_options(name, &call.options_arg(1)?)?;
                tool.parameters.push(spec);
            }
            "execute" => {
                call.expect_args(0, 0)?;
                let block = call.require_block()?;
                if tool.body.is_some() {
                    return Err(format!("tool `{}` already has an execute block", tool.name));
                }
                tool.body = Some(Arc::new(block.clone()));
                return Ok(BlockUse::Captured);
            }
            other => return Err(format!("`{other}` is not a tool definition method")),
        }
        if call.block.is_some() {
            return Err(format!("`{}` does not take a block", call.name));
        }
        Ok(BlockUse::Evaluate)
    }

    fn leave(&mut self, name: &str) -> std::result::Result<(), String> {
        if name != "tool" {
            return Ok(());
        }
        let Some(tool) = self.current.take() else {
            return Ok(());
        };
        let body = tool
            .body
            .ok_or_else(|| format!("tool `{}` has no execute block", tool.name))?;
        self.tools.push(ToolDefinition {
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            parameters: tool.parameters,
            origin: self.origin.clone(),
            body,
        });
        Ok(())
    }
}

// ── Tool box ─────────────────────────────────────────────

pub struct ToolBox {
    sandbox: Arc<Sandbox>,
    tools: RwLock<BTreeMap<String, Arc<ToolDefinition>>>,
}

impl ToolBox {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self {
            sandbox,
            tools: RwLock::new(BTreeMap::new()),
        }
    }

    /// Validates and loads every tool in `source`. Nothing is added when
    /// any tool fails or collides with one already loaded.
    pub async fn load(&self, source: &str, origin: &str) -> Result<Vec<String>> {
        let mut builder = ToolBuilder::new(origin);
        self.sandbox.eval(source, origin, &mut builder).await?;
        let loaded = builder.finish().map_err(|message| Error::Execution {
            origin: origin.to_string(),
            line: 0,
            message,
        })?;

        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        if let Some(clash) = loaded.iter().find(|t| tools.contains_key(&t.name)) {
            return Err(Error::Execution {
                origin: origin.to_string(),
                line: 0,
                message: format!("tool `{}` is already defined", clash.name),
            });
        }
        let names: Vec<String> = loaded.iter().map(|t| t.name.clone()).collect();
        for tool in loaded {
            info!("Loaded tool {} from {origin}", tool.name);
            tools.insert(tool.name.clone(), Arc::new(tool));
        }
        Ok(names)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// Specs of every tool, ordered by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|t| t.spec())
            .collect()
    }

    /// Runs tool `name` with `arguments` and returns the body's value.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<Value> {
        let tool = self.get(name).ok_or_else(|| Error::Execution {
            origin: "tools".to_string(),
            line: 0,
            message: format!("unknown tool `{name}`"),
        })?;
        let bindings = tool.bind(arguments)?;
        debug!("Invoking tool {name}");
        self.sandbox
            .run_block(&tool.body, BlockCall::new(&tool.origin, Role::Tool, bindings))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT_TOOLS: &str = r#"
tool("shout") {
  description("Upper-cases text")
  parameter("text", { type: "string", required: true, description: "what to shout" })
  parameter("times", { type: "integer", default: 1 })
  execute {
    let parts = []
    for i in range(times) {
      parts = push(parts, upcase(text))
    }
    join(parts, " ")
  }
}

tool("echo") {
  parameter("value", { type: "object" })
  execute { value }
}
"#;

    async fn toolbox() -> ToolBox {
        let tools = ToolBox::new(Arc::new(Sandbox::default()));
        tools.load(TEXT_TOOLS, "text.tw").await.unwrap();
        tools
    }

    #[tokio::test]
    async fn test_load_and_specs() {
        let tools = toolbox().await;
        let specs = tools.specs();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "shout"]);
        let shout = &specs[1];
        assert_eq!(shout.description, "Upper-cases text");
        assert_eq!(shout.input_schema["required"], json!(["text"]));
        assert_eq!(shout.input_schema["properties"]["times"]["default"], json!(1));
    }

    #[tokio::test]
    async fn test_invoke_applies_defaults() {
        let tools = toolbox().await;
        let out = tools.invoke("shout", json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, json!("HI"));
        let out = tools
            .invoke("shout", json!({"text": "hi", "times": 2}))
            .await
            .unwrap();
        assert_eq!(out, json!("HI HI"));
        let out = tools.invoke("echo", json!({})).await.unwrap();
        assert_eq!(out, Value::Null);
    }

    #[tokio::test]
    async fn test_invoke_checks_arguments() {
        let tools = toolbox().await;
        let err = tools.invoke("shout", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("missing required parameter `text`"));
        let err = tools
            .invoke("shout", json!({"text": "a", "times": "2"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must be integer, got string"));
        let err = tools
            .invoke("shout", json!({"text": "a", "loud": true}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown parameter `loud`"));
        let err = tools.invoke("missing", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("unknown tool `missing`"));
    }

    #[tokio::test]
    async fn test_duplicate_tools_rejected() {
        let tools = toolbox().await;
        let err = tools
            .load("tool(\"echo\") {\n  execute { 1 }\n}", "again.tw")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tool `echo` is already defined"));
        assert_eq!(tools.specs().len(), 2);
    }

    #[tokio::test]
    async fn test_tool_without_execute() {
        let tools = ToolBox::new(Arc::new(Sandbox::default()));
        let err = tools
            .load("tool(\"idle\") {\n  description(\"nothing\")\n}", "idle.tw")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has no execute block"));
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn test_agent_methods_rejected_in_tools() {
        let tools = ToolBox::new(Arc::new(Sandbox::default()));
        let err = tools
            .load("tool(\"t\") {\n  task(:x) { 1 }\n  execute { 1 }\n}", "bad.tw")
            .await
            .unwrap_err();
        let violations = err.violations();
        assert!(violations
            .iter()
            .any(|v| v.message.contains("`task` is not in the tool capability set")));
    }

    #[tokio::test]
    async fn test_tools_cannot_run_tasks() {
        let tools = ToolBox::new(Arc::new(Sandbox::default()));
        tools
            .load("tool(\"sneaky\") {\n  execute { execute_task(:x, {}) }\n}", "sneaky.tw")
            .await
            .unwrap();
        let err = tools.invoke("sneaky", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("only available while an agent is running"));
    }
}
