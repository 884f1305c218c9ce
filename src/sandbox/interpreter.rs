//! Tree-walking evaluator for validated programs.
//!
//! Only runs trees the validator accepted. The forbidden shapes are still
//! refused here so an unvalidated tree can never reach the host.

use std::collections::HashMap;

use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dsl::ast::{AssignTarget, BinaryOp, Block, Expr, ExprKind, Stmt, StmtKind, UnaryOp};
use crate::error::{Error, Result};

use super::capabilities::{CapabilitySet, Role};
use super::helpers::{Helpers, EXECUTE_TASK};
use super::value::{as_float, as_int, check_size, compare, display, equals, float, truthy, type_name};
use super::{BlockUse, DefinitionBuilder, DslCall, TaskHost};

/// Loop iterations between cooperative yields.
const YIELD_EVERY: u64 = 256;

/// Hands control back to the scheduler now and then so timers and
/// cancellation can preempt long loops.
async fn pace(steps: u64) {
    if steps % YIELD_EVERY == 0 {
        tokio::task::yield_now().await;
    }
}

enum Flow {
    Normal(Value),
    Return(Value),
}

impl Flow {
    fn into_value(self) -> Value {
        match self {
            Flow::Normal(v) | Flow::Return(v) => v,
        }
    }
}

pub(crate) struct Interpreter<'a> {
    pub(crate) origin: &'a str,
    pub(crate) role: Role,
    pub(crate) capabilities: &'a CapabilitySet,
    pub(crate) helpers: &'a Helpers,
    pub(crate) host: Option<&'a dyn TaskHost>,
    pub(crate) builder: Option<&'a mut dyn DefinitionBuilder>,
    pub(crate) cancel: Option<&'a CancellationToken>,
    pub(crate) max_steps: u64,
    steps: u64,
    scopes: Vec<HashMap<String, Value>>,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(
        origin: &'a str,
        role: Role,
        capabilities: &'a CapabilitySet,
        helpers: &'a Helpers,
        max_steps: u64,
    ) -> Self {
        Self {
            origin,
            role,
            capabilities,
            helpers,
            host: None,
            builder: None,
            cancel: None,
            max_steps,
            steps: 0,
            scopes: vec![HashMap::new()],
        }
    }

    /// Runs `block` with `bindings` as locals and returns its value: the
    /// argument of `return`, or the value of the last statement.
    pub(crate) async fn run(mut self, block: &Block, bindings: Map<String, Value>) -> Result<Value> {
        self.scopes = vec![bindings.into_iter().collect()];
        let flow = self.stmts(&block.stmts).await?;
        debug!(origin = self.origin, steps = self.steps, "block finished");
        Ok(flow.into_value())
    }

    fn fail(&self, line: usize, message: impl Into<String>) -> Error {
        Error::Execution {
            origin: self.origin.to_string(),
            line,
            message: message.into(),
        }
    }

    fn tick(&mut self, line: usize) -> Result<()> {
        if self.cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(self.fail(
                line,
                format!("step budget of {} exhausted", self.max_steps),
            ));
        }
        Ok(())
    }

    // ── Variables ────────────────────────────────────────

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn lookup_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
    }

    fn define(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    fn assign(&mut self, name: &str, value: Value) {
        match self.lookup_mut(name) {
            Some(slot) => *slot = value,
            None => self.define(name, value),
        }
    }

    // ── Statements ───────────────────────────────────────

    fn block<'s>(&'s mut self, block: &'s Block) -> BoxFuture<'s, Result<Flow>> {
        async move {
            self.scopes.push(HashMap::new());
            let result = self.stmts(&block.stmts).await;
            self.scopes.pop();
            result
        }
        .boxed()
    }

    async fn stmts(&mut self, stmts: &[Stmt]) -> Result<Flow> {
        let mut last = Value::Null;
        for stmt in stmts {
            match self.stmt(stmt).await? {
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal(value) => last = value,
            }
        }
        Ok(Flow::Normal(last))
    }

    fn stmt<'s>(&'s mut self, stmt: &'s Stmt) -> BoxFuture<'s, Result<Flow>> {
        async move {
            let line = stmt.line;
            self.tick(line)?;
            match &stmt.kind {
                StmtKind::Let { name, value } => {
                    let value = self.expr(value).await?;
                    self.define(name, value);
                    Ok(Flow::Normal(Value::Null))
                }
                StmtKind::Assign { target, value } => {
                    let value = self.expr(value).await?;
                    self.assign_to(target, value, line).await?;
                    Ok(Flow::Normal(Value::Null))
                }
                StmtKind::If { branches, otherwise } => {
                    for (cond, body) in branches {
                        if truthy(&self.expr(cond).await?) {
                            return self.block(body).await;
                        }
                    }
                    match otherwise {
                        Some(body) => self.block(body).await,
                        None => Ok(Flow::Normal(Value::Null)),
                    }
                }
                StmtKind::For { var, iter, body } => {
                    let items = match self.expr(iter).await? {
                        Value::Array(items) => items,
                        Value::Object(map) => map.into_iter().map(|(k, _)| Value::from(k)).collect(),
                        Value::Null => Vec::new(),
                        other => {
                            return Err(self.fail(
                                line,
                                format!("cannot iterate over {}", type_name(&other)),
                            ))
                        }
                    };
                    for item in items {
                        self.tick(line)?;
                        pace(self.steps).await;
                        self.scopes.push(HashMap::from([(var.clone(), item)]));
                        let flow = self.stmts(&body.stmts).await;
                        self.scopes.pop();
                        if let Flow::Return(value) = flow? {
                            return Ok(Flow::Return(value));
                        }
                    }
                    Ok(Flow::Normal(Value::Null))
                }
                StmtKind::While { cond, body } => {
                    loop {
                        self.tick(line)?;
                        pace(self.steps).await;
                        if !truthy(&self.expr(cond).await?) {
                            break;
                        }
                        if let Flow::Return(value) = self.block(body).await? {
                            return Ok(Flow::Return(value));
                        }
                    }
                    Ok(Flow::Normal(Value::Null))
                }
                StmtKind::Return(value) => {
                    let value = match value {
                        Some(expr) => self.expr(expr).await?,
                        None => Value::Null,
                    };
                    Ok(Flow::Return(value))
                }
                StmtKind::Expr(expr) => Ok(Flow::Normal(self.expr(expr).await?)),
            }
        }
        .boxed()
    }

    async fn assign_to(&mut self, target: &AssignTarget, value: Value, line: usize) -> Result<()> {
        match target {
            AssignTarget::Local(name) => {
                self.assign(name, value);
                Ok(())
            }
            AssignTarget::Index { name, path } => {
                let mut keys = Vec::with_capacity(path.len());
                for index in path {
                    keys.push(self.expr(index).await?);
                }
                let origin = self.origin.to_string();
                let fail = |message: String| Error::Execution {
                    origin: origin.clone(),
                    line,
                    message,
                };
                let slot = self
                    .lookup_mut(name)
                    .ok_or_else(|| fail(format!("undefined variable `{name}`")))?;
                store(slot, &keys, value).map_err(fail)
            }
            AssignTarget::Constant(name) => {
                Err(self.fail(line, format!("assignment to constant `{name}` is not permitted")))
            }
            AssignTarget::Attribute { name, .. } => {
                Err(self.fail(line, format!("assignment to attribute `.{name}` is not permitted")))
            }
            AssignTarget::Global(name) => {
                Err(self.fail(line, format!("assignment to `${name}` is not permitted")))
            }
        }
    }

    // ── Expressions ──────────────────────────────────────

    fn expr<'s>(&'s mut self, expr: &'s Expr) -> BoxFuture<'s, Result<Value>> {
        async move {
            let line = expr.line;
            match &expr.kind {
                ExprKind::Nil => Ok(Value::Null),
                ExprKind::Bool(b) => Ok(Value::Bool(*b)),
                ExprKind::Int(i) => Ok(Value::from(*i)),
                ExprKind::Float(f) => Ok(float(*f)),
                ExprKind::Str(s) => Ok(Value::from(s.as_str())),
                ExprKind::Array(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.expr(item).await?);
                    }
                    Ok(Value::Array(values))
                }
                ExprKind::Map(entries) => {
                    let mut map = Map::new();
                    for (key, value) in entries {
                        let value = self.expr(value).await?;
                        map.insert(key.clone(), value);
                    }
                    Ok(Value::Object(map))
                }
                ExprKind::Ident(name) => self
                    .lookup(name)
                    .cloned()
                    .ok_or_else(|| self.fail(line, format!("undefined variable `{name}`"))),
                ExprKind::Const(name) => {
                    Err(self.fail(line, format!("constant `{name}` is not available")))
                }
                ExprKind::Global(name) => {
                    Err(self.fail(line, format!("`${name}` is not available")))
                }
                ExprKind::Shell(_) => Err(self.fail(line, "command literals are not available")),
                ExprKind::DynamicCall { .. } => {
                    Err(self.fail(line, "calls through a computed target are not available"))
                }
                ExprKind::Unary { op, operand } => {
                    let value = self.expr(operand).await?;
                    unary(*op, value).map_err(|m| self.fail(line, m))
                }
                ExprKind::Binary { op, lhs, rhs } => {
                    let left = self.expr(lhs).await?;
                    match op {
                        BinaryOp::And if !truthy(&left) => return Ok(left),
                        BinaryOp::Or if truthy(&left) => return Ok(left),
                        BinaryOp::And | BinaryOp::Or => return self.expr(rhs).await,
                        _ => {}
                    }
                    let right = self.expr(rhs).await?;
                    binary(*op, left, right, self.helpers.max_value_size())
                        .map_err(|m| self.fail(line, m))
                }
                ExprKind::Field { object, name } => match self.expr(object).await? {
                    Value::Object(mut map) => Ok(map.remove(name).unwrap_or(Value::Null)),
                    other => Err(self.fail(
                        line,
                        format!("cannot read field `{name}` of {}", type_name(&other)),
                    )),
                },
                ExprKind::Index { object, index } => {
                    let container = self.expr(object).await?;
                    let key = self.expr(index).await?;
                    index_value(container, &key).map_err(|m| self.fail(line, m))
                }
                ExprKind::Call {
                    name,
                    receiver,
                    args,
                    block,
                } => {
                    self.call(name, receiver.as_deref(), args, block.as_ref(), line)
                        .await
                }
            }
        }
        .boxed()
    }

    async fn call(
        &mut self,
        name: &str,
        receiver: Option<&Expr>,
        args: &[Expr],
        block: Option<&Block>,
        line: usize,
    ) -> Result<Value> {
        let mut values = Vec::with_capacity(args.len() + 1);
        if let Some(receiver) = receiver {
            values.push(self.expr(receiver).await?);
        }
        for arg in args {
            values.push(self.expr(arg).await?);
        }

        if receiver.is_none() && self.capabilities.is_definition_method(self.role, name) {
            return self.definition_call(name, values, block, line).await;
        }
        if !self.capabilities.is_helper(name) {
            return Err(self.fail(line, format!("`{name}` is not available")));
        }
        if name == EXECUTE_TASK {
            return self.execute_task(values, line).await;
        }
        let helpers = self.helpers;
        helpers
            .call(name, &values)
            .await
            .map_err(|m| self.fail(line, m))
    }

    async fn definition_call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        block: Option<&Block>,
        line: usize,
    ) -> Result<Value> {
        let origin = self.origin;
        let fail = |message: String| Error::Execution {
            origin: origin.to_string(),
            line,
            message,
        };
        let Some(builder) = self.builder.as_deref_mut() else {
            return Err(fail(format!("`{name}` may only be used at definition level")));
        };
        let call = DslCall {
            name,
            args,
            block,
            line,
        };
        let usage = builder.dispatch(call).map_err(&fail)?;
        if let (BlockUse::Evaluate, Some(block)) = (usage, block) {
            if let Flow::Return(_) = self.block(block).await? {
                return Err(fail(format!("`return` is not allowed inside `{name}`")));
            }
            if let Some(builder) = self.builder.as_deref_mut() {
                builder.leave(name).map_err(&fail)?;
            }
        }
        Ok(Value::Null)
    }

    async fn execute_task(&mut self, args: Vec<Value>, line: usize) -> Result<Value> {
        let Some(host) = self.host else {
            return Err(self.fail(
                line,
                "execute_task is only available while an agent is running",
            ));
        };
        let mut args = args.into_iter();
        let task = match args.next() {
            Some(Value::String(task)) => task,
            Some(other) => {
                return Err(self.fail(
                    line,
                    format!("execute_task: task name must be a string, got {}", type_name(&other)),
                ))
            }
            None => return Err(self.fail(line, "execute_task: missing task name")),
        };
        let inputs = match args.next() {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(value @ Value::Object(_)) => value,
            Some(other) => {
                return Err(self.fail(
                    line,
                    format!("execute_task: inputs must be an object, got {}", type_name(&other)),
                ))
            }
        };
        if args.next().is_some() {
            return Err(self.fail(line, "execute_task expects at most 2 arguments"));
        }
        host.call_task(&task, inputs).await
    }
}

// ── Operators ────────────────────────────────────────────

fn unary(op: UnaryOp, value: Value) -> std::result::Result<Value, String> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
        UnaryOp::Neg => match as_int(&value) {
            Some(i) => i
                .checked_neg()
                .map(Value::from)
                .ok_or_else(|| "integer overflow".to_string()),
            None => match as_float(&value) {
                Some(f) => Ok(float(-f)),
                None => Err(format!("cannot negate {}", type_name(&value))),
            },
        },
    }
}

/// Applies `op`. `+` on strings and collections refuses results larger than
/// `limit` bytes or entries.
fn binary(op: BinaryOp, left: Value, right: Value, limit: usize) -> std::result::Result<Value, String> {
    use BinaryOp::*;
    match op {
        Eq => return Ok(Value::Bool(equals(&left, &right))),
        Ne => return Ok(Value::Bool(!equals(&left, &right))),
        Lt | Le | Gt | Ge => {
            let ordering = compare(&left, &right).ok_or_else(|| {
                format!(
                    "cannot compare {} with {}",
                    type_name(&left),
                    type_name(&right)
                )
            })?;
            let result = match op {
                Lt => ordering.is_lt(),
                Le => ordering.is_le(),
                Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    if op == Add {
        match (&left, &right) {
            (Value::String(_), _) | (_, Value::String(_)) => {
                let (a, b) = (display(&left), display(&right));
                check_size(a.len().saturating_add(b.len()), limit)?;
                return Ok(Value::from(a + &b));
            }
            (Value::Array(a), Value::Array(b)) => {
                check_size(a.len().saturating_add(b.len()), limit)?;
                return Ok(Value::Array(a.iter().chain(b).cloned().collect()));
            }
            (Value::Object(a), Value::Object(b)) => {
                check_size(a.len().saturating_add(b.len()), limit)?;
                let mut merged = a.clone();
                merged.extend(b.clone());
                return Ok(Value::Object(merged));
            }
            _ => {}
        }
    }

    let mismatch = || {
        format!(
            "unsupported operand types for {}: {} and {}",
            op.symbol(),
            type_name(&left),
            type_name(&right)
        )
    };

    if let (Some(a), Some(b)) = (as_int(&left), as_int(&right)) {
        let result = match op {
            Add => a.checked_add(b),
            Sub => a.checked_sub(b),
            Mul => a.checked_mul(b),
            Div if b == 0 => return Err("division by zero".into()),
            Div => a.checked_div(b),
            Rem if b == 0 => return Err("division by zero".into()),
            Rem => a.checked_rem(b),
            _ => return Err(mismatch()),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| "integer overflow".to_string());
    }

    let (Some(a), Some(b)) = (as_float(&left), as_float(&right)) else {
        return Err(mismatch());
    };
    let result = match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        Div | Rem if b == 0.0 => return Err("division by zero".into()),
        Div => a / b,
        Rem => a % b,
        _ => return Err(mismatch()),
    };
    if !result.is_finite() {
        return Err("numeric overflow".into());
    }
    Ok(float(result))
}

/// Resolves a possibly negative index against `len`.
fn position(len: usize, index: i64) -> Option<usize> {
    let resolved = if index < 0 {
        (len as i64).checked_add(index)?
    } else {
        index
    };
    (0..len as i64).contains(&resolved).then_some(resolved as usize)
}

fn index_value(container: Value, key: &Value) -> std::result::Result<Value, String> {
    match (container, key) {
        (Value::Object(mut map), Value::String(k)) => Ok(map.remove(k).unwrap_or(Value::Null)),
        (Value::Array(mut items), k) => match as_int(k) {
            Some(i) => Ok(position(items.len(), i)
                .map(|p| items.swap_remove(p))
                .unwrap_or(Value::Null)),
            None => Err(format!("array index must be an integer, got {}", type_name(k))),
        },
        (Value::String(s), k) => match as_int(k) {
            Some(i) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(position(chars.len(), i)
                    .map(|p| Value::from(chars[p].to_string()))
                    .unwrap_or(Value::Null))
            }
            None => Err(format!("string index must be an integer, got {}", type_name(k))),
        },
        (Value::Null, _) => Ok(Value::Null),
        (other, k) => Err(format!(
            "cannot index {} with {}",
            type_name(&other),
            type_name(k)
        )),
    }
}

/// Writes `value` at `path` inside `slot`. Missing object keys along the
/// path are created; arrays accept an index one past the end as a push.
fn store(slot: &mut Value, path: &[Value], value: Value) -> std::result::Result<(), String> {
    let Some((key, rest)) = path.split_first() else {
        *slot = value;
        return Ok(());
    };
    match (slot, key) {
        (Value::Object(map), Value::String(k)) => {
            let child = map.entry(k.clone()).or_insert_with(|| {
                if rest.is_empty() {
                    Value::Null
                } else {
                    Value::Object(Map::new())
                }
            });
            store(child, rest, value)
        }
        (Value::Array(items), k) => {
            let i = as_int(k)
                .ok_or_else(|| format!("array index must be an integer, got {}", type_name(k)))?;
            if i >= 0 && i as usize == items.len() && rest.is_empty() {
                items.push(value);
                return Ok(());
            }
            let p = position(items.len(), i)
                .ok_or_else(|| format!("index {i} out of bounds for array of length {}", items.len()))?;
            store(&mut items[p], rest, value)
        }
        (other, k) => Err(format!(
            "cannot assign into {} with a {} key",
            type_name(other),
            type_name(k)
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parse;
    use serde_json::json;

    async fn eval(source: &str) -> Result<Value> {
        eval_with(source, json!({})).await
    }

    async fn eval_with(source: &str, bindings: Value) -> Result<Value> {
        let (program, violations) = parse(source);
        assert!(violations.is_empty(), "{violations:?}");
        let caps = CapabilitySet::standard();
        let helpers = Helpers::default();
        let bindings = match bindings {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Interpreter::new("test", Role::Agent, &caps, &helpers, 10_000)
            .run(&program.body, bindings)
            .await
    }

    #[tokio::test]
    async fn test_arithmetic_and_precedence() {
        assert_eq!(eval("1 + 2 * 3").await.unwrap(), json!(7));
        assert_eq!(eval("7 / 2").await.unwrap(), json!(3));
        assert_eq!(eval("7.0 / 2").await.unwrap(), json!(3.5));
        assert_eq!(eval("-5 % 3").await.unwrap(), json!(-2));
        assert_eq!(eval("\"n=\" + 4").await.unwrap(), json!("n=4"));
        assert_eq!(eval("[1] + [2]").await.unwrap(), json!([1, 2]));
    }

    #[tokio::test]
    async fn test_division_by_zero_is_an_error() {
        let err = eval("\n1 / 0").await.unwrap_err();
        match err {
            Error::Execution { line, message, .. } => {
                assert_eq!(line, 2);
                assert_eq!(message, "division by zero");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_short_circuit_returns_operands() {
        assert_eq!(eval("nil || \"fallback\"").await.unwrap(), json!("fallback"));
        assert_eq!(eval("false && undefined_name").await.unwrap(), json!(false));
    }

    #[tokio::test]
    async fn test_bindings_and_fields() {
        let value = eval_with("inputs.a + b", json!({"inputs": {"a": 2}, "b": 3}))
            .await
            .unwrap();
        assert_eq!(value, json!(5));
        assert_eq!(
            eval_with("inputs.missing", json!({"inputs": {}})).await.unwrap(),
            json!(null)
        );
    }

    #[tokio::test]
    async fn test_control_flow() {
        let source = r#"
let total = 0
for n in [1, 2, 3, 4] {
  if n % 2 == 0 {
    total = total + n
  } else {
    total = total - 1
  }
}
total
"#;
        assert_eq!(eval(source).await.unwrap(), json!(4));

        let source = r#"
let i = 0
while i < 10 {
  i = i + 1
  if i == 3 {
    return { stopped_at: i }
  }
}
"#;
        assert_eq!(eval(source).await.unwrap(), json!({"stopped_at": 3}));
    }

    #[tokio::test]
    async fn test_block_scoping() {
        let source = r#"
let x = 1
if true {
  let x = 2
  x = 3
}
x
"#;
        assert_eq!(eval(source).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_index_assignment() {
        let source = r#"
let data = { items: [1, 2] }
data["items"][0] = 10
data["items"][2] = 3
data["meta"]["count"] = 3
data
"#;
        assert_eq!(
            eval(source).await.unwrap(),
            json!({"items": [10, 2, 3], "meta": {"count": 3}})
        );
    }

    #[tokio::test]
    async fn test_method_sugar_calls_helpers() {
        assert_eq!(eval("\"abc\".upcase()").await.unwrap(), json!("ABC"));
        assert_eq!(eval("[3, 1, 2].sort().first()").await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_step_budget() {
        let (program, _) = parse("while true { }");
        let caps = CapabilitySet::standard();
        let helpers = Helpers::default();
        let err = Interpreter::new("loop", Role::Agent, &caps, &helpers, 50)
            .run(&program.body, Map::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("step budget of 50 exhausted"));
    }

    #[tokio::test]
    async fn test_doubling_stops_at_value_size_limit() {
        let (program, _) = parse("let s = \"x\"\nwhile true {\n  s = s + s\n}");
        let caps = CapabilitySet::standard();
        let helpers = Helpers::default().with_max_value_size(1024);
        let err = Interpreter::new("grow", Role::Agent, &caps, &helpers, 10_000)
            .run(&program.body, Map::new())
            .await
            .unwrap_err();
        match err {
            Error::Execution { line, message, .. } => {
                assert_eq!(line, 3);
                assert_eq!(message, "value exceeds the size limit of 1024");
            }
            other => panic!("expected execution error, got {other:?}"),
        }

        let (program, _) = parse("let a = [1]\nwhile true {\n  a = a + a\n}");
        let err = Interpreter::new("grow", Role::Agent, &caps, &helpers, 10_000)
            .run(&program.body, Map::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("size limit of 1024"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_evaluation() {
        let (program, _) = parse("let a = 1\nlet b = 2");
        let caps = CapabilitySet::standard();
        let helpers = Helpers::default();
        let token = CancellationToken::new();
        token.cancel();
        let mut interp = Interpreter::new("cancel", Role::Agent, &caps, &helpers, 100);
        interp.cancel = Some(&token);
        let err = interp.run(&program.body, Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_execute_task_without_host() {
        let err = eval("execute_task(:add, {})").await.unwrap_err();
        assert!(err.to_string().contains("only available while an agent is running"));
    }

    #[tokio::test]
    async fn test_helper_errors_carry_line() {
        let err = eval("\n\nfail(\"boom\")").await.unwrap_err();
        assert_eq!(err.to_string(), "test:3: boom");
    }

    #[test]
    fn test_store_rejects_out_of_bounds() {
        let mut slot = json!([1]);
        assert!(store(&mut slot, &[json!(5)], json!(0)).is_err());
        assert!(store(&mut slot, &[json!(-1)], json!(9)).is_ok());
        assert_eq!(slot, json!([9]));
    }
}
