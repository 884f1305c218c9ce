//! Static validation of definition sources.
//!
//! Parses first, then walks the tree twice over in one pass: once resolving
//! every call target against the role's capability set, and once rejecting
//! forbidden constructs by their shape. Shape checks do not look at names,
//! so renaming or aliasing cannot smuggle a forbidden primitive through.

use crate::dsl::ast::{AssignTarget, Block, Expr, ExprKind, Program, Stmt, StmtKind};
use crate::dsl::parse;
use crate::error::{Violation, ViolationKind};

use super::capabilities::{CapabilitySet, Role, BODY_METHODS, SCOPE_METHODS};

pub struct Validator<'c> {
    capabilities: &'c CapabilitySet,
}

impl<'c> Validator<'c> {
    pub fn new(capabilities: &'c CapabilitySet) -> Self {
        Self { capabilities }
    }

    /// Parses and checks `source`, returning the tree when it is clean.
    ///
    /// On failure the full violation list is returned, ordered by line.
    pub fn validate(&self, source: &str, role: Role) -> Result<Program, Vec<Violation>> {
        let (program, mut violations) = parse(source);
        let mut walker = Walker {
            capabilities: self.capabilities,
            role,
            in_body: false,
            violations: Vec::new(),
        };
        walker.block(&program.body);
        violations.append(&mut walker.violations);
        violations.sort_by_key(|v| v.line);
        if violations.is_empty() {
            Ok(program)
        } else {
            Err(violations)
        }
    }

    /// Convenience wrapper returning only the findings.
    pub fn check(&self, source: &str, role: Role) -> Vec<Violation> {
        self.validate(source, role).err().unwrap_or_default()
    }
}

struct Walker<'c> {
    capabilities: &'c CapabilitySet,
    role: Role,
    /// Inside a `task`/`main`/`execute` body, where only helpers are callable.
    in_body: bool,
    violations: Vec<Violation>,
}

impl Walker<'_> {
    fn push(&mut self, kind: ViolationKind, line: usize, message: String) {
        self.violations.push(Violation::new(kind, line, message));
    }

    fn block(&mut self, block: &Block) {
        for stmt in &block.stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let { value, .. } => self.expr(value),
            StmtKind::Assign { target, value } => {
                self.target(target, stmt.line);
                self.expr(value);
            }
            StmtKind::If { branches, otherwise } => {
                for (cond, body) in branches {
                    self.expr(cond);
                    self.block(body);
                }
                if let Some(body) = otherwise {
                    self.block(body);
                }
            }
            StmtKind::For { iter, body, .. } => {
                self.expr(iter);
                self.block(body);
            }
            StmtKind::While { cond, body } => {
                self.expr(cond);
                self.block(body);
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
            }
            StmtKind::Expr(expr) => self.expr(expr),
        }
    }

    fn target(&mut self, target: &AssignTarget, line: usize) {
        match target {
            AssignTarget::Local(_) => {}
            AssignTarget::Index { path, .. } => {
                for index in path {
                    self.expr(index);
                }
            }
            AssignTarget::Constant(name) => self.push(
                ViolationKind::Primitive,
                line,
                format!("assignment to constant `{name}` is not permitted (constant mutation)"),
            ),
            AssignTarget::Attribute { object, name } => {
                self.push(
                    ViolationKind::Primitive,
                    line,
                    format!("assignment to attribute `.{name}` is not permitted (attribute mutation)"),
                );
                self.expr(object);
            }
            AssignTarget::Global(name) => self.push(
                ViolationKind::Primitive,
                line,
                format!("assignment to `${name}` is not permitted (raw descriptor access)"),
            ),
        }
    }

    fn expr(&mut self, expr: &Expr) {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Nil
            | ExprKind::Bool(_)
            | ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_)
            | ExprKind::Ident(_) => {}
            ExprKind::Array(items) => {
                for item in items {
                    self.expr(item);
                }
            }
            ExprKind::Map(entries) => {
                for (_, value) in entries {
                    self.expr(value);
                }
            }
            ExprKind::Const(name) => self.push(
                ViolationKind::Capability,
                line,
                format!("constant `{name}` is not available in the sandbox"),
            ),
            ExprKind::Global(name) => self.push(
                ViolationKind::Primitive,
                line,
                format!("reference to `${name}` is not permitted (raw descriptor access)"),
            ),
            ExprKind::Shell(_) => self.push(
                ViolationKind::Primitive,
                line,
                "backtick command literal is not permitted (process spawning)".to_string(),
            ),
            ExprKind::Unary { operand, .. } => self.expr(operand),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.expr(lhs);
                self.expr(rhs);
            }
            ExprKind::Field { object, .. } => self.expr(object),
            ExprKind::Index { object, index } => {
                self.expr(object);
                self.expr(index);
            }
            ExprKind::DynamicCall { callee, args } => {
                let message = if matches!(callee.kind, ExprKind::Str(_)) {
                    "calling a string is not permitted (dynamic code evaluation)"
                } else {
                    "call through a computed target is not permitted (reflection-based dispatch)"
                };
                self.push(ViolationKind::Primitive, line, message.to_string());
                self.expr(callee);
                for arg in args {
                    self.expr(arg);
                }
            }
            ExprKind::Call {
                name,
                receiver,
                args,
                block,
            } => self.call(name, receiver.as_deref(), args, block.as_ref(), line),
        }
    }

    fn call(
        &mut self,
        name: &str,
        receiver: Option<&Expr>,
        args: &[Expr],
        block: Option<&Block>,
        line: usize,
    ) {
        let caps = self.capabilities;
        let is_definition = caps.is_definition_method(self.role, name);

        if is_definition && (self.in_body || receiver.is_some()) {
            self.push(
                ViolationKind::Capability,
                line,
                format!("`{name}` may only be used at definition level"),
            );
        } else if !caps.permits(self.role, name) {
            self.push(
                ViolationKind::Capability,
                line,
                format!("`{name}` is not in the {} capability set", self.role),
            );
        }

        if let Some(receiver) = receiver {
            self.expr(receiver);
        }
        for arg in args {
            self.expr(arg);
        }

        let Some(block) = block else { return };
        let takes_block = is_definition
            && (BODY_METHODS.contains(&name) || SCOPE_METHODS.contains(&name));
        if !takes_block {
            self.push(
                ViolationKind::Syntax,
                block.line,
                format!("`{name}` does not take a block"),
            );
        }
        let entering_body = BODY_METHODS.contains(&name);
        let saved = self.in_body;
        self.in_body = self.in_body || entering_body || !takes_block;
        self.block(block);
        self.in_body = saved;
    }
}
