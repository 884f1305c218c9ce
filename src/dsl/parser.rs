//! Recursive-descent parser.
//!
//! On a malformed statement the parser records a syntax violation, skips to
//! the next statement boundary and keeps going. The partial tree is returned
//! alongside the violations so later passes can still report capability
//! problems in the parts that did parse.

use crate::error::{Violation, ViolationKind};

use super::ast::{AssignTarget, BinaryOp, Block, Expr, ExprKind, Program, Stmt, StmtKind, UnaryOp};
use super::lexer::{tokenize, Tok, Token};

/// Maximum nesting of blocks and expressions.
const MAX_DEPTH: usize = 128;

pub fn parse(source: &str) -> (Program, Vec<Violation>) {
    let (tokens, mut violations) = tokenize(source);
    let mut parser = Parser {
        tokens,
        pos: 0,
        allow_block: true,
        depth: 0,
        violations: Vec::new(),
    };
    let body = parser.program();
    violations.append(&mut parser.violations);
    violations.sort_by_key(|v| v.line);
    (Program { body }, violations)
}

type PResult<T> = Result<T, Violation>;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Cleared while parsing `if`/`for`/`while` headers so the `{` that
    /// opens the body is not taken as a trailing block argument.
    allow_block: bool,
    depth: usize,
    violations: Vec<Violation>,
}

impl Parser {
    // ── Token cursor ─────────────────────────────────────

    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.check(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, context: &str) -> PResult<()> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected {} {context}", tok.describe())))
        }
    }

    fn unexpected(&self, message: &str) -> Violation {
        Violation::new(
            ViolationKind::Syntax,
            self.line(),
            format!("{message}, found {}", self.peek().describe()),
        )
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline | Tok::Semi) {
            self.advance();
        }
    }

    fn enter(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            self.depth -= 1;
            return Err(Violation::new(
                ViolationKind::Syntax,
                self.line(),
                format!("nesting deeper than {MAX_DEPTH} levels"),
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // ── Statements ───────────────────────────────────────

    fn program(&mut self) -> Block {
        let line = self.line();
        let stmts = self.statements(true);
        Block { stmts, line }
    }

    /// Parses statements until `}` (or end of input at top level).
    fn statements(&mut self, top_level: bool) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Tok::Eof => break,
                Tok::RBrace if !top_level => break,
                Tok::RBrace => {
                    let line = self.line();
                    self.violations.push(Violation::new(
                        ViolationKind::Syntax,
                        line,
                        "unmatched `}`",
                    ));
                    self.advance();
                    continue;
                }
                _ => {}
            }
            match self.statement() {
                Ok(stmt) => {
                    stmts.push(stmt);
                    if !matches!(self.peek(), Tok::Newline | Tok::Semi | Tok::RBrace | Tok::Eof) {
                        let violation = self.unexpected("expected end of statement");
                        self.violations.push(violation);
                        self.synchronize();
                    }
                }
                Err(violation) => {
                    self.violations.push(violation);
                    self.synchronize();
                }
            }
        }
        stmts
    }

    /// Skips to the next statement boundary at the current nesting level.
    fn synchronize(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.peek() {
                Tok::Eof => return,
                Tok::Newline | Tok::Semi if depth == 0 => return,
                Tok::RBrace if depth == 0 => return,
                Tok::LParen | Tok::LBracket | Tok::LBrace => depth += 1,
                Tok::RParen | Tok::RBracket | Tok::RBrace => depth = depth.saturating_sub(1),
                _ => {}
            }
            self.advance();
        }
    }

    fn block(&mut self, context: &str) -> PResult<Block> {
        let line = self.line();
        self.expect(&Tok::LBrace, context)?;
        self.enter()?;
        let saved = std::mem::replace(&mut self.allow_block, true);
        let stmts = self.statements(false);
        self.allow_block = saved;
        self.leave();
        if !self.eat(&Tok::RBrace) {
            return Err(Violation::new(
                ViolationKind::Syntax,
                self.line(),
                format!("block opened on line {line} is never closed"),
            ));
        }
        Ok(Block { stmts, line })
    }

    fn statement(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let kind = match self.peek() {
            Tok::Let => {
                self.advance();
                let name = match self.advance() {
                    Tok::Ident(name) => name,
                    other => {
                        return Err(Violation::new(
                            ViolationKind::Syntax,
                            line,
                            format!("expected a lowercase variable name after `let`, found {}", other.describe()),
                        ))
                    }
                };
                self.expect(&Tok::Assign, "after the variable name")?;
                self.skip_newlines();
                let value = self.expression()?;
                StmtKind::Let { name, value }
            }
            Tok::If => self.if_statement()?,
            Tok::For => {
                self.advance();
                let var = match self.advance() {
                    Tok::Ident(name) => name,
                    other => {
                        return Err(Violation::new(
                            ViolationKind::Syntax,
                            line,
                            format!("expected a loop variable, found {}", other.describe()),
                        ))
                    }
                };
                self.expect(&Tok::In, "after the loop variable")?;
                let iter = self.header_expression()?;
                let body = self.block("to open the loop body")?;
                StmtKind::For { var, iter, body }
            }
            Tok::While => {
                self.advance();
                let cond = self.header_expression()?;
                let body = self.block("to open the loop body")?;
                StmtKind::While { cond, body }
            }
            Tok::Return => {
                self.advance();
                if matches!(self.peek(), Tok::Newline | Tok::Semi | Tok::RBrace | Tok::Eof) {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.expression()?))
                }
            }
            _ => {
                let expr = self.expression()?;
                if self.eat(&Tok::Assign) {
                    self.skip_newlines();
                    let target = assign_target(expr)?;
                    let value = self.expression()?;
                    StmtKind::Assign { target, value }
                } else {
                    StmtKind::Expr(expr)
                }
            }
        };
        Ok(Stmt { kind, line })
    }

    fn if_statement(&mut self) -> PResult<StmtKind> {
        let mut branches = Vec::new();
        let mut otherwise = None;
        self.advance();
        loop {
            let cond = self.header_expression()?;
            let body = self.block("to open the `if` body")?;
            branches.push((cond, body));
            if !self.eat(&Tok::Else) {
                break;
            }
            if self.eat(&Tok::If) {
                continue;
            }
            otherwise = Some(self.block("after `else`")?);
            break;
        }
        Ok(StmtKind::If { branches, otherwise })
    }

    /// Expression in an `if`/`for`/`while` header, where `{` starts the body.
    fn header_expression(&mut self) -> PResult<Expr> {
        let saved = std::mem::replace(&mut self.allow_block, false);
        let result = self.expression();
        self.allow_block = saved;
        result
    }

    // ── Expressions ──────────────────────────────────────

    fn expression(&mut self) -> PResult<Expr> {
        self.enter()?;
        let result = self.binary(0);
        self.leave();
        result
    }

    /// Precedence climbing over the binary operator table.
    fn binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut lhs = self.unary()?;
        while let Some((op, prec)) = binary_op(self.peek()) {
            if prec < min_prec {
                break;
            }
            let line = self.line();
            self.advance();
            self.skip_newlines();
            let rhs = self.binary(prec + 1)?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
            );
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> PResult<Expr> {
        let line = self.line();
        let op = match self.peek() {
            Tok::Bang => UnaryOp::Not,
            Tok::Minus => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary();
        self.leave();
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand?),
            },
            line,
        ))
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            let line = self.line();
            match self.peek() {
                Tok::Dot => {
                    self.advance();
                    self.skip_newlines();
                    let name = match self.advance() {
                        Tok::Ident(name) | Tok::Const(name) => name,
                        other => {
                            return Err(Violation::new(
                                ViolationKind::Syntax,
                                line,
                                format!("expected a name after `.`, found {}", other.describe()),
                            ))
                        }
                    };
                    if self.check(&Tok::LParen) {
                        let args = self.arguments()?;
                        let block = self.trailing_block()?;
                        expr = Expr::new(
                            ExprKind::Call {
                                name,
                                receiver: Some(Box::new(expr)),
                                args,
                                block,
                            },
                            line,
                        );
                    } else {
                        expr = Expr::new(
                            ExprKind::Field {
                                object: Box::new(expr),
                                name,
                            },
                            line,
                        );
                    }
                }
                Tok::LBracket => {
                    self.advance();
                    let index = self.nested(|p| p.expression())?;
                    self.expect(&Tok::RBracket, "to close the index")?;
                    expr = Expr::new(
                        ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                        },
                        line,
                    );
                }
                Tok::LParen => {
                    let args = self.arguments()?;
                    expr = Expr::new(
                        ExprKind::DynamicCall {
                            callee: Box::new(expr),
                            args,
                        },
                        line,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let line = self.line();
        // Leave closers in place so recovery can resynchronise on them.
        if matches!(
            self.peek(),
            Tok::RBrace | Tok::RParen | Tok::RBracket | Tok::Newline | Tok::Semi | Tok::Eof
        ) {
            return Err(self.unexpected("expected an expression"));
        }
        let kind = match self.advance() {
            Tok::Nil => ExprKind::Nil,
            Tok::True => ExprKind::Bool(true),
            Tok::False => ExprKind::Bool(false),
            Tok::Int(n) => ExprKind::Int(n),
            Tok::Float(n) => ExprKind::Float(n),
            Tok::Str(s) | Tok::Symbol(s) => ExprKind::Str(s),
            Tok::Shell(cmd) => ExprKind::Shell(cmd),
            Tok::Global(name) => ExprKind::Global(name),
            Tok::Const(name) => ExprKind::Const(name),
            Tok::Ident(name) => {
                if self.check(&Tok::LParen) {
                    let args = self.arguments()?;
                    let block = self.trailing_block()?;
                    ExprKind::Call {
                        name,
                        receiver: None,
                        args,
                        block,
                    }
                } else if self.allow_block && self.check(&Tok::LBrace) {
                    let block = self.trailing_block()?;
                    ExprKind::Call {
                        name,
                        receiver: None,
                        args: Vec::new(),
                        block,
                    }
                } else {
                    ExprKind::Ident(name)
                }
            }
            Tok::LParen => {
                let inner = self.nested(|p| p.expression())?;
                self.expect(&Tok::RParen, "to close the parenthesis")?;
                return Ok(inner);
            }
            Tok::LBracket => ExprKind::Array(self.nested(|p| p.array_items())?),
            Tok::LBrace => ExprKind::Map(self.nested(|p| p.map_entries())?),
            other => {
                return Err(Violation::new(
                    ViolationKind::Syntax,
                    line,
                    format!("expected an expression, found {}", other.describe()),
                ))
            }
        };
        Ok(Expr::new(kind, line))
    }

    /// Runs `f` with trailing blocks re-enabled (inside delimiters).
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        let saved = std::mem::replace(&mut self.allow_block, true);
        self.skip_newlines();
        let result = f(self);
        self.allow_block = saved;
        result
    }

    fn trailing_block(&mut self) -> PResult<Option<Block>> {
        if self.allow_block && self.check(&Tok::LBrace) {
            Ok(Some(self.block("to open the block")?))
        } else {
            Ok(None)
        }
    }

    fn arguments(&mut self) -> PResult<Vec<Expr>> {
        self.expect(&Tok::LParen, "to open the argument list")?;
        self.nested(|p| {
            let mut args = Vec::new();
            loop {
                p.skip_newlines();
                if p.eat(&Tok::RParen) {
                    return Ok(args);
                }
                args.push(p.expression()?);
                p.skip_newlines();
                if p.eat(&Tok::RParen) {
                    return Ok(args);
                }
                p.expect(&Tok::Comma, "between arguments")?;
            }
        })
    }

    fn array_items(&mut self) -> PResult<Vec<Expr>> {
        let mut items = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat(&Tok::RBracket) {
                return Ok(items);
            }
            items.push(self.expression()?);
            self.skip_newlines();
            if self.eat(&Tok::RBracket) {
                return Ok(items);
            }
            self.expect(&Tok::Comma, "between array items")?;
        }
    }

    fn map_entries(&mut self) -> PResult<Vec<(String, Expr)>> {
        let mut entries = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat(&Tok::RBrace) {
                return Ok(entries);
            }
            let line = self.line();
            let key = match self.advance() {
                Tok::Ident(k) | Tok::Const(k) | Tok::Str(k) => k,
                other => {
                    return Err(Violation::new(
                        ViolationKind::Syntax,
                        line,
                        format!("expected a map key, found {}", other.describe()),
                    ))
                }
            };
            self.expect(&Tok::Colon, "after the map key")?;
            self.skip_newlines();
            let value = self.expression()?;
            entries.push((key, value));
            self.skip_newlines();
            if self.eat(&Tok::RBrace) {
                return Ok(entries);
            }
            self.expect(&Tok::Comma, "between map entries")?;
        }
    }
}

fn binary_op(tok: &Tok) -> Option<(BinaryOp, u8)> {
    let op = match tok {
        Tok::OrOr => (BinaryOp::Or, 1),
        Tok::AndAnd => (BinaryOp::And, 2),
        Tok::EqEq => (BinaryOp::Eq, 3),
        Tok::NotEq => (BinaryOp::Ne, 3),
        Tok::Lt => (BinaryOp::Lt, 4),
        Tok::Le => (BinaryOp::Le, 4),
        Tok::Gt => (BinaryOp::Gt, 4),
        Tok::Ge => (BinaryOp::Ge, 4),
        Tok::Plus => (BinaryOp::Add, 5),
        Tok::Minus => (BinaryOp::Sub, 5),
        Tok::Star => (BinaryOp::Mul, 6),
        Tok::Slash => (BinaryOp::Div, 6),
        Tok::Percent => (BinaryOp::Rem, 6),
        _ => return None,
    };
    Some(op)
}

fn assign_target(expr: Expr) -> PResult<AssignTarget> {
    let line = expr.line;
    match expr.kind {
        ExprKind::Ident(name) => Ok(AssignTarget::Local(name)),
        ExprKind::Const(name) => Ok(AssignTarget::Constant(name)),
        ExprKind::Global(name) => Ok(AssignTarget::Global(name)),
        ExprKind::Field { object, name } => Ok(AssignTarget::Attribute { object, name }),
        ExprKind::Index { object, index } => {
            let mut path = vec![*index];
            let mut root = *object;
            loop {
                match root.kind {
                    ExprKind::Ident(name) => {
                        path.reverse();
                        return Ok(AssignTarget::Index { name, path });
                    }
                    ExprKind::Index { object, index } => {
                        path.push(*index);
                        root = *object;
                    }
                    _ => {
                        return Err(Violation::new(
                            ViolationKind::Syntax,
                            line,
                            "indexed assignment must start from a local variable",
                        ))
                    }
                }
            }
        }
        _ => Err(Violation::new(
            ViolationKind::Syntax,
            line,
            "invalid assignment target",
        )),
    }
}
