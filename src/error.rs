//! Classified runtime errors.
//!
//! Every failure the runtime reports falls into one of these classes so the
//! host can decide whether to fail the run, fall back, or retry the load with
//! a corrected definition.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Category of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Call target outside the role's capability set.
    Capability,
    /// Source could not be parsed.
    Syntax,
    /// Structurally forbidden construct (shell literal, global, ...).
    Primitive,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::Capability => write!(f, "capability"),
            ViolationKind::Syntax => write!(f, "syntax"),
            ViolationKind::Primitive => write!(f, "primitive"),
        }
    }
}

/// A single validation finding with its source line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub message: String,
    pub line: usize,
}

impl Violation {
    pub fn new(kind: ViolationKind, line: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {} violation: {}", self.line, self.kind, self.message)
    }
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Source rejected before any of it ran.
    #[error("{origin}: rejected with {} violation(s): {}", violations.len(), summarize(violations))]
    Load {
        origin: String,
        violations: Vec<Violation>,
    },

    /// Inputs or outputs did not match the task's declared schema.
    #[error("contract violation in task '{task}': {message}")]
    Contract {
        task: String,
        field: Option<String>,
        message: String,
    },

    /// The resolver kept failing (or failed terminally).
    #[error("task '{task}' failed after {attempts} attempt(s): {message}")]
    Resolver {
        task: String,
        attempts: u32,
        message: String,
    },

    /// Runtime failure inside validated sandbox code.
    #[error("{origin}:{line}: {message}")]
    Execution {
        origin: String,
        line: usize,
        message: String,
    },

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("output delivery failed: {0}")]
    Delivery(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// The violation list carried by a load error, empty otherwise.
    pub fn violations(&self) -> &[Violation] {
        match self {
            Error::Load { violations, .. } => violations,
            _ => &[],
        }
    }
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
