//! Capability registry.
//!
//! The set of names sandboxed code may call, partitioned by role. A set is an
//! ordinary value: build one with [`CapabilitySet::standard`], narrow it from
//! configuration, and hand it to the sandbox by reference. Nothing here is
//! global, so independent sandboxes can coexist in one process.

use std::collections::BTreeSet;
use std::fmt;

use super::helpers::helper_names;

/// Which kind of definition a source declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Agent,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Agent => write!(f, "agent"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Definition methods available in agent sources.
pub const AGENT_METHODS: &[&str] = &[
    "agent",
    "description",
    "mode",
    "schedule",
    "objective",
    "persona",
    "constraints",
    "task",
    "main",
];

/// Definition methods available in tool sources.
pub const TOOL_METHODS: &[&str] = &["tool", "description", "parameter", "execute"];

/// Definition methods whose block is stored as code instead of evaluated.
pub const BODY_METHODS: &[&str] = &["task", "main", "execute"];

/// Definition methods whose block is evaluated immediately.
pub const SCOPE_METHODS: &[&str] = &["agent", "tool"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    agent_methods: BTreeSet<String>,
    tool_methods: BTreeSet<String>,
    helper_methods: BTreeSet<String>,
}

impl CapabilitySet {
    pub fn new<A, T, H>(agent_methods: A, tool_methods: T, helper_methods: H) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
        H: IntoIterator,
        H::Item: Into<String>,
    {
        Self {
            agent_methods: agent_methods.into_iter().map(Into::into).collect(),
            tool_methods: tool_methods.into_iter().map(Into::into).collect(),
            helper_methods: helper_methods.into_iter().map(Into::into).collect(),
        }
    }

    /// Every definition method plus the full helper namespace.
    pub fn standard() -> Self {
        Self::new(
            AGENT_METHODS.iter().copied(),
            TOOL_METHODS.iter().copied(),
            helper_names(),
        )
    }

    /// Returns a copy with the named helpers removed.
    pub fn without_helpers<'n>(mut self, names: impl IntoIterator<Item = &'n str>) -> Self {
        for name in names {
            self.helper_methods.remove(name);
        }
        self
    }

    /// Definition methods for `role`.
    pub fn definition_methods(&self, role: Role) -> &BTreeSet<String> {
        match role {
            Role::Agent => &self.agent_methods,
            Role::Tool => &self.tool_methods,
        }
    }

    pub fn helper_methods(&self) -> &BTreeSet<String> {
        &self.helper_methods
    }

    pub fn is_definition_method(&self, role: Role, name: &str) -> bool {
        self.definition_methods(role).contains(name)
    }

    pub fn is_helper(&self, name: &str) -> bool {
        self.helper_methods.contains(name)
    }

    /// True when code written for `role` may call `name` somewhere.
    pub fn permits(&self, role: Role, name: &str) -> bool {
        self.is_definition_method(role, name) || self.is_helper(name)
    }
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::standard()
    }
}
