//! The definition language: a small, closed expression language in which
//! agents and tools are declared.
//!
//! ```text
//! agent("calculator") {
//!   task(:add, { inputs: { a: "integer", b: "integer" }, outputs: { sum: "integer" } }) {
//!     { sum: a + b }
//!   }
//!   main {
//!     execute_task(:add, inputs)
//!   }
//! }
//! ```

pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::{Block, Program};
pub use parser::parse;
