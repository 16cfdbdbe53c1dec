//! actionflow – an interpreter for declarative action programs
//!
//! Request handlers are written as trees of named instructions (blocks,
//! conditionals, loops, sub-program calls, data access and response glue)
//! stored as XML documents. This crate provides:
//! - A dispatcher with a name→handler registry validated at load time
//! - Structured control flow carried as values (`Flow`), not exceptions
//! - Shared and isolated sub-program invocation with bounded recursion
//! - A response assembler with JSON/XML output, gzip/deflate, an on-disk
//!   response cache and conditional-request handling
//! - Batch mode running several programs into one keyed reply

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Action nodes, execution context, flow signals and instructions
pub mod interpreter;

/// Engine, program loading, collaborators and response assembly
pub mod runtime;

// Re-export key types for convenience
pub use interpreter::{ActionNode, ExecutionContext, Flow, InterpreterError, Program};
pub use runtime::{Engine, EngineConfig, SubRequest};

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
