//! The action-tree interpreter.
//!
//! Programs are trees of named instruction nodes. The interpreter walks them
//! against a mutable [`ExecutionContext`], dispatching every node to the
//! handler registered under its name. Handlers report how execution should
//! proceed through [`Flow`]: fall through, loop control, stop, or reply.

/// Action nodes and programs.
pub mod node;
/// Parser turning program documents into action nodes.
pub mod parser;
/// Structured value helpers.
pub mod value;
/// Boolean expressions for conditions.
pub mod expr;
/// Per-request execution scope.
pub mod context;
/// Flow signals returned by instructions.
pub mod flow;
/// Instruction registration and lookup.
pub mod registry;
/// Dispatcher and per-request interpreter state.
pub mod dispatch;
/// Blocks, conditionals and iteration.
pub mod control;
/// Sub-program invocation.
pub mod invoke;
/// Leaf instructions (data, I/O and response glue).
pub mod leaf;

pub use context::{ExecutionContext, ScopeSnapshot};
pub use flow::{Flow, Reply};
pub use node::{ActionNode, Program};
pub use parser::parse_document;
pub use registry::{Children, InstructionCatalog, InstructionHandler, InstructionRegistry};
pub use dispatch::Interpreter;

use crate::runtime::services::ServiceError;
use thiserror::Error;

/// Convenience result alias for interpreter operations.
pub type Result<T> = std::result::Result<T, InterpreterError>;

/// Status for data-layer failures.
pub const STATUS_DATA: u16 = 401;
/// Status for privilege failures.
pub const STATUS_FORBIDDEN: u16 = 403;
/// Status for validation failures.
pub const STATUS_VALIDATION: u16 = 407;
/// Status for authentication failures.
pub const STATUS_AUTHENTICATION: u16 = 408;
/// Generic failure status (`failureMsg` blocks).
pub const STATUS_GENERIC: u16 = 409;
/// Status for malformed input.
pub const STATUS_MALFORMED: u16 = 410;
/// Status for a missing sub-program.
pub const STATUS_MISSING_PROGRAM: u16 = 400;
/// Status for configuration and internal failures.
pub const STATUS_INTERNAL: u16 = 500;

/// Errors surfaced while loading or executing programs.
#[derive(Debug, Error)]
pub enum InterpreterError {
    /// No handler is registered under the node's name.
    #[error("unknown instruction <{0}>")]
    UnknownInstruction(String),

    /// A referenced program does not exist.
    #[error("program '{0}' not found")]
    MissingProgram(String),

    /// Sub-program nesting exceeded the configured depth.
    #[error("call depth {depth} exceeds the limit of {limit}")]
    RecursionLimit {
        /// Depth that would have been reached.
        depth: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// Data error carrying the status reported to the client.
    #[error("{message}")]
    Data {
        /// Envelope status.
        status: u16,
        /// Client-facing message.
        message: String,
    },

    /// A program document could not be parsed.
    #[error("invalid program document: {0}")]
    Parse(String),

    /// A condition expression could not be evaluated.
    #[error("invalid expression: {0}")]
    Expression(String),

    /// An attribute is missing or has an unusable value.
    #[error("<{instruction}> attribute '{attribute}': {detail}")]
    Attribute {
        /// Instruction name.
        instruction: String,
        /// Attribute name.
        attribute: String,
        /// What is wrong with it.
        detail: String,
    },

    /// A collaborator (database, templates, privileges) failed.
    #[error("{0}")]
    Service(#[from] ServiceError),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// XML rendering failure.
    #[error("XML error: {0}")]
    Xml(String),
}

impl InterpreterError {
    /// Data error with an explicit status.
    pub fn data(status: u16, message: impl Into<String>) -> Self {
        InterpreterError::Data {
            status,
            message: message.into(),
        }
    }

    /// Missing or invalid attribute on a node.
    pub fn attribute(node: &ActionNode, attribute: &str, detail: impl Into<String>) -> Self {
        InterpreterError::Attribute {
            instruction: node.name.clone(),
            attribute: attribute.to_string(),
            detail: detail.into(),
        }
    }

    /// Fatal errors are never caught by blocks; they end the request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            InterpreterError::UnknownInstruction(_)
                | InterpreterError::RecursionLimit { .. }
                | InterpreterError::Parse(_)
        )
    }

    /// Envelope status reported for this error.
    pub fn status(&self) -> u16 {
        match self {
            InterpreterError::Data { status, .. } => *status,
            InterpreterError::Service(ServiceError::Unauthorized(_)) => STATUS_FORBIDDEN,
            InterpreterError::Service(_) => STATUS_DATA,
            InterpreterError::MissingProgram(_) => STATUS_MISSING_PROGRAM,
            InterpreterError::Json(_) => STATUS_MALFORMED,
            _ => STATUS_INTERNAL,
        }
    }

    /// Message shown to the client. Filesystem and rendering failures are not detailed.
    pub fn public_message(&self) -> String {
        match self {
            InterpreterError::Io(_) | InterpreterError::Xml(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Register every built-in instruction with a catalog.
pub fn register_builtins(catalog: &InstructionCatalog) {
    control::register(catalog);
    invoke::register(catalog);
    leaf::register(catalog);
}
