use serde_json::Value;

use crate::runtime::response::Envelope;

/// Result of executing one instruction (or a sequence of them).
///
/// Loop control and early termination travel as ordinary return values
/// rather than errors, so every enclosing construct can decide whether a
/// signal is addressed to it. Variants other than [`Flow::Next`] stop the
/// enclosing sequence immediately.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Normal fall-through: proceed with the next instruction.
    Next,
    /// Abandon the current loop element and proceed with the next one.
    Continue,
    /// Terminate the innermost enclosing loop.
    Break,
    /// Stop everything: the response has been produced elsewhere.
    Stop,
    /// This is the reply.
    Reply(Reply),
}

/// A value produced as the reply of a program.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Bare data; the assembler wraps containers into a status-200 envelope.
    Value(Value),
    /// A fully formed envelope (error replies, explicit statuses).
    Envelope(Envelope),
}

impl Flow {
    /// Reply with bare data.
    pub fn reply(value: Value) -> Self {
        Flow::Reply(Reply::Value(value))
    }

    /// Reply with an envelope.
    pub fn envelope(envelope: Envelope) -> Self {
        Flow::Reply(Reply::Envelope(envelope))
    }

    /// Whether execution of the enclosing sequence should continue.
    pub fn is_next(&self) -> bool {
        matches!(self, Flow::Next)
    }
}

impl Reply {
    /// JSON form of the reply, used when a caller captures a sub-result.
    pub fn to_value(&self) -> Value {
        match self {
            Reply::Value(value) => value.clone(),
            Reply::Envelope(envelope) => envelope.to_value(),
        }
    }
}
