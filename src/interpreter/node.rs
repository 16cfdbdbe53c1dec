use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// One instruction in an action program.
///
/// Nodes are immutable once loaded; all mutation during execution happens in
/// the [`ExecutionContext`](super::ExecutionContext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionNode {
    /// Instruction name used for dispatch.
    pub name: String,
    /// Attributes in document order.
    pub attributes: Vec<(String, String)>,
    /// Child instructions (or branch/param declarations, depending on the instruction).
    pub children: Vec<ActionNode>,
    /// Literal text content, if any.
    pub text: Option<String>,
}

impl ActionNode {
    /// Construct a bare node with the given instruction name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            text: None,
        }
    }

    /// Builder-style attribute setter. Later values replace earlier ones.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
        self
    }

    /// Builder-style child append.
    pub fn with_child(mut self, child: ActionNode) -> Self {
        self.children.push(child);
        self
    }

    /// Builder-style text setter.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Raw attribute value.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the attribute is present at all.
    pub fn has_attr(&self, key: &str) -> bool {
        self.attr(key).is_some()
    }

    /// Text content with surrounding whitespace removed; `None` when blank.
    pub fn trimmed_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

/// A parsed program: the ordered top-level nodes of one source document.
#[derive(Debug, Clone)]
pub struct Program {
    /// Identifier the program was loaded under.
    pub source_id: String,
    /// Top-level instructions.
    pub nodes: Vec<ActionNode>,
    /// Modification time of the source when it was parsed.
    pub modified: SystemTime,
    /// Wall-clock time the program was parsed.
    pub loaded_at: DateTime<Utc>,
}

impl Program {
    /// Construct a program loaded now.
    pub fn new(source_id: impl Into<String>, nodes: Vec<ActionNode>, modified: SystemTime) -> Self {
        Self {
            source_id: source_id.into(),
            nodes,
            modified,
            loaded_at: Utc::now(),
        }
    }
}
