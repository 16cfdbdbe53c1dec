//! Instruction registry
//!
//! Provides a global catalog for registering instruction handlers before any
//! engine starts. Each engine clones an immutable snapshot of the catalog, so
//! registrations made afterwards never change a running engine's dispatch.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use super::{ActionNode, ExecutionContext, Flow, Interpreter, InterpreterError, Program, Result};

/// Handler invoked for every node carrying the registered name.
pub type InstructionHandler = Arc<
    dyn Fn(&mut Interpreter<'_>, &ActionNode, &mut ExecutionContext) -> Result<Flow> + Send + Sync,
>;

/// How an instruction uses its child nodes, for load-time validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Children {
    /// Children are instructions.
    Instructions,
    /// Children are branch declarations, named from the given set, whose own
    /// children are instructions.
    Branches(&'static [&'static str]),
    /// Children are declarations (parameters, data) and are not dispatched.
    Declarations,
}

#[derive(Clone)]
struct InstructionInfo {
    handler: InstructionHandler,
    children: Children,
}

/// Global catalog of instruction definitions.
pub struct InstructionCatalog {
    instructions: RwLock<HashMap<String, InstructionInfo>>,
}

static CATALOG: OnceLock<InstructionCatalog> = OnceLock::new();

impl InstructionCatalog {
    /// Empty catalog (no built-ins).
    pub fn new() -> Self {
        Self {
            instructions: RwLock::new(HashMap::new()),
        }
    }

    /// Catalog pre-populated with the built-in instructions.
    pub fn with_builtins() -> Self {
        let catalog = Self::new();
        super::register_builtins(&catalog);
        catalog
    }

    /// Access the global catalog singleton (built-ins registered on first use).
    pub fn global() -> &'static Self {
        CATALOG.get_or_init(Self::with_builtins)
    }

    /// Register a handler whose children are instructions.
    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(&mut Interpreter<'_>, &ActionNode, &mut ExecutionContext) -> Result<Flow>
            + Send
            + Sync
            + 'static,
    {
        self.register_with(name, Children::Instructions, handler);
    }

    /// Register a handler with an explicit child layout.
    pub fn register_with<F>(&self, name: &str, children: Children, handler: F)
    where
        F: Fn(&mut Interpreter<'_>, &ActionNode, &mut ExecutionContext) -> Result<Flow>
            + Send
            + Sync
            + 'static,
    {
        let mut instructions = self.instructions.write();
        instructions.insert(
            name.to_string(),
            InstructionInfo {
                handler: Arc::new(handler),
                children,
            },
        );
    }

    /// Produce an immutable snapshot for an engine.
    pub fn snapshot(&self) -> InstructionRegistry {
        let instructions = self.instructions.read();
        InstructionRegistry {
            instructions: Arc::new(instructions.clone()),
        }
    }
}

impl Default for InstructionCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable view of the catalog used for dispatch.
#[derive(Clone)]
pub struct InstructionRegistry {
    instructions: Arc<HashMap<String, InstructionInfo>>,
}

impl InstructionRegistry {
    /// Look up the handler for an instruction name.
    pub fn handler(&self, name: &str) -> Result<InstructionHandler> {
        self.instructions
            .get(name)
            .map(|info| info.handler.clone())
            .ok_or_else(|| InterpreterError::UnknownInstruction(name.to_string()))
    }

    /// Whether the snapshot knows the instruction.
    pub fn has_instruction(&self, name: &str) -> bool {
        self.instructions.contains_key(name)
    }

    /// Sorted instruction names.
    pub fn list_instructions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instructions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check that every dispatched node of a program names a registered
    /// instruction, so configuration errors surface at load time.
    pub fn validate(&self, program: &Program) -> Result<()> {
        self.validate_nodes(&program.nodes)
    }

    fn validate_nodes(&self, nodes: &[ActionNode]) -> Result<()> {
        for node in nodes {
            let info = self
                .instructions
                .get(&node.name)
                .ok_or_else(|| InterpreterError::UnknownInstruction(node.name.clone()))?;
            match info.children {
                Children::Instructions => self.validate_nodes(&node.children)?,
                Children::Branches(kinds) => {
                    for branch in &node.children {
                        if !kinds.contains(&branch.name.as_str()) {
                            return Err(InterpreterError::UnknownInstruction(format!(
                                "{}/{}",
                                node.name, branch.name
                            )));
                        }
                        self.validate_nodes(&branch.children)?;
                    }
                }
                Children::Declarations => {}
            }
        }
        Ok(())
    }
}
