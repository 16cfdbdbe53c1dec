//! Dispatcher and per-request interpreter state.

use std::sync::Arc;
use tracing::trace;

use super::value::text_truthy;
use super::{ActionNode, ExecutionContext, Flow, InterpreterError, Program, Result, expr};
use crate::runtime::response::ResponseSettings;
use crate::runtime::services::{HttpExchange, Services};
use crate::runtime::{Engine, EngineConfig};

/// Per-request interpreter state.
///
/// One interpreter exists per top-level request (and per sub-request in
/// batch mode). It dispatches nodes through the engine's instruction
/// registry and accumulates response settings produced by instructions.
pub struct Interpreter<'a> {
    engine: &'a Engine,
    exchange: &'a dyn HttpExchange,
    settings: ResponseSettings,
}

impl<'a> Interpreter<'a> {
    /// Create an interpreter for one request.
    pub fn new(engine: &'a Engine, exchange: &'a dyn HttpExchange) -> Self {
        Self {
            engine,
            exchange,
            settings: ResponseSettings::new(engine.config().default_format),
        }
    }

    /// Dispatch one node to its registered handler.
    pub fn execute(&mut self, node: &ActionNode, ctx: &mut ExecutionContext) -> Result<Flow> {
        let handler = self.engine.registry().handler(&node.name)?;
        trace!(instruction = %node.name, depth = ctx.call_depth(), "dispatch");
        handler(self, node, ctx)
    }

    /// Run nodes in order, returning the first result that is not
    /// [`Flow::Next`] unchanged. Interpreting it is the caller's job.
    pub fn execute_sequence(
        &mut self,
        nodes: &[ActionNode],
        ctx: &mut ExecutionContext,
    ) -> Result<Flow> {
        for node in nodes {
            let flow = self.execute(node, ctx)?;
            if !flow.is_next() {
                return Ok(flow);
            }
        }
        Ok(Flow::Next)
    }

    /// Run a whole program against a context.
    pub fn run_program(&mut self, program: &Program, ctx: &mut ExecutionContext) -> Result<Flow> {
        if ctx.eval_base().is_none() {
            ctx.replace_eval_base(Some(program.source_id.clone()));
        }
        self.execute_sequence(&program.nodes, ctx)
    }

    /// Load (or fetch from cache) a program by source id.
    pub fn load_program(&self, source_id: &str) -> Result<Arc<Program>> {
        self.engine.load_program(source_id)
    }

    /// Expand `{field}` references against the context.
    pub fn expand(&self, text: &str, ctx: &ExecutionContext) -> Result<String> {
        Ok(self.engine.services().templates.expand(text, ctx)?)
    }

    /// Attribute value with templates expanded.
    pub fn attr(
        &self,
        node: &ActionNode,
        name: &str,
        ctx: &ExecutionContext,
    ) -> Result<Option<String>> {
        node.attr(name)
            .map(|raw| self.expand(raw, ctx))
            .transpose()
    }

    /// Expanded attribute that must be present.
    pub fn required_attr(
        &self,
        node: &ActionNode,
        name: &str,
        ctx: &ExecutionContext,
    ) -> Result<String> {
        self.attr(node, name, ctx)?
            .ok_or_else(|| InterpreterError::attribute(node, name, "is required"))
    }

    /// Raw (unexpanded) attribute that must be present; used for field names.
    pub fn field_attr<'n>(&self, node: &'n ActionNode, name: &str) -> Result<&'n str> {
        node.attr(name)
            .filter(|value| !value.trim().is_empty())
            .map(str::trim)
            .ok_or_else(|| InterpreterError::attribute(node, name, "is required"))
    }

    /// Boolean flag attribute; absent means false.
    pub fn flag(&self, node: &ActionNode, name: &str, ctx: &ExecutionContext) -> Result<bool> {
        Ok(self
            .attr(node, name, ctx)?
            .map(|value| text_truthy(&value))
            .unwrap_or(false))
    }

    /// Integer attribute.
    pub fn int_attr(
        &self,
        node: &ActionNode,
        name: &str,
        ctx: &ExecutionContext,
    ) -> Result<Option<i64>> {
        match self.attr(node, name, ctx)? {
            None => Ok(None),
            Some(text) => {
                let text = text.trim();
                if let Ok(value) = text.parse::<i64>() {
                    return Ok(Some(value));
                }
                match text.parse::<f64>() {
                    Ok(value) if value.is_finite() => Ok(Some(value.trunc() as i64)),
                    _ => Err(InterpreterError::attribute(
                        node,
                        name,
                        format!("'{text}' is not a number"),
                    )),
                }
            }
        }
    }

    /// Evaluate a boolean expression attribute; absent means true.
    ///
    /// The raw attribute is evaluated, so references resolve to operands
    /// instead of being expanded into the expression text.
    pub fn condition(&self, node: &ActionNode, name: &str, ctx: &ExecutionContext) -> Result<bool> {
        match node.attr(name) {
            None => Ok(true),
            Some(source) => expr::evaluate(source, ctx),
        }
    }

    /// Text body with templates expanded; `None` when blank.
    pub fn text(&self, node: &ActionNode, ctx: &ExecutionContext) -> Result<Option<String>> {
        node.trimmed_text()
            .map(|text| self.expand(text, ctx))
            .transpose()
    }

    /// Engine collaborators.
    pub fn services(&self) -> &Services {
        self.engine.services()
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        self.engine.config()
    }

    /// Owning engine.
    pub fn engine(&self) -> &'a Engine {
        self.engine
    }

    /// Request side of the HTTP exchange.
    pub fn exchange(&self) -> &dyn HttpExchange {
        self.exchange
    }

    /// Response settings accumulated so far.
    pub fn settings(&self) -> &ResponseSettings {
        &self.settings
    }

    /// Mutable response settings.
    pub fn settings_mut(&mut self) -> &mut ResponseSettings {
        &mut self.settings
    }

    /// Finish the request, yielding the accumulated response settings.
    pub fn into_settings(self) -> ResponseSettings {
        self.settings
    }
}
