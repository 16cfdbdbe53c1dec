//! Sub-program invocation: `evaluate` and `call`.

use serde_json::{Map, Value};
use tracing::debug;

use super::{
    ActionNode, Children, ExecutionContext, Flow, InstructionCatalog, Interpreter,
    InterpreterError, Result, STATUS_MISSING_PROGRAM,
};
use crate::runtime::loader::resolve_reference;
use crate::runtime::response::Envelope;

pub(crate) fn register(catalog: &InstructionCatalog) {
    catalog.register_with("evaluate", Children::Declarations, evaluate);
    catalog.register_with("call", Children::Declarations, call);
}

/// Resolve and load the program named by `src`.
///
/// `Ok(None)` means the program does not exist and the node asked for that
/// to be ignored; otherwise a missing program becomes a 400 reply.
fn target(
    interp: &Interpreter<'_>,
    node: &ActionNode,
    ctx: &ExecutionContext,
) -> Result<std::result::Result<std::sync::Arc<super::Program>, Flow>> {
    let src = interp.required_attr(node, "src", ctx)?;
    let id = resolve_reference(ctx.eval_base(), &src);
    match interp.load_program(&id) {
        Ok(program) => Ok(Ok(program)),
        Err(InterpreterError::MissingProgram(missing)) => {
            if interp.flag(node, "inhibit", ctx)? {
                debug!(program = %missing, "missing sub-program ignored");
                Ok(Err(Flow::Next))
            } else {
                Ok(Err(Flow::envelope(Envelope::error(
                    STATUS_MISSING_PROGRAM,
                    format!("program '{missing}' not found"),
                ))))
            }
        }
        Err(err) => Err(err),
    }
}

/// Run a program against the caller's own context.
fn run_shared(
    interp: &mut Interpreter<'_>,
    program: &super::Program,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    ctx.enter_call(interp.config().max_call_depth)?;
    let previous = ctx.replace_eval_base(Some(program.source_id.clone()));
    let result = interp.execute_sequence(&program.nodes, ctx);
    ctx.replace_eval_base(previous);
    ctx.leave_call();
    result
}

fn evaluate(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let program = match target(interp, node, ctx)? {
        Ok(program) => program,
        Err(flow) => return Ok(flow),
    };
    run_shared(interp, &program, ctx)
}

fn call(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let program = match target(interp, node, ctx)? {
        Ok(program) => program,
        Err(flow) => return Ok(flow),
    };
    let pass_control = match interp.attr(node, "passControl", ctx)? {
        Some(value) => super::value::text_truthy(&value),
        None => true,
    };

    let flow = if interp.flag(node, "shared", ctx)? {
        run_shared(interp, &program, ctx)?
    } else {
        run_isolated(interp, node, &program, ctx)?
    };

    match flow {
        Flow::Reply(reply) if !pass_control => {
            let field = node
                .attr("ref")
                .map(str::trim)
                .filter(|field| !field.is_empty())
                .unwrap_or("result");
            ctx.set(field, reply.to_value());
            Ok(Flow::Next)
        }
        Flow::Break | Flow::Continue => {
            debug!(program = %program.source_id, "loop signal did not cross the call boundary");
            Ok(Flow::Next)
        }
        other => Ok(other),
    }
}

fn run_isolated(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    program: &super::Program,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let params = call_params(interp, node, ctx)?;
    let mut child = ctx.isolated_child(params, program.source_id.clone());
    child.enter_call(interp.config().max_call_depth)?;
    let result = interp.execute_sequence(&program.nodes, &mut child);
    // Exports are copied even when the sub-program replied.
    let marker = interp.config().export_marker.clone();
    let exported = child.export_into(ctx, &marker);
    debug!(program = %program.source_id, exported, "isolated call finished");
    result
}

/// Build the child's form from `param` declarations and `pass`-listed fields.
fn call_params(
    interp: &Interpreter<'_>,
    node: &ActionNode,
    ctx: &ExecutionContext,
) -> Result<Map<String, Value>> {
    let mut params = Map::new();
    if let Some(pass) = interp.attr(node, "pass", ctx)? {
        for name in pass.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            if let Some(value) = ctx.form().get(name) {
                params.insert(name.to_string(), value.clone());
            }
        }
    }
    for param in node.children.iter().filter(|child| child.name == "param") {
        let name = interp.field_attr(param, "name")?;
        let value = match interp.attr(param, "value", ctx)? {
            Some(value) => value,
            None => interp.text(param, ctx)?.unwrap_or_default(),
        };
        params.insert(name.to_string(), Value::String(value));
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::loader::MemoryProgramSource;
    use crate::runtime::services::BufferedExchange;
    use crate::runtime::{Engine, EngineConfig};
    use serde_json::json;

    fn engine(programs: &[(&str, Vec<ActionNode>)]) -> Engine {
        let source = MemoryProgramSource::new();
        for (id, nodes) in programs {
            source.insert(*id, nodes.clone());
        }
        Engine::new(EngineConfig::default()).with_source(source)
    }

    fn run(engine: &Engine, nodes: Vec<ActionNode>, ctx: &mut ExecutionContext) -> Result<Flow> {
        let exchange = BufferedExchange::default();
        engine.execute_nodes(&nodes, ctx, &exchange)
    }

    fn set(field: &str, value: &str) -> ActionNode {
        ActionNode::new("set").with_attr("ref", field).with_attr("value", value)
    }

    #[test]
    fn evaluate_shares_the_callers_context() {
        let engine = engine(&[("lib/helper", vec![set("touched", "{form.who}")])]);
        let mut ctx = ExecutionContext::new();
        ctx.set("form.who", json!("caller"));
        ctx.replace_eval_base(Some("main".to_string()));
        let nodes = vec![ActionNode::new("evaluate").with_attr("src", "lib/helper")];
        assert_eq!(run(&engine, nodes, &mut ctx).unwrap(), Flow::Next);
        assert_eq!(ctx.get("touched"), Some(json!("caller")));
        assert_eq!(ctx.eval_base(), Some("main"));
        assert_eq!(ctx.call_depth(), 0);
    }

    #[test]
    fn relative_references_resolve_against_the_running_program() {
        let engine = engine(&[
            ("app/outer", vec![ActionNode::new("evaluate").with_attr("src", "inner")]),
            ("app/inner", vec![set("base", "inner ran")]),
        ]);
        let mut ctx = ExecutionContext::new();
        let nodes = vec![ActionNode::new("evaluate").with_attr("src", "/app/outer")];
        run(&engine, nodes, &mut ctx).unwrap();
        assert_eq!(ctx.get("base"), Some(json!("inner ran")));
    }

    #[test]
    fn isolated_call_only_exports_marked_fields() {
        let engine = engine(&[(
            "child",
            vec![
                set("@total", "{amount}"),
                set("scratch", "private"),
                set("form.amount", "changed"),
            ],
        )]);
        let mut ctx = ExecutionContext::new();
        ctx.set("form.amount", json!("10"));
        let nodes = vec![
            ActionNode::new("call")
                .with_attr("src", "child")
                .with_attr("pass", "amount"),
        ];
        run(&engine, nodes, &mut ctx).unwrap();
        assert_eq!(ctx.get("total"), Some(json!("10")));
        assert_eq!(ctx.get("scratch"), None);
        assert_eq!(ctx.get("@total"), None);
        assert_eq!(ctx.get("form.amount"), Some(json!("10")));
    }

    #[test]
    fn call_params_come_from_declarations() {
        let engine = engine(&[(
            "greet",
            vec![ActionNode::new("reply").with_attr("value", "hi {name} {title}")],
        )]);
        let mut ctx = ExecutionContext::new();
        ctx.set("form.user", json!("ada"));
        let nodes = vec![
            ActionNode::new("call")
                .with_attr("src", "greet")
                .with_child(
                    ActionNode::new("param")
                        .with_attr("name", "name")
                        .with_attr("value", "{user}"),
                )
                .with_child(
                    ActionNode::new("param")
                        .with_attr("name", "title")
                        .with_text(" dr "),
                ),
        ];
        let flow = run(&engine, nodes, &mut ctx).unwrap();
        assert_eq!(flow, Flow::reply(json!("hi ada dr")));
    }

    #[test]
    fn captured_reply_lands_in_ref_and_execution_continues() {
        let engine = engine(&[(
            "compute",
            vec![
                ActionNode::new("reply")
                    .with_attr("value", "{\"n\": 7}")
                    .with_attr("json", "true"),
            ],
        )]);
        let mut ctx = ExecutionContext::new();
        let nodes = vec![
            ActionNode::new("call")
                .with_attr("src", "compute")
                .with_attr("passControl", "false")
                .with_attr("ref", "computed"),
            set("after", "1"),
        ];
        assert_eq!(run(&engine, nodes, &mut ctx).unwrap(), Flow::Next);
        assert_eq!(ctx.get("computed"), Some(json!({"n": 7})));
        assert_eq!(ctx.get("after"), Some(json!("1")));
    }

    #[test]
    fn captured_envelope_uses_its_json_form() {
        let engine = engine(&[(
            "denied",
            vec![ActionNode::new("reply").with_attr("status", "403").with_attr("value", "no")],
        )]);
        let mut ctx = ExecutionContext::new();
        let nodes = vec![
            ActionNode::new("call")
                .with_attr("src", "denied")
                .with_attr("passControl", "0"),
        ];
        run(&engine, nodes, &mut ctx).unwrap();
        let result = ctx.get("result").unwrap_or_default();
        assert_eq!(result["status"], json!(403));
    }

    #[test]
    fn stop_propagates_even_when_control_is_kept() {
        let engine = engine(&[("halt", vec![ActionNode::new("stop")])]);
        let mut ctx = ExecutionContext::new();
        let nodes = vec![
            ActionNode::new("call")
                .with_attr("src", "halt")
                .with_attr("passControl", "false"),
            set("after", "1"),
        ];
        assert_eq!(run(&engine, nodes, &mut ctx).unwrap(), Flow::Stop);
        assert_eq!(ctx.get("after"), None);
    }

    #[test]
    fn missing_program_replies_400_or_is_ignored() {
        let engine = engine(&[]);
        let mut ctx = ExecutionContext::new();
        let flow = run(
            &engine,
            vec![ActionNode::new("call").with_attr("src", "ghost")],
            &mut ctx,
        )
        .unwrap();
        match flow {
            Flow::Reply(super::super::Reply::Envelope(envelope)) => {
                assert_eq!(envelope.status, 400)
            }
            other => panic!("unexpected flow {other:?}"),
        }

        let flow = run(
            &engine,
            vec![
                ActionNode::new("evaluate")
                    .with_attr("src", "ghost")
                    .with_attr("inhibit", "yes"),
            ],
            &mut ctx,
        )
        .unwrap();
        assert_eq!(flow, Flow::Next);
    }

    #[test]
    fn self_recursion_hits_the_depth_limit() {
        let engine = engine(&[(
            "loop",
            vec![ActionNode::new("evaluate").with_attr("src", "loop")],
        )]);
        let mut ctx = ExecutionContext::new();
        let nodes = vec![ActionNode::new("call").with_attr("src", "loop")];
        let err = run(&engine, nodes, &mut ctx).unwrap_err();
        assert!(matches!(err, InterpreterError::RecursionLimit { limit: 32, .. }));
        assert_eq!(ctx.call_depth(), 0);
    }
}
