//! Blocks, conditionals and iteration.
//!
//! Every loop shares one state machine: bind the element into the form, set
//! the index, run the body, then interpret the body's flow. `Break` is
//! absorbed by the innermost loop, `Continue` skips to the next element,
//! anything else that is not `Next` leaves the loop unchanged. The form and
//! index are restored on every exit path, errors included.

use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::value::text_truthy;
use super::{
    ActionNode, Children, ExecutionContext, Flow, InstructionCatalog, Interpreter,
    InterpreterError, Result, STATUS_GENERIC, ScopeSnapshot, expr,
};
use crate::runtime::response::Envelope;

/// Branch kinds a `switch` may declare.
pub(crate) const SWITCH_BRANCHES: &[&str] =
    &["true", "false", "number", "string", "expr", "match", "default"];

pub(crate) fn register(catalog: &InstructionCatalog) {
    catalog.register("block", block);
    catalog.register_with("switch", Children::Branches(SWITCH_BRANCHES), switch);
    catalog.register("loop", counted_or_conditional_loop);
    catalog.register("traverse", traverse);
    catalog.register("stack-loop", stack_loop);
    catalog.register("reader", reader);
}

/// Field name the loop binds elements to, if any.
fn bound_field(node: &ActionNode) -> Option<&str> {
    node.attr("field")
        .map(str::trim)
        .filter(|field| !field.is_empty())
}

/// What a loop does after one body execution.
enum Step {
    Proceed,
    Exit(Flow),
}

fn step(flow: Flow) -> Step {
    match flow {
        Flow::Next | Flow::Continue => Step::Proceed,
        Flow::Break => Step::Exit(Flow::Next),
        other => Step::Exit(other),
    }
}

/// Run `body` with the form and index restored afterwards, whatever happens.
fn scoped<F>(ctx: &mut ExecutionContext, body: F) -> Result<Flow>
where
    F: FnOnce(&mut ExecutionContext, &ScopeSnapshot) -> Result<Flow>,
{
    let saved = ctx.save_scope();
    let result = body(ctx, &saved);
    ctx.restore_scope(saved);
    result
}

/// Reset the form to its pre-loop state and bind the next element.
fn bind_element(
    ctx: &mut ExecutionContext,
    saved: &ScopeSnapshot,
    element: Value,
    field: Option<&str>,
    index: usize,
) {
    ctx.restore_scope(saved.clone());
    ctx.bind(element, field);
    ctx.set_index(Some(index));
}

fn block(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    if !interp.condition(node, "condition", ctx)? {
        return Ok(Flow::Next);
    }
    if let Some(required) = interp.attr(node, "requires", ctx)? {
        if !interp.services().privileges.has_privilege(&required) {
            return Ok(Flow::Next);
        }
    }
    if let Some(denied) = interp.attr(node, "not-requires", ctx)? {
        if interp.services().privileges.has_privilege(&denied) {
            return Ok(Flow::Next);
        }
    }

    match interp.execute_sequence(&node.children, ctx) {
        Ok(flow) => Ok(flow),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => recover(interp, node, ctx, err),
    }
}

fn recover(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
    err: InterpreterError,
) -> Result<Flow> {
    if interp.flag(node, "inhibit", ctx)? {
        let field = node
            .attr("ref")
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .unwrap_or("error");
        warn!(error = %err, field, "block inhibited error");
        ctx.set(
            field,
            json!({ "status": err.status(), "message": err.public_message() }),
        );
        return Ok(Flow::Next);
    }
    if let Some(message) = interp.attr(node, "failureMsg", ctx)? {
        debug!(error = %err, "block replaced error with failure message");
        return Ok(Flow::envelope(Envelope::error(STATUS_GENERIC, message)));
    }
    Err(err)
}

fn switch(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let subject = interp.attr(node, "subject", ctx)?.unwrap_or_default();
    for branch in &node.children {
        if branch_matches(interp, branch, &subject, ctx)? {
            return interp.execute_sequence(&branch.children, ctx);
        }
    }
    Ok(Flow::Next)
}

fn branch_matches(
    interp: &Interpreter<'_>,
    branch: &ActionNode,
    subject: &str,
    ctx: &ExecutionContext,
) -> Result<bool> {
    match branch.name.as_str() {
        "true" => Ok(text_truthy(subject)),
        "false" => Ok(!text_truthy(subject)),
        "number" => {
            let expected = interp.required_attr(branch, "value", ctx)?;
            Ok(
                match (subject.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
                    (Ok(actual), Ok(expected)) => actual == expected,
                    _ => false,
                },
            )
        }
        "string" => Ok(interp.attr(branch, "value", ctx)?.unwrap_or_default() == subject),
        "expr" => match branch.attr("test").filter(|test| !test.trim().is_empty()) {
            Some(test) => expr::evaluate(test, ctx),
            None => Err(InterpreterError::attribute(branch, "test", "is required")),
        },
        "match" => {
            let pattern = interp.required_attr(branch, "pattern", ctx)?;
            let regex = Regex::new(&pattern)
                .map_err(|err| InterpreterError::attribute(branch, "pattern", err.to_string()))?;
            Ok(regex.is_match(subject))
        }
        "default" => Ok(true),
        other => Err(InterpreterError::UnknownInstruction(format!("switch/{other}"))),
    }
}

fn counted_or_conditional_loop(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    if node.has_attr("to") || node.has_attr("count") {
        counted_loop(interp, node, ctx)
    } else if node.has_attr("condition") {
        conditional_loop(interp, node, ctx)
    } else {
        Err(InterpreterError::attribute(
            node,
            "condition",
            "a loop needs `to`, `count` or `condition`",
        ))
    }
}

fn counted_loop(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let from = interp.int_attr(node, "from", ctx)?.unwrap_or(0);
    let to = match interp.int_attr(node, "to", ctx)? {
        Some(to) => to,
        None => from
            .checked_add(interp.int_attr(node, "count", ctx)?.unwrap_or(0))
            .ok_or_else(|| InterpreterError::attribute(node, "count", "overflows the counter"))?,
    };
    let stride = interp.int_attr(node, "step", ctx)?.unwrap_or(1);
    if stride == 0 {
        return Err(InterpreterError::attribute(node, "step", "must not be zero"));
    }
    let field = bound_field(node);

    scoped(ctx, |ctx, _| {
        let mut counter = from;
        let mut position = 0;
        while (stride > 0 && counter < to) || (stride < 0 && counter > to) {
            if let Some(field) = field {
                ctx.bind(Value::from(counter), Some(field));
            }
            ctx.set_index(Some(position));
            if let Step::Exit(flow) = step(interp.execute_sequence(&node.children, ctx)?) {
                return Ok(flow);
            }
            // The counter cannot step past the integer range, so the loop ends.
            let Some(next) = counter.checked_add(stride) else {
                break;
            };
            counter = next;
            position += 1;
        }
        Ok(Flow::Next)
    })
}

fn conditional_loop(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    scoped(ctx, |ctx, _| {
        let mut position = 0;
        while interp.condition(node, "condition", ctx)? {
            ctx.set_index(Some(position));
            if let Step::Exit(flow) = step(interp.execute_sequence(&node.children, ctx)?) {
                return Ok(flow);
            }
            position += 1;
        }
        Ok(Flow::Next)
    })
}

fn traverse(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let source = interp.required_attr(node, "source", ctx)?;
    let reversed = interp.flag(node, "reversed", ctx)?;
    let updates: Vec<String> = interp
        .attr(node, "update", ctx)?
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let field = bound_field(node);

    let mut items = match ctx.get(&source) {
        Some(Value::Array(items)) => items,
        None | Some(Value::Null) => Vec::new(),
        Some(_) => {
            return Err(InterpreterError::attribute(
                node,
                "source",
                format!("'{source}' is not a list"),
            ));
        }
    };
    let order: Vec<usize> = if reversed {
        (0..items.len()).rev().collect()
    } else {
        (0..items.len()).collect()
    };

    let result = scoped(ctx, |ctx, saved| {
        for &position in &order {
            bind_element(ctx, saved, items[position].clone(), field, position);
            let flow = interp.execute_sequence(&node.children, ctx)?;
            if !updates.is_empty() {
                write_back(ctx, &mut items[position], field, &updates);
            }
            if let Step::Exit(flow) = step(flow) {
                return Ok(flow);
            }
        }
        Ok(Flow::Next)
    });

    if !updates.is_empty() {
        ctx.set(&source, Value::Array(items));
    }
    result
}

/// Copy the named form fields back into the source element.
fn write_back(
    ctx: &ExecutionContext,
    element: &mut Value,
    field: Option<&str>,
    updates: &[String],
) {
    for name in updates {
        let path = match field {
            Some(field) => format!("form.{field}.{name}"),
            None => format!("form.{name}"),
        };
        let Some(updated) = ctx.get(&path) else {
            continue;
        };
        match &mut *element {
            Value::Object(map) => {
                map.insert(name.clone(), updated);
            }
            scalar if name == "value" => *scalar = updated,
            _ => {}
        }
    }
}

fn stack_loop(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let source = interp.required_attr(node, "source", ctx)?;
    if source == "form" || source.starts_with(super::context::FORM_PREFIX) {
        return Err(InterpreterError::attribute(
            node,
            "source",
            "a stack must live outside the form record",
        ));
    }
    let field = bound_field(node);

    scoped(ctx, |ctx, saved| {
        let mut position = 0;
        loop {
            let element = match ctx.get_mut(&source) {
                Some(Value::Array(items)) => items.pop(),
                _ => None,
            };
            let Some(element) = element else {
                break;
            };
            bind_element(ctx, saved, element, field, position);
            if let Step::Exit(flow) = step(interp.execute_sequence(&node.children, ctx)?) {
                return Ok(flow);
            }
            position += 1;
        }
        Ok(Flow::Next)
    })
}

fn reader(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let sql = match interp.attr(node, "sql", ctx)? {
        Some(sql) => sql,
        None => interp
            .text(node, ctx)?
            .ok_or_else(|| InterpreterError::attribute(node, "sql", "is required"))?,
    };
    let database = interp.services().database()?;
    let mut cursor = database.exec_reader(&sql)?;
    let field = bound_field(node);

    scoped(ctx, |ctx, saved| {
        let mut position = 0;
        while let Some(row) = cursor.next_row()? {
            bind_element(ctx, saved, Value::Object(row), field, position);
            if let Step::Exit(flow) = step(interp.execute_sequence(&node.children, ctx)?) {
                return Ok(flow);
            }
            position += 1;
        }
        Ok(Flow::Next)
    })
}
