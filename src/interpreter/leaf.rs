//! Leaf instructions: context data, collaborator calls and response glue.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::{
    ActionNode, ExecutionContext, Flow, InstructionCatalog, Interpreter, InterpreterError,
    Result, STATUS_GENERIC,
};
use crate::runtime::cache::CachedResponse;
use crate::runtime::response::{CacheDirective, Envelope, Format};
use crate::runtime::services::ServiceError;

pub(crate) fn register(catalog: &InstructionCatalog) {
    catalog.register("set", set);
    catalog.register("unset", unset);
    catalog.register("push", push);
    catalog.register("break", |interp, node, ctx| signal(interp, node, ctx, Flow::Break));
    catalog.register("continue", |interp, node, ctx| {
        signal(interp, node, ctx, Flow::Continue)
    });
    catalog.register("stop", |interp, node, ctx| signal(interp, node, ctx, Flow::Stop));
    catalog.register("reply", reply);
    catalog.register("fail", fail);
    catalog.register("scalar", scalar);
    catalog.register("assoc", assoc);
    catalog.register("query", query);
    catalog.register("user", user);
    catalog.register("require", require);
    catalog.register("header", header);
    catalog.register("write", write);
    catalog.register("log", log);
    catalog.register("format", format);
    catalog.register("compress", compress);
    catalog.register("cache", cache);
    catalog.register("not-modified", not_modified);
}

/// Target path of a writing instruction, honouring `scope="form"`.
fn target_path(
    interp: &Interpreter<'_>,
    node: &ActionNode,
    ctx: &ExecutionContext,
) -> Result<String> {
    let field = interp.field_attr(node, "ref")?;
    let in_form = interp
        .attr(node, "scope", ctx)?
        .is_some_and(|scope| scope.trim() == "form");
    if in_form && !field.starts_with(super::context::FORM_PREFIX) {
        Ok(format!("{}{field}", super::context::FORM_PREFIX))
    } else {
        Ok(field.to_string())
    }
}

/// Literal carried by `value` or the text body, parsed as JSON when `json`
/// is truthy. `None` when the node carries neither.
fn literal(
    interp: &Interpreter<'_>,
    node: &ActionNode,
    ctx: &ExecutionContext,
) -> Result<Option<Value>> {
    let text = match interp.attr(node, "value", ctx)? {
        Some(value) => value,
        None => match interp.text(node, ctx)? {
            Some(text) => text,
            None => return Ok(None),
        },
    };
    if interp.flag(node, "json", ctx)? {
        Ok(Some(serde_json::from_str(&text)?))
    } else {
        Ok(Some(Value::String(text)))
    }
}

fn set(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let path = target_path(interp, node, ctx)?;
    let value = literal(interp, node, ctx)?.unwrap_or_else(|| Value::String(String::new()));
    ctx.set(&path, value);
    Ok(Flow::Next)
}

fn unset(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let path = target_path(interp, node, ctx)?;
    ctx.remove(&path);
    Ok(Flow::Next)
}

fn push(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let path = target_path(interp, node, ctx)?;
    let value = literal(interp, node, ctx)?.unwrap_or(Value::Null);
    if let Some(existing) = ctx.get_mut(&path) {
        match existing {
            Value::Array(items) => items.push(value),
            other => {
                let previous = other.take();
                *other = match previous {
                    Value::Null => Value::Array(vec![value]),
                    previous => Value::Array(vec![previous, value]),
                };
            }
        }
        return Ok(Flow::Next);
    }
    ctx.set(&path, Value::Array(vec![value]));
    Ok(Flow::Next)
}

fn signal(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
    flow: Flow,
) -> Result<Flow> {
    if interp.condition(node, "condition", ctx)? {
        Ok(flow)
    } else {
        Ok(Flow::Next)
    }
}

fn reply(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let payload = match node.attr("ref").map(str::trim).filter(|field| !field.is_empty()) {
        Some(field) => ctx.get(field).unwrap_or(Value::Null),
        None => literal(interp, node, ctx)?.unwrap_or(Value::Null),
    };
    match interp.int_attr(node, "status", ctx)? {
        None => Ok(Flow::reply(payload)),
        Some(status) => {
            let status = u16::try_from(status)
                .map_err(|_| InterpreterError::attribute(node, "status", "out of range"))?;
            let mut envelope = Envelope::ok(payload);
            envelope.status = status;
            envelope.message = interp.attr(node, "message", ctx)?;
            Ok(Flow::envelope(envelope))
        }
    }
}

fn fail(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let status = match interp.int_attr(node, "status", ctx)? {
        Some(status) => u16::try_from(status)
            .map_err(|_| InterpreterError::attribute(node, "status", "out of range"))?,
        None => STATUS_GENERIC,
    };
    let message = match interp.attr(node, "message", ctx)? {
        Some(message) => message,
        None => interp.text(node, ctx)?.unwrap_or_else(|| "request failed".to_string()),
    };
    Err(InterpreterError::data(status, message))
}

fn sql(interp: &Interpreter<'_>, node: &ActionNode, ctx: &ExecutionContext) -> Result<String> {
    match interp.attr(node, "sql", ctx)? {
        Some(sql) => Ok(sql),
        None => interp
            .text(node, ctx)?
            .ok_or_else(|| InterpreterError::attribute(node, "sql", "is required")),
    }
}

fn scalar(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let statement = sql(interp, node, ctx)?;
    let path = target_path(interp, node, ctx)?;
    let value = interp.services().database()?.exec_scalar(&statement)?;
    ctx.set(&path, value);
    Ok(Flow::Next)
}

fn assoc(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let statement = sql(interp, node, ctx)?;
    let path = target_path(interp, node, ctx)?;
    let row = interp.services().database()?.exec_assoc(&statement)?;
    ctx.set(&path, row.map(Value::Object).unwrap_or(Value::Null));
    Ok(Flow::Next)
}

fn query(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let statement = sql(interp, node, ctx)?;
    let path = target_path(interp, node, ctx)?;
    let rows = interp.services().database()?.exec_query(&statement)?;
    ctx.set(&path, Value::Array(rows.into_iter().map(Value::Object).collect()));
    Ok(Flow::Next)
}

fn user(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let path = target_path(interp, node, ctx)?;
    let record = interp.services().privileges.current_user();
    ctx.set(&path, record.map(Value::Object).unwrap_or(Value::Null));
    Ok(Flow::Next)
}

fn require(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let privilege = interp.required_attr(node, "privilege", ctx)?;
    if interp.services().privileges.has_privilege(&privilege) {
        Ok(Flow::Next)
    } else {
        Err(ServiceError::Unauthorized(format!("privilege '{privilege}' required")).into())
    }
}

fn header(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let line = match interp.attr(node, "line", ctx)? {
        Some(line) => line,
        None => interp
            .text(node, ctx)?
            .ok_or_else(|| InterpreterError::attribute(node, "line", "is required"))?,
    };
    interp.settings_mut().headers.push(line);
    Ok(Flow::Next)
}

fn write(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let text = match interp.attr(node, "value", ctx)? {
        Some(text) => text,
        None => node
            .text
            .as_deref()
            .map(|raw| interp.expand(raw, ctx))
            .transpose()?
            .unwrap_or_default(),
    };
    interp.settings_mut().raw_body.push_str(&text);
    Ok(Flow::Next)
}

fn log(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let message = match interp.attr(node, "message", ctx)? {
        Some(message) => message,
        None => interp.text(node, ctx)?.unwrap_or_default(),
    };
    let program = ctx.eval_base().unwrap_or_default();
    match node.attr("level").map(str::trim).unwrap_or("info") {
        "error" => error!(program, "{message}"),
        "warn" | "warning" => warn!(program, "{message}"),
        "debug" => debug!(program, "{message}"),
        "trace" => trace!(program, "{message}"),
        _ => info!(program, "{message}"),
    }
    Ok(Flow::Next)
}

fn format(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let kind = interp.attr(node, "type", ctx)?.unwrap_or_else(|| "json".to_string());
    let strict = match interp.attr(node, "strict", ctx)? {
        Some(value) => super::value::text_truthy(&value),
        None => true,
    };
    let format = match kind.trim().to_ascii_lowercase().as_str() {
        "json" => Format::Json,
        "xml" if strict => Format::Xml,
        "xml" => Format::XmlDebug,
        other => {
            return Err(InterpreterError::attribute(
                node,
                "type",
                format!("unsupported format '{other}'"),
            ));
        }
    };
    interp.settings_mut().format = format;
    Ok(Flow::Next)
}

fn compress(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let enabled = match interp.attr(node, "enabled", ctx)? {
        Some(value) => super::value::text_truthy(&value),
        None => true,
    };
    interp.settings_mut().compress = enabled;
    Ok(Flow::Next)
}

/// Resolve a `cache` node into its directive.
pub(crate) fn cache_directive(
    interp: &Interpreter<'_>,
    node: &ActionNode,
    ctx: &ExecutionContext,
) -> Result<CacheDirective> {
    let id = interp.required_attr(node, "id", ctx)?;
    let seconds = interp.int_attr(node, "expires", ctx)?.unwrap_or(0).max(0);
    Ok(CacheDirective {
        id,
        expires: Duration::from_secs(seconds.unsigned_abs()),
    })
}

/// Look the directive up in the response cache.
pub(crate) fn probe_cache(
    interp: &Interpreter<'_>,
    directive: &CacheDirective,
) -> Option<CachedResponse> {
    interp
        .engine()
        .response_cache()
        .probe(&directive.id, directive.expires)
}

fn cache(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    if interp.settings().batch {
        trace!("response caching disabled in batch mode");
        return Ok(Flow::Next);
    }
    let directive = cache_directive(interp, node, ctx)?;
    if let Some(hit) = probe_cache(interp, &directive) {
        debug!(id = %directive.id, "response cache hit");
        interp.settings_mut().replay = Some(hit);
        return Ok(Flow::Stop);
    }
    interp.settings_mut().cache = Some(directive);
    Ok(Flow::Next)
}

/// Parse a resource timestamp: unix seconds, RFC 2822 / HTTP date or RFC 3339.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(seconds) = text.parse::<i64>() {
        return Utc.timestamp_opt(seconds, 0).single();
    }
    DateTime::parse_from_rfc2822(text)
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Format a timestamp as an HTTP date.
fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn not_modified(
    interp: &mut Interpreter<'_>,
    node: &ActionNode,
    ctx: &mut ExecutionContext,
) -> Result<Flow> {
    let etag = interp.attr(node, "etag", ctx)?.filter(|tag| !tag.trim().is_empty());
    let timestamp = match interp.attr(node, "timestamp", ctx)? {
        Some(text) => Some(parse_timestamp(&text).ok_or_else(|| {
            InterpreterError::attribute(node, "timestamp", format!("'{text}' is not a timestamp"))
        })?),
        None => None,
    };

    let exchange = interp.exchange();
    let if_none_match = exchange.request_header("If-None-Match");
    let if_modified_since = exchange.request_header("If-Modified-Since");

    // A validator comparison takes precedence over the date comparison.
    let current = match (&etag, if_none_match, timestamp, if_modified_since) {
        (Some(etag), Some(header), _, _) => header.split(',').any(|candidate| {
            let candidate = candidate.trim();
            candidate == "*" || candidate.trim_start_matches("W/").trim_matches('"') == etag.trim()
        }),
        (_, _, Some(modified), Some(header)) => parse_timestamp(&header)
            .is_some_and(|client| client.timestamp() >= modified.timestamp()),
        _ => false,
    };

    let settings = interp.settings_mut();
    if current {
        debug!("client copy is current");
        settings.headers.push("HTTP/1.1 304 Not Modified".to_string());
        return Ok(Flow::Stop);
    }
    if let Some(etag) = etag {
        settings.headers.push(format!("ETag: \"{}\"", etag.trim()));
    }
    if let Some(modified) = timestamp {
        settings.headers.push(format!("Last-Modified: {}", http_date(modified)));
    }
    Ok(Flow::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::{InterpreterError, STATUS_FORBIDDEN};
    use crate::runtime::services::{BufferedExchange, Database, RowCursor, StaticPrivileges};
    use crate::runtime::{Engine, EngineConfig};
    use serde_json::{Map, json};

    struct FixedRows;

    impl Database for FixedRows {
        fn exec_scalar(&self, sql: &str) -> std::result::Result<Value, ServiceError> {
            if sql.contains("broken") {
                return Err(ServiceError::Database("syntax error".to_string()));
            }
            Ok(json!(3))
        }

        fn exec_assoc(
            &self,
            _sql: &str,
        ) -> std::result::Result<Option<Map<String, Value>>, ServiceError> {
            Ok(json!({"id": 1}).as_object().cloned())
        }

        fn exec_query(
            &self,
            _sql: &str,
        ) -> std::result::Result<Vec<Map<String, Value>>, ServiceError> {
            Ok(vec![Map::new(), Map::new()])
        }

        fn exec_reader(
            &self,
            _sql: &str,
        ) -> std::result::Result<Box<dyn RowCursor + '_>, ServiceError> {
            Ok(Box::new(Vec::<Map<String, Value>>::new().into_iter()))
        }
    }

    fn run_with(
        engine: &Engine,
        exchange: &BufferedExchange,
        nodes: Vec<ActionNode>,
        ctx: &mut ExecutionContext,
    ) -> Result<Flow> {
        engine.execute_nodes(&nodes, ctx, exchange)
    }

    fn run(nodes: Vec<ActionNode>, ctx: &mut ExecutionContext) -> Result<Flow> {
        let engine = Engine::new(EngineConfig::default());
        run_with(&engine, &BufferedExchange::default(), nodes, ctx)
    }

    #[test]
    fn set_variants() {
        let mut ctx = ExecutionContext::new();
        run(
            vec![
                ActionNode::new("set").with_attr("ref", "a").with_attr("value", "x"),
                ActionNode::new("set")
                    .with_attr("ref", "b")
                    .with_text("[1, 2]")
                    .with_attr("json", "1"),
                ActionNode::new("set")
                    .with_attr("ref", "c")
                    .with_attr("value", "in form")
                    .with_attr("scope", "form"),
                ActionNode::new("set").with_attr("ref", "nested.deep").with_attr("value", "{a}"),
            ],
            &mut ctx,
        )
        .unwrap();
        assert_eq!(ctx.get("a"), Some(json!("x")));
        assert_eq!(ctx.get("b"), Some(json!([1, 2])));
        assert_eq!(ctx.get("form.c"), Some(json!("in form")));
        assert_eq!(ctx.get("nested"), Some(json!({"deep": "x"})));
    }

    #[test]
    fn invalid_json_literal_is_malformed_input() {
        let mut ctx = ExecutionContext::new();
        let err = run(
            vec![
                ActionNode::new("set")
                    .with_attr("ref", "a")
                    .with_attr("value", "[1,")
                    .with_attr("json", "true"),
            ],
            &mut ctx,
        )
        .unwrap_err();
        assert_eq!(err.status(), 410);
    }

    #[test]
    fn push_creates_and_appends() {
        let mut ctx = ExecutionContext::new();
        ctx.set("single", json!("first"));
        run(
            vec![
                ActionNode::new("push").with_attr("ref", "list").with_attr("value", "1"),
                ActionNode::new("push").with_attr("ref", "list").with_attr("value", "2"),
                ActionNode::new("push").with_attr("ref", "single").with_attr("value", "second"),
                ActionNode::new("unset").with_attr("ref", "a"),
            ],
            &mut ctx,
        )
        .unwrap();
        assert_eq!(ctx.get("list"), Some(json!(["1", "2"])));
        assert_eq!(ctx.get("single"), Some(json!(["first", "second"])));
    }

    #[test]
    fn signals_honour_their_condition() {
        let mut ctx = ExecutionContext::new();
        let flow = run(
            vec![
                ActionNode::new("stop").with_attr("condition", "a == b"),
                ActionNode::new("break"),
            ],
            &mut ctx,
        )
        .unwrap();
        assert_eq!(flow, Flow::Break);
    }

    #[test]
    fn reply_from_field_and_with_status() {
        let mut ctx = ExecutionContext::new();
        ctx.set("rows", json!([1, 2]));
        let flow = run(vec![ActionNode::new("reply").with_attr("ref", "rows")], &mut ctx).unwrap();
        assert_eq!(flow, Flow::reply(json!([1, 2])));

        let flow = run(
            vec![
                ActionNode::new("reply")
                    .with_attr("status", "201")
                    .with_attr("message", "created")
                    .with_attr("ref", "rows"),
            ],
            &mut ctx,
        )
        .unwrap();
        let Flow::Reply(super::super::Reply::Envelope(envelope)) = flow else {
            panic!("expected envelope");
        };
        assert_eq!(envelope.status, 201);
        assert_eq!(envelope.message.as_deref(), Some("created"));
        assert_eq!(envelope.payload, json!([1, 2]));
    }

    #[test]
    fn fail_raises_data_error() {
        let mut ctx = ExecutionContext::new();
        let err = run(vec![ActionNode::new("fail").with_text("nope")], &mut ctx).unwrap_err();
        assert!(matches!(
            err,
            InterpreterError::Data { status: 409, ref message } if message == "nope"
        ));
    }

    #[test]
    fn database_calls_store_results() {
        let engine = Engine::new(EngineConfig::default()).with_database(FixedRows);
        let mut ctx = ExecutionContext::new();
        run_with(
            &engine,
            &BufferedExchange::default(),
            vec![
                ActionNode::new("scalar").with_attr("sql", "select count(*)").with_attr("ref", "n"),
                ActionNode::new("assoc").with_attr("sql", "select 1").with_attr("ref", "row"),
                ActionNode::new("query").with_text("select *").with_attr("ref", "rows"),
            ],
            &mut ctx,
        )
        .unwrap();
        assert_eq!(ctx.get("n"), Some(json!(3)));
        assert_eq!(ctx.get("row"), Some(json!({"id": 1})));
        assert_eq!(ctx.get("rows"), Some(json!([{}, {}])));

        let err = run_with(
            &engine,
            &BufferedExchange::default(),
            vec![ActionNode::new("scalar").with_attr("sql", "broken").with_attr("ref", "n")],
            &mut ctx,
        )
        .unwrap_err();
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn missing_database_is_a_data_error() {
        let mut ctx = ExecutionContext::new();
        let err = run(
            vec![ActionNode::new("scalar").with_attr("sql", "select 1").with_attr("ref", "n")],
            &mut ctx,
        )
        .unwrap_err();
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn require_and_user() {
        let privileges = StaticPrivileges::granting(["orders.read"])
            .with_user(json!({"login": "ada"}).as_object().cloned().unwrap_or_default());
        let engine = Engine::new(EngineConfig::default()).with_privileges(privileges);
        let mut ctx = ExecutionContext::new();
        run_with(
            &engine,
            &BufferedExchange::default(),
            vec![
                ActionNode::new("require").with_attr("privilege", "orders.read"),
                ActionNode::new("user").with_attr("ref", "me"),
            ],
            &mut ctx,
        )
        .unwrap();
        assert_eq!(ctx.get("me.login"), Some(json!("ada")));

        let err = run_with(
            &engine,
            &BufferedExchange::default(),
            vec![ActionNode::new("require").with_attr("privilege", "orders.write")],
            &mut ctx,
        )
        .unwrap_err();
        assert_eq!(err.status(), STATUS_FORBIDDEN);
    }

    #[test]
    fn not_modified_stops_when_client_copy_is_current() {
        let engine = Engine::new(EngineConfig::default());
        let exchange = BufferedExchange::default()
            .with_request_header("If-Modified-Since", "Sun, 06 Nov 1994 08:49:37 GMT");
        let mut ctx = ExecutionContext::new();
        // Resource last changed two hours before the client's copy.
        let flow = run_with(
            &engine,
            &exchange,
            vec![ActionNode::new("not-modified").with_attr("timestamp", "784104577")],
            &mut ctx,
        )
        .unwrap();
        assert_eq!(flow, Flow::Stop);
    }

    #[test]
    fn not_modified_continues_for_newer_resource() {
        let engine = Engine::new(EngineConfig::default());
        let exchange = BufferedExchange::default()
            .with_request_header("If-Modified-Since", "Sun, 06 Nov 1994 08:49:37 GMT")
            .with_request_header("If-None-Match", "\"old\"");
        let mut ctx = ExecutionContext::new();
        let flow = run_with(
            &engine,
            &exchange,
            vec![
                ActionNode::new("not-modified")
                    .with_attr("etag", "new")
                    .with_attr("timestamp", "784111777"),
            ],
            &mut ctx,
        )
        .unwrap();
        assert_eq!(flow, Flow::Next);
    }

    #[test]
    fn matching_etag_is_current() {
        let engine = Engine::new(EngineConfig::default());
        let exchange = BufferedExchange::default()
            .with_request_header("If-None-Match", "W/\"v2\", \"v1\"");
        let mut ctx = ExecutionContext::new();
        let flow = run_with(
            &engine,
            &exchange,
            vec![ActionNode::new("not-modified").with_attr("etag", "v1")],
            &mut ctx,
        )
        .unwrap();
        assert_eq!(flow, Flow::Stop);
    }

    #[test]
    fn timestamps_parse_in_several_forms() {
        let expected = Utc.timestamp_opt(784111777, 0).single();
        assert_eq!(parse_timestamp("784111777"), expected);
        assert_eq!(parse_timestamp("Sun, 06 Nov 1994 08:49:37 GMT"), expected);
        assert_eq!(parse_timestamp("1994-11-06T08:49:37Z"), expected);
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(
            expected.map(http_date).as_deref(),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
    }

    #[test]
    fn unknown_format_is_rejected() {
        let mut ctx = ExecutionContext::new();
        let err = run(
            vec![ActionNode::new("format").with_attr("type", "yaml")],
            &mut ctx,
        )
        .unwrap_err();
        assert!(matches!(err, InterpreterError::Attribute { .. }));
    }
}
