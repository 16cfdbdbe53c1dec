//! Engine and public API
//!
//! The [`Engine`] owns everything shared between requests: configuration,
//! the instruction registry snapshot, the program cache, the response cache
//! and the collaborator services. Each request gets its own
//! [`Interpreter`](crate::interpreter::Interpreter) and
//! [`ExecutionContext`](crate::interpreter::ExecutionContext).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

pub mod cache;
pub mod loader;
pub mod response;
pub mod services;
pub mod storage;

use crate::interpreter::{
    ActionNode, ExecutionContext, Flow, InstructionCatalog, InstructionRegistry, Interpreter,
    Program, Result, leaf,
};
use cache::{CachedResponse, ResponseCache};
use loader::{FileProgramSource, ProgramCache, ProgramSource};
use response::{Envelope, Format, Outcome, Response, ResponseSettings};
use services::{Database, HttpExchange, PrivilegeService, Services, TemplateEngine};
use storage::Storage;

/// Configuration for an engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory holding `programs/`, `cache/` and `config.json`
    /// (default: .actionflow/)
    pub root: PathBuf,

    /// Maximum nesting of `evaluate`/`call`
    pub max_call_depth: usize,

    /// Prefix marking fields an isolated call exports to its caller
    pub export_marker: String,

    /// Serialization used unless a program selects another
    pub default_format: Format,

    /// Report full error text in error envelopes
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".actionflow"),
            max_call_depth: 32,
            export_marker: "@".to_string(),
            default_format: Format::Json,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Configuration rooted at `root`, defaults otherwise.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Directory program documents are loaded from.
    pub fn program_root(&self) -> PathBuf {
        Storage::new(self.root.clone()).programs_dir()
    }

    /// Directory cached responses are stored in.
    pub fn cache_root(&self) -> PathBuf {
        Storage::new(self.root.clone()).cache_dir()
    }
}

/// One entry of a batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRequest {
    /// Program id.
    pub program: String,
    /// Request parameters (become the form record).
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl SubRequest {
    /// Sub-request for a program.
    pub fn new(program: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            program: program.into(),
            params,
        }
    }
}

/// The action-program engine
pub struct Engine {
    config: EngineConfig,
    registry: InstructionRegistry,
    programs: Arc<ProgramCache>,
    source: Arc<dyn ProgramSource>,
    services: Services,
    response_cache: ResponseCache,
}

impl Engine {
    /// Create an engine reading programs from the configured root
    pub fn new(config: EngineConfig) -> Self {
        Self {
            registry: InstructionCatalog::global().snapshot(),
            programs: Arc::new(ProgramCache::new()),
            source: Arc::new(FileProgramSource::new(config.program_root())),
            services: Services::default(),
            response_cache: ResponseCache::new(config.cache_root()),
            config,
        }
    }

    /// Initialize engine storage directories and configuration
    pub fn init(config: &EngineConfig) -> anyhow::Result<()> {
        storage::init_storage(&config.root)?;
        storage::write_config(config)?;
        Ok(())
    }

    /// Load an engine from an initialized root
    pub fn load(root: PathBuf) -> anyhow::Result<Self> {
        let config = storage::load_config(&root)?;
        Ok(Self::new(config))
    }

    /// Replace the program source.
    pub fn with_source(mut self, source: impl ProgramSource + 'static) -> Self {
        self.source = Arc::new(source);
        self
    }

    /// Use a database.
    pub fn with_database(mut self, database: impl Database + 'static) -> Self {
        self.services.database = Some(Arc::new(database));
        self
    }

    /// Replace the privilege service.
    pub fn with_privileges(mut self, privileges: impl PrivilegeService + 'static) -> Self {
        self.services.privileges = Arc::new(privileges);
        self
    }

    /// Replace the template engine.
    pub fn with_templates(mut self, templates: impl TemplateEngine + 'static) -> Self {
        self.services.templates = Arc::new(templates);
        self
    }

    /// Dispatch through a specific registry snapshot.
    pub fn with_registry(mut self, registry: InstructionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Share a program cache with other engines.
    pub fn with_program_cache(mut self, programs: Arc<ProgramCache>) -> Self {
        self.programs = programs;
        self
    }

    /// Get the current configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registry snapshot used for dispatch.
    pub fn registry(&self) -> &InstructionRegistry {
        &self.registry
    }

    /// Collaborators.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Program cache.
    pub fn programs(&self) -> &ProgramCache {
        &self.programs
    }

    /// Response cache.
    pub fn response_cache(&self) -> &ResponseCache {
        &self.response_cache
    }

    /// Load a program through the cache, validating fresh parses.
    pub fn load_program(&self, id: &str) -> Result<Arc<Program>> {
        self.programs
            .get(self.source.as_ref(), id, |program| self.registry.validate(program))
    }

    /// Run ad-hoc nodes against a caller-supplied context.
    pub fn execute_nodes(
        &self,
        nodes: &[ActionNode],
        ctx: &mut ExecutionContext,
        exchange: &dyn HttpExchange,
    ) -> Result<Flow> {
        let mut interp = Interpreter::new(self, exchange);
        interp.execute_sequence(nodes, ctx)
    }

    /// Run a program and assemble its response without writing it.
    ///
    /// Errors never escape: they become error envelopes.
    pub fn run(
        &self,
        program: &str,
        params: Map<String, Value>,
        exchange: &dyn HttpExchange,
    ) -> Response {
        self.run_request(program, params, exchange, false)
    }

    fn run_request(
        &self,
        program: &str,
        params: Map<String, Value>,
        exchange: &dyn HttpExchange,
        batch: bool,
    ) -> Response {
        let request_id = Uuid::new_v4();
        let span = info_span!("request", %request_id, program);
        let _guard = span.enter();
        info!(batch, "handling request");

        let mut interp = Interpreter::new(self, exchange);
        interp.settings_mut().batch = batch;
        let mut ctx = ExecutionContext::with_params(params);
        let result = self.execute_program(&mut interp, program, &mut ctx);
        let settings = interp.into_settings();

        match result {
            Ok(flow) => Response::assemble(flow, settings),
            Err(err) => {
                error!(error = %err, status = err.status(), "request failed");
                Response::failure(&err, settings, self.config.debug)
            }
        }
    }

    fn execute_program(
        &self,
        interp: &mut Interpreter<'_>,
        id: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<Flow> {
        let program = self.load_program(id)?;
        ctx.replace_eval_base(Some(program.source_id.clone()));

        // A leading cache node is handled here, before anything is dispatched.
        if !interp.settings().batch {
            let leading = program
                .nodes
                .split_first()
                .filter(|(first, _)| first.name == "cache");
            if let Some((first, rest)) = leading {
                let directive = leaf::cache_directive(interp, first, ctx)?;
                if let Some(hit) = leaf::probe_cache(interp, &directive) {
                    debug!(id = %directive.id, "replaying cached response");
                    interp.settings_mut().replay = Some(hit);
                    return Ok(Flow::Stop);
                }
                interp.settings_mut().cache = Some(directive);
                return interp.execute_sequence(rest, ctx);
            }
        }

        interp.run_program(&program, ctx)
    }

    /// Write a response: store it in the response cache when requested,
    /// compress when permitted, then send headers and body.
    pub fn respond(&self, response: Response, exchange: &mut dyn HttpExchange) -> Result<()> {
        let rendered = match response.render() {
            Ok(rendered) => rendered,
            Err(err) => {
                error!(error = %err, "rendering failed");
                Response::failure(&err, ResponseSettings::new(Format::Json), self.config.debug)
                    .render()?
            }
        };

        let cacheable = match &response.outcome {
            Outcome::Envelope(envelope) => envelope.status == 200,
            Outcome::Text(_) => true,
            Outcome::Silent | Outcome::Cached(_) => false,
        };
        if let Some(directive) = response.settings.cache.as_ref().filter(|_| cacheable) {
            if !response.settings.batch {
                let entry = CachedResponse {
                    headers: rendered.headers.clone(),
                    body: rendered.body.clone(),
                    compress: response.settings.compress,
                };
                if let Err(err) = self.response_cache.store(&directive.id, &entry) {
                    warn!(id = %directive.id, error = %err, "failed to store cached response");
                }
            }
        }

        let rendered = if response.compressible() {
            rendered.encode(exchange)?
        } else {
            rendered
        };
        rendered.write_to(exchange);
        Ok(())
    }

    /// Run a program and write its response.
    pub fn handle(
        &self,
        program: &str,
        params: Map<String, Value>,
        exchange: &mut dyn HttpExchange,
    ) -> Result<()> {
        let response = self.run(program, params, exchange);
        self.respond(response, exchange)
    }

    /// Run several programs, each against an independent context, and
    /// collect their envelopes into one keyed map.
    ///
    /// Response caching is disabled for sub-requests; their queued headers
    /// and raw output are discarded.
    pub fn run_batch<I>(&self, requests: I, exchange: &dyn HttpExchange) -> Response
    where
        I: IntoIterator<Item = (String, SubRequest)>,
    {
        let batch_id = Uuid::new_v4();
        let span = info_span!("batch", %batch_id);
        let _guard = span.enter();

        let mut results = Map::new();
        for (key, request) in requests {
            let response = self.run_request(&request.program, request.params, exchange, true);
            results.insert(key, response.outcome.into_envelope().to_value());
        }
        info!(entries = results.len(), "batch finished");

        let mut settings = ResponseSettings::new(self.config.default_format);
        settings.batch = true;
        Response {
            outcome: Outcome::Envelope(Envelope::ok(Value::Object(results))),
            settings,
        }
    }

    /// Run a batch and write the combined response.
    pub fn handle_batch<I>(&self, requests: I, exchange: &mut dyn HttpExchange) -> Result<()>
    where
        I: IntoIterator<Item = (String, SubRequest)>,
    {
        let response = self.run_batch(requests, exchange);
        self.respond(response, exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::loader::MemoryProgramSource;
    use crate::runtime::services::BufferedExchange;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn engine_with(programs: &[(&str, &str)]) -> Engine {
        let source = MemoryProgramSource::new();
        for (id, document) in programs {
            source.insert_document(*id, document).unwrap();
        }
        Engine::new(EngineConfig::default()).with_source(source)
    }

    #[test]
    fn request_params_land_in_the_form() {
        let engine = engine_with(&[("echo", r#"<p><reply ref="form" /></p>"#)]);
        let response = engine.run("echo", params(json!({"q": "x"})), &BufferedExchange::new());
        assert_eq!(response.outcome, Outcome::Envelope(Envelope::ok(json!({"q": "x"}))));
    }

    #[test]
    fn unknown_program_is_a_400_envelope() {
        let engine = engine_with(&[]);
        let response = engine.run("nowhere", Map::new(), &BufferedExchange::new());
        assert_eq!(response.status(), Some(400));
    }

    #[test]
    fn unknown_instruction_fails_at_load_time() {
        let engine = engine_with(&[("bad", r#"<p><set ref="a" value="1"/><frob/></p>"#)]);
        let response = engine.run("bad", Map::new(), &BufferedExchange::new());
        assert_eq!(response.status(), Some(500));
        assert!(engine.programs().is_empty());
    }

    #[test]
    fn debug_config_reports_internal_detail() {
        let source = MemoryProgramSource::new();
        source.insert_document("bad", "<p><frob/></p>").unwrap();
        let config = EngineConfig {
            debug: true,
            ..EngineConfig::default()
        };
        let engine = Engine::new(config).with_source(source);
        let Outcome::Envelope(envelope) = engine
            .run("bad", Map::new(), &BufferedExchange::new())
            .outcome
        else {
            panic!("expected envelope");
        };
        assert_eq!(envelope.message.as_deref(), Some("unknown instruction <frob>"));
    }

    #[test]
    fn handle_writes_headers_and_body() {
        let engine = engine_with(&[(
            "hello",
            r#"<p><header line="X-Program: hello"/><reply value="{&quot;greeting&quot;: &quot;hi {name}&quot;}" json="true"/></p>"#,
        )]);
        let mut exchange = BufferedExchange::new();
        engine
            .handle("hello", params(json!({"name": "bob"})), &mut exchange)
            .unwrap();
        assert_eq!(exchange.header("X-Program"), Some("hello"));
        assert_eq!(exchange.header("Content-Type"), Some("application/json; charset=utf-8"));
        assert_eq!(exchange.body_text(), r#"{"status":200,"payload":{"greeting":"hi bob"}}"#);
    }

    #[test]
    fn init_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig {
            max_call_depth: 3,
            ..EngineConfig::with_root(temp.path())
        };
        Engine::init(&config).unwrap();
        std::fs::write(
            config.program_root().join("main.xml"),
            r#"<program><reply value="ok"/></program>"#,
        )
        .unwrap();

        let engine = Engine::load(temp.path().to_path_buf()).unwrap();
        assert_eq!(engine.config().max_call_depth, 3);
        let response = engine.run("main", Map::new(), &BufferedExchange::new());
        assert_eq!(response.outcome, Outcome::Text("ok".to_string()));
    }

    #[test]
    fn batch_collects_keyed_envelopes() {
        let engine = engine_with(&[
            ("a", r#"<p><set ref="x" value="{n}"/><reply ref="x"/></p>"#),
            ("b", r#"<p><fail status="407" message="invalid"/></p>"#),
        ]);
        let response = engine.run_batch(
            [
                ("first".to_string(), SubRequest::new("a", params(json!({"n": 1})))),
                ("second".to_string(), SubRequest::new("b", Map::new())),
                ("third".to_string(), SubRequest::new("a", params(json!({"n": 2})))),
            ],
            &BufferedExchange::new(),
        );
        assert_eq!(
            response.outcome,
            Outcome::Envelope(Envelope::ok(json!({
                "first": {"status": 200, "payload": "1"},
                "second": {"status": 407, "message": "invalid", "payload": null},
                "third": {"status": 200, "payload": "2"}
            })))
        );
    }

    #[test]
    fn leading_cache_node_is_resolved_once_per_request() {
        let temp = TempDir::new().unwrap();
        let source = MemoryProgramSource::new();
        source
            .insert_document(
                "lead",
                r#"<p><cache id="lead" expires="60"/><reply value="ok"/></p>"#,
            )
            .unwrap();
        source
            .insert_document(
                "late",
                r#"<p><set ref="a" value="1"/><cache id="late" expires="60"/><reply value="ok"/></p>"#,
            )
            .unwrap();
        let catalog = InstructionCatalog::with_builtins();
        let dispatched = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dispatched);
        catalog.register("cache", move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Next)
        });
        let engine = Engine::new(EngineConfig::with_root(temp.path()))
            .with_source(source)
            .with_registry(catalog.snapshot());

        let response = engine.run("lead", Map::new(), &BufferedExchange::new());
        assert_eq!(response.outcome, Outcome::Text("ok".to_string()));
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
        let directive = response.settings.cache.unwrap();
        assert_eq!(directive.id, "lead");
        assert_eq!(directive.expires, std::time::Duration::from_secs(60));

        let response = engine.run("late", Map::new(), &BufferedExchange::new());
        assert_eq!(response.outcome, Outcome::Text("ok".to_string()));
        assert_eq!(dispatched.load(Ordering::SeqCst), 1);
    }
}
