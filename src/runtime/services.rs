//! Collaborators the interpreter talks to.
//!
//! Templates, the database, privileges and the HTTP exchange sit behind
//! traits so hosts can plug in their own. Each trait has a small default
//! implementation used by the CLI and the tests.

use parking_lot::Mutex;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

use crate::interpreter::ExecutionContext;
use crate::interpreter::value::to_text;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The database rejected a statement or is unavailable.
    #[error("database error: {0}")]
    Database(String),

    /// The current user lacks a privilege.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// Template expansion failed.
    #[error("template error: {0}")]
    Template(String),

    /// Any other collaborator failure.
    #[error("{0}")]
    Other(String),
}

/// Result alias for collaborator calls.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Expands references embedded in attribute text.
pub trait TemplateEngine: Send + Sync {
    /// Expand `text` against the context's scope.
    fn expand(&self, text: &str, scope: &ExecutionContext) -> ServiceResult<String>;
}

/// Default template engine: `{name}` and `{a.b}` references.
///
/// Names resolve against the form first, then caller fields; unknown names
/// expand to nothing. Braces around anything that is not a plain name are
/// left untouched, so JSON literals pass through.
#[derive(Debug, Default, Clone, Copy)]
pub struct BraceTemplates;

fn reference_pattern() -> ServiceResult<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{([A-Za-z0-9_@][A-Za-z0-9_.@:-]*)\}").ok())
        .as_ref()
        .ok_or_else(|| ServiceError::Template("invalid reference pattern".to_string()))
}

impl TemplateEngine for BraceTemplates {
    fn expand(&self, text: &str, scope: &ExecutionContext) -> ServiceResult<String> {
        if !text.contains('{') {
            return Ok(text.to_string());
        }
        let expanded = reference_pattern()?.replace_all(text, |caps: &Captures<'_>| {
            scope
                .resolve(&caps[1])
                .map(|value| to_text(&value))
                .unwrap_or_default()
        });
        Ok(expanded.into_owned())
    }
}

/// Forward-only cursor over result rows.
pub trait RowCursor {
    /// Next row, `None` at the end.
    fn next_row(&mut self) -> ServiceResult<Option<Map<String, Value>>>;
}

impl RowCursor for std::vec::IntoIter<Map<String, Value>> {
    fn next_row(&mut self) -> ServiceResult<Option<Map<String, Value>>> {
        Ok(self.next())
    }
}

/// Relational data access.
pub trait Database: Send + Sync {
    /// First column of the first row (`null` when there is none).
    fn exec_scalar(&self, sql: &str) -> ServiceResult<Value>;

    /// First row.
    fn exec_assoc(&self, sql: &str) -> ServiceResult<Option<Map<String, Value>>>;

    /// All rows.
    fn exec_query(&self, sql: &str) -> ServiceResult<Vec<Map<String, Value>>>;

    /// Streamed rows.
    fn exec_reader(&self, sql: &str) -> ServiceResult<Box<dyn RowCursor + '_>>;
}

/// In-memory database answering statements with canned rows.
///
/// Statements are matched verbatim after whitespace is collapsed. Every
/// executed statement is recorded.
#[derive(Debug, Default)]
pub struct StaticDatabase {
    results: HashMap<String, Vec<Map<String, Value>>>,
    executed: Mutex<Vec<String>>,
}

impl StaticDatabase {
    /// Empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the rows returned for a statement.
    pub fn with_rows(mut self, sql: &str, rows: Vec<Map<String, Value>>) -> Self {
        self.results.insert(normalize_sql(sql), rows);
        self
    }

    /// Statements executed so far.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    fn rows(&self, sql: &str) -> ServiceResult<Vec<Map<String, Value>>> {
        let key = normalize_sql(sql);
        self.executed.lock().push(key.clone());
        self.results
            .get(&key)
            .cloned()
            .ok_or_else(|| ServiceError::Database(format!("unexpected statement: {key}")))
    }
}

fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl Database for StaticDatabase {
    fn exec_scalar(&self, sql: &str) -> ServiceResult<Value> {
        Ok(self
            .rows(sql)?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().map(|(_, value)| value))
            .unwrap_or(Value::Null))
    }

    fn exec_assoc(&self, sql: &str) -> ServiceResult<Option<Map<String, Value>>> {
        Ok(self.rows(sql)?.into_iter().next())
    }

    fn exec_query(&self, sql: &str) -> ServiceResult<Vec<Map<String, Value>>> {
        self.rows(sql)
    }

    fn exec_reader(&self, sql: &str) -> ServiceResult<Box<dyn RowCursor + '_>> {
        Ok(Box::new(self.rows(sql)?.into_iter()))
    }
}

/// Privilege checks and the current user.
pub trait PrivilegeService: Send + Sync {
    /// Whether the privilege expression holds for the current user.
    fn has_privilege(&self, expr: &str) -> bool;

    /// The current user's record.
    fn current_user(&self) -> Option<Map<String, Value>>;
}

/// Fixed set of granted privileges.
///
/// `a|b` holds when any alternative is granted, `a&b` when all are; `&`
/// binds tighter than `|`.
#[derive(Debug, Clone, Default)]
pub struct StaticPrivileges {
    granted: BTreeSet<String>,
    user: Option<Map<String, Value>>,
}

impl StaticPrivileges {
    /// Grant the given privileges.
    pub fn granting<I, S>(privileges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            granted: privileges.into_iter().map(Into::into).collect(),
            user: None,
        }
    }

    /// Attach a current user record.
    pub fn with_user(mut self, user: Map<String, Value>) -> Self {
        self.user = Some(user);
        self
    }
}

impl PrivilegeService for StaticPrivileges {
    fn has_privilege(&self, expr: &str) -> bool {
        expr.split('|').any(|alternative| {
            let mut required = alternative
                .split('&')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .peekable();
            required.peek().is_some() && required.all(|name| self.granted.contains(name))
        })
    }

    fn current_user(&self) -> Option<Map<String, Value>> {
        self.user.clone()
    }
}

/// The HTTP side of a request.
pub trait HttpExchange {
    /// Request header value (case-insensitive name).
    fn request_header(&self, name: &str) -> Option<String>;

    /// Queue a response header line (`Name: value` or a status line).
    fn set_header(&mut self, line: &str);

    /// Append to the response body.
    fn write_body(&mut self, bytes: &[u8]);

    /// Whether `Accept-Encoding` allows the given content coding.
    fn accepts_encoding(&self, encoding: &str) -> bool {
        let Some(header) = self.request_header("Accept-Encoding") else {
            return false;
        };
        header.split(',').any(|entry| {
            let mut parts = entry.split(';');
            let coding = parts.next().unwrap_or_default().trim();
            let refused = parts.any(|param| {
                let param = param.trim();
                param
                    .strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            !refused && (coding.eq_ignore_ascii_case(encoding) || coding == "*")
        })
    }
}

/// Exchange that keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct BufferedExchange {
    request_headers: Vec<(String, String)>,
    headers: Vec<String>,
    body: Vec<u8>,
}

impl BufferedExchange {
    /// Exchange with no request headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request header.
    pub fn with_request_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.request_headers.push((name.into(), value.into()));
        self
    }

    /// Response header lines written so far.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Value of the first response header with the given name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    /// Response body written so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Response body as text (lossy).
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl HttpExchange for BufferedExchange {
    fn request_header(&self, name: &str) -> Option<String> {
        self.request_headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    fn set_header(&mut self, line: &str) {
        self.headers.push(line.to_string());
    }

    fn write_body(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }
}

/// Bundle of collaborators owned by an engine.
#[derive(Clone)]
pub struct Services {
    /// Template expansion.
    pub templates: Arc<dyn TemplateEngine>,
    /// Database, if one is configured.
    pub database: Option<Arc<dyn Database>>,
    /// Privilege checks.
    pub privileges: Arc<dyn PrivilegeService>,
}

impl Services {
    /// The configured database.
    pub fn database(&self) -> ServiceResult<Arc<dyn Database>> {
        self.database
            .clone()
            .ok_or_else(|| ServiceError::Database("no database configured".to_string()))
    }
}

impl Default for Services {
    fn default() -> Self {
        Self {
            templates: Arc::new(BraceTemplates),
            database: None,
            privileges: Arc::new(StaticPrivileges::default()),
        }
    }
}
