//! Response assembly: envelopes, serialization and content coding.
//!
//! A finished request yields a [`Response`]: what the program produced
//! ([`Outcome`]) plus the [`ResponseSettings`] its instructions accumulated.
//! Rendering turns it into header lines and body bytes; compression is a
//! separate step so the response cache can keep the uncompressed form.

use flate2::Compression;
use flate2::write::{DeflateEncoder, GzEncoder};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::io::Write;
use std::time::Duration;
use tracing::warn;

use super::cache::CachedResponse;
use super::services::HttpExchange;
use crate::interpreter::{Flow, InterpreterError, Reply, Result};

/// The uniform reply structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Numeric status (200 on success).
    pub status: u16,
    /// Human-readable message, mostly for errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Reply data.
    #[serde(default)]
    pub payload: Value,
    /// Extra header lines sent with this envelope.
    #[serde(skip)]
    pub headers: Vec<String>,
}

impl Envelope {
    /// Status-200 envelope around a payload.
    pub fn ok(payload: Value) -> Self {
        Self {
            status: 200,
            message: None,
            payload,
            headers: Vec::new(),
        }
    }

    /// Error envelope with an empty payload.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            payload: Value::Null,
            headers: Vec::new(),
        }
    }

    /// Error envelope describing an interpreter error.
    pub fn from_error(err: &InterpreterError) -> Self {
        Self::error(err.status(), err.public_message())
    }

    /// JSON form of the envelope.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("status".to_string(), json!(self.status));
        if let Some(message) = &self.message {
            map.insert("message".to_string(), json!(message));
        }
        map.insert("payload".to_string(), self.payload.clone());
        Value::Object(map)
    }
}

/// Serialization target for envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Format {
    /// Compact JSON.
    #[default]
    Json,
    /// Compact XML.
    Xml,
    /// Indented XML with type annotations.
    XmlDebug,
}

impl Format {
    /// Content-Type header line for this format.
    pub fn content_type(self) -> &'static str {
        match self {
            Format::Json => "Content-Type: application/json; charset=utf-8",
            Format::Xml | Format::XmlDebug => "Content-Type: text/xml; charset=utf-8",
        }
    }
}

/// Response caching requested by a `cache` instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDirective {
    /// Cache key.
    pub id: String,
    /// Maximum age of a reusable entry.
    pub expires: Duration,
}

/// Output settings accumulated while a request runs.
#[derive(Debug, Clone, Default)]
pub struct ResponseSettings {
    /// Envelope serialization.
    pub format: Format,
    /// Whether compression is permitted.
    pub compress: bool,
    /// Store the rendered response under this directive.
    pub cache: Option<CacheDirective>,
    /// Header lines queued by instructions.
    pub headers: Vec<String>,
    /// Text written directly by instructions, emitted before any reply.
    pub raw_body: String,
    /// Running as one sub-request of a batch.
    pub batch: bool,
    /// A cached response to replay instead of rendering.
    pub replay: Option<CachedResponse>,
}

impl ResponseSettings {
    /// Settings with the given default format.
    pub fn new(format: Format) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }
}

/// What a request produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// An envelope to serialize.
    Envelope(Envelope),
    /// A raw text body.
    Text(String),
    /// Nothing beyond what instructions wrote themselves.
    Silent,
    /// A stored response replayed from the cache.
    Cached(CachedResponse),
}

impl Outcome {
    /// Envelope view, used when outcomes are collected into a batch.
    pub fn into_envelope(self) -> Envelope {
        match self {
            Outcome::Envelope(envelope) => envelope,
            Outcome::Text(text) => Envelope::ok(Value::String(text)),
            Outcome::Silent => Envelope::ok(Value::Null),
            Outcome::Cached(cached) => {
                Envelope::ok(Value::String(String::from_utf8_lossy(&cached.body).into_owned()))
            }
        }
    }
}

/// A finished request, ready to render.
#[derive(Debug, Clone)]
pub struct Response {
    /// What the program produced.
    pub outcome: Outcome,
    /// Settings accumulated by instructions.
    pub settings: ResponseSettings,
}

impl Response {
    /// Map the final flow of a program to an outcome.
    pub fn assemble(flow: Flow, mut settings: ResponseSettings) -> Self {
        let outcome = match flow {
            Flow::Reply(Reply::Envelope(envelope)) => Outcome::Envelope(envelope),
            Flow::Reply(Reply::Value(Value::String(text))) => Outcome::Text(text),
            Flow::Reply(Reply::Value(Value::Null)) | Flow::Stop => match settings.replay.take() {
                Some(cached) => Outcome::Cached(cached),
                None => Outcome::Silent,
            },
            Flow::Reply(Reply::Value(payload)) => Outcome::Envelope(Envelope::ok(payload)),
            Flow::Next => Outcome::Envelope(Envelope::ok(Value::Null)),
            signal @ (Flow::Break | Flow::Continue) => {
                warn!(?signal, "loop signal reached the top level");
                Outcome::Envelope(Envelope::ok(Value::Null))
            }
        };
        Self { outcome, settings }
    }

    /// Error response. Queued headers survive; raw output does not.
    ///
    /// `detailed` reports the full error text even for internal failures.
    pub fn failure(err: &InterpreterError, mut settings: ResponseSettings, detailed: bool) -> Self {
        settings.raw_body.clear();
        settings.cache = None;
        let mut envelope = Envelope::from_error(err);
        if detailed {
            envelope.message = Some(err.to_string());
        }
        Self {
            outcome: Outcome::Envelope(envelope),
            settings,
        }
    }

    /// Envelope status, when the outcome has one.
    pub fn status(&self) -> Option<u16> {
        match &self.outcome {
            Outcome::Envelope(envelope) => Some(envelope.status),
            _ => None,
        }
    }

    /// Render header lines and the uncompressed body.
    pub fn render(&self) -> Result<Rendered> {
        let mut headers = self.settings.headers.clone();
        let mut body = self.settings.raw_body.clone().into_bytes();
        match &self.outcome {
            Outcome::Envelope(envelope) => {
                headers.extend(envelope.headers.iter().cloned());
                push_default(&mut headers, self.settings.format.content_type());
                body.extend(serialize(envelope, self.settings.format)?);
            }
            Outcome::Text(text) => {
                push_default(&mut headers, "Content-Type: text/plain; charset=utf-8");
                body.extend_from_slice(text.as_bytes());
            }
            Outcome::Silent => {}
            Outcome::Cached(cached) => {
                return Ok(Rendered {
                    headers: cached.headers.clone(),
                    body: cached.body.clone(),
                });
            }
        }
        Ok(Rendered { headers, body })
    }

    /// Whether the body may be compressed.
    pub fn compressible(&self) -> bool {
        match &self.outcome {
            Outcome::Cached(cached) => cached.compress,
            _ => self.settings.compress,
        }
    }
}

/// Add a header unless one with the same name is already queued.
fn push_default(headers: &mut Vec<String>, line: &str) {
    let name = header_name(line);
    if !headers.iter().any(|existing| header_name(existing).eq_ignore_ascii_case(name)) {
        headers.push(line.to_string());
    }
}

fn header_name(line: &str) -> &str {
    line.split_once(':').map(|(name, _)| name.trim()).unwrap_or(line)
}

/// Serialized response: header lines and body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// Header lines.
    pub headers: Vec<String>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl Rendered {
    /// Apply the best content coding the client accepts (gzip, then deflate).
    pub fn encode(mut self, exchange: &dyn HttpExchange) -> Result<Self> {
        if self.body.is_empty() {
            return Ok(self);
        }
        let (coding, body) = if exchange.accepts_encoding("gzip") {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&self.body)?;
            ("gzip", encoder.finish()?)
        } else if exchange.accepts_encoding("deflate") {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&self.body)?;
            ("deflate", encoder.finish()?)
        } else {
            return Ok(self);
        };
        self.headers.push(format!("Content-Encoding: {coding}"));
        self.headers.push("Vary: Accept-Encoding".to_string());
        self.body = body;
        Ok(self)
    }

    /// Send headers, then the body.
    pub fn write_to(&self, exchange: &mut dyn HttpExchange) {
        for line in &self.headers {
            exchange.set_header(line);
        }
        if !self.body.is_empty() {
            exchange.set_header(&format!("Content-Length: {}", self.body.len()));
            exchange.write_body(&self.body);
        }
    }
}

/// Serialize an envelope in the given format.
pub fn serialize(envelope: &Envelope, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Json => Ok(serde_json::to_vec(envelope)?),
        Format::Xml => to_xml(envelope, false),
        Format::XmlDebug => to_xml(envelope, true),
    }
}

fn xml_err(err: impl std::fmt::Display) -> InterpreterError {
    InterpreterError::Xml(err.to_string())
}

fn to_xml(envelope: &Envelope, debug: bool) -> Result<Vec<u8>> {
    let mut writer = if debug {
        Writer::new_with_indent(Vec::new(), b' ', 2)
    } else {
        Writer::new(Vec::new())
    };
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;

    let status = envelope.status.to_string();
    let mut root = BytesStart::new("response");
    root.push_attribute(("status", status.as_str()));
    if let Some(message) = &envelope.message {
        root.push_attribute(("message", message.as_str()));
    }
    writer.write_event(Event::Start(root)).map_err(xml_err)?;
    write_element(&mut writer, "payload", None, &envelope.payload, debug)?;
    writer
        .write_event(Event::End(BytesEnd::new("response")))
        .map_err(xml_err)?;
    Ok(writer.into_inner())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Keys that cannot be element names are written as `<item key="…">`.
fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    !name.to_ascii_lowercase().starts_with("xml")
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn write_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    key: Option<&str>,
    value: &Value,
    debug: bool,
) -> Result<()> {
    let mut start = BytesStart::new(name);
    if let Some(key) = key {
        start.push_attribute(("key", key));
    }
    if debug {
        start.push_attribute(("type", type_name(value)));
    }

    match value {
        Value::Null => {
            writer.write_event(Event::Empty(start)).map_err(xml_err)?;
            return Ok(());
        }
        Value::Array(items) if items.is_empty() => {
            writer.write_event(Event::Empty(start)).map_err(xml_err)?;
            return Ok(());
        }
        Value::Object(map) if map.is_empty() => {
            writer.write_event(Event::Empty(start)).map_err(xml_err)?;
            return Ok(());
        }
        _ => {}
    }

    writer.write_event(Event::Start(start)).map_err(xml_err)?;
    match value {
        Value::Object(map) => {
            for (child, item) in map {
                if valid_name(child) {
                    write_element(writer, child, None, item, debug)?;
                } else {
                    write_element(writer, "item", Some(child), item, debug)?;
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                write_element(writer, "item", None, item, debug)?;
            }
        }
        scalar => {
            let text = crate::interpreter::value::to_text(scalar);
            writer
                .write_event(Event::Text(BytesText::new(&text)))
                .map_err(xml_err)?;
        }
    }
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_err)?;
    Ok(())
}
