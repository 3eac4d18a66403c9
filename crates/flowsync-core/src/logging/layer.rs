//! tracing Layer that mirrors events into a [`PeerLogWriter`]
//!
//! Besides the free-form fields, records carry two columns lifted from the
//! event or its enclosing spans: `key` (the shared flowchart) and `remote`
//! (the peer a record is about). The session actor runs inside a
//! `session{key}` span and every peer link inside `link{remote}`, so events
//! need not repeat them.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use super::record::LogRecord;
use super::writer::PeerLogWriter;

/// Filter used when neither `RUST_LOG` nor [`LoggingBuilder::with_filter`] is set
pub const DEFAULT_FILTER: &str = "flowsync_core=info";

/// Writes every event as one [`LogRecord`] line
pub struct JsonlLayer {
    writer: Arc<PeerLogWriter>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<Path>, peer: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(PeerLogWriter::new(logs_dir, peer)?),
        })
    }

    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }

    pub fn peer(&self) -> &str {
        self.writer.peer()
    }
}

/// Collaboration context attached to a span
///
/// Recording an empty string clears a column, which is how the session
/// span forgets its key on leave.
#[derive(Debug, Clone, Default, PartialEq)]
struct Collab {
    key: Option<String>,
    remote: Option<String>,
}

impl Collab {
    /// Move the recognized fields out of `fields`
    fn take_from(&mut self, fields: &mut Map<String, Value>, peer_is_remote: bool) {
        if let Some(key) = fields.remove("key") {
            self.key = non_empty(key);
        }
        if let Some(remote) = fields.remove("remote") {
            self.remote = non_empty(remote);
        } else if peer_is_remote {
            if let Some(peer) = fields.remove("peer") {
                self.remote = non_empty(peer);
            }
        }
    }

    /// Inner values win over outer ones
    fn overlay(&mut self, inner: &Collab) {
        if inner.key.is_some() {
            self.key = inner.key.clone();
        }
        if inner.remote.is_some() {
            self.remote = inner.remote.clone();
        }
    }
}

fn non_empty(value: Value) -> Option<String> {
    match value {
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        let mut collab = Collab::default();
        collab.take_from(&mut visitor.fields, false);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(collab);
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = JsonVisitor::default();
        values.record(&mut visitor);
        let mut extensions = span.extensions_mut();
        if extensions.get_mut::<Collab>().is_none() {
            extensions.insert(Collab::default());
        }
        if let Some(collab) = extensions.get_mut::<Collab>() {
            collab.take_from(&mut visitor.fields, false);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut collab = Collab::default();
        let mut spans = Vec::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(inner) = span.extensions().get::<Collab>() {
                    collab.overlay(inner);
                }
                spans.push(span.name());
            }
        }
        let mut own = Collab::default();
        own.take_from(&mut visitor.fields, true);
        collab.overlay(&own);

        let mut record = LogRecord::new(
            metadata.level().as_str().to_lowercase(),
            self.writer.peer(),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        record.key = collab.key;
        record.remote = collab.remote;
        if !visitor.fields.is_empty() {
            record = record.with_fields(Value::Object(visitor.fields));
        }
        if !spans.is_empty() {
            record = record.with_span(spans.join(" > "));
        }

        // Logging must never take the session down
        let _ = self.writer.write(&record);
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl JsonVisitor {
    fn put(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }

    fn text(&mut self, field: &Field, text: String) {
        if field.name() == "message" {
            self.message = Some(text);
        } else {
            self.put(field, Value::String(text));
        }
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(buf, "{:?}", value);
        self.text(field, buf);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.text(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.put(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }
}

/// Installs console and JSONL logging for one peer
///
/// ```ignore
/// LoggingBuilder::new("./logs", identity.peer_id().short())
///     .with_filter("flowsync_core=debug")
///     .init()?;
/// ```
#[derive(Debug, Clone)]
pub struct LoggingBuilder {
    logs_dir: PathBuf,
    peer: String,
    console_output: bool,
    filter: Option<String>,
}

impl LoggingBuilder {
    pub fn new(logs_dir: impl Into<PathBuf>, peer: impl Into<String>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            peer: peer.into(),
            console_output: true,
            filter: None,
        }
    }

    /// Only write JSONL, nothing to stderr
    pub fn no_console(mut self) -> Self {
        self.console_output = false;
        self
    }

    /// Directive string such as `flowsync_core=debug,iroh=warn`
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Just the JSONL layer, for composing a custom subscriber
    pub fn build_layer(&self) -> std::io::Result<JsonlLayer> {
        JsonlLayer::new(&self.logs_dir, self.peer.clone())
    }

    fn env_filter(&self) -> EnvFilter {
        match &self.filter {
            Some(filter) => EnvFilter::new(filter),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        }
    }

    /// Install as the global subscriber; returns the JSONL file path
    pub fn init(self) -> std::io::Result<PathBuf> {
        let jsonl = self.build_layer()?;
        let path = jsonl.log_path().to_path_buf();
        let console = self
            .console_output
            .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

        tracing_subscriber::registry()
            .with(self.env_filter())
            .with(console)
            .with(jsonl)
            .try_init()
            .map_err(std::io::Error::other)?;
        Ok(path)
    }
}
