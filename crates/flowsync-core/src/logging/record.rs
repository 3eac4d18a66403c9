//! One line of a peer's session log

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single JSONL log record
///
/// Records are self-contained so that several peers running side by side
/// (tests, local demos) can be merged into one timeline afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// RFC 3339 timestamp with milliseconds, UTC
    pub ts: String,
    /// trace, debug, info, warn or error
    pub level: String,
    /// Label of the peer that wrote the record (usually a short peer id)
    pub peer: String,
    /// Module path, e.g. `flowsync_core::signaling`
    pub target: String,
    pub msg: String,
    /// Short key of the shared flowchart the session was on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Short id of the remote peer the record is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Enclosing spans, outermost first, joined with ` > `
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogRecord {
    pub fn new(
        level: impl Into<String>,
        peer: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            peer: peer.into(),
            target: target.into(),
            msg: msg.into(),
            key: None,
            remote: None,
            fields: None,
            span: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// String value of a structured field, if present
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.as_ref()?.get(name)?.as_str()
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
