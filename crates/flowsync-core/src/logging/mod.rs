//! Per-peer JSONL logging
//!
//! Every peer writes its own append-only file, so several peers running in
//! one process or on one machine never interleave partial lines:
//!
//! ```text
//! logs/
//! ├── 2026-10-18_3fa1c0de.jsonl
//! └── 2026-10-18_77aa0011.jsonl
//! ```
//!
//! ```ignore
//! use flowsync_core::logging::LoggingBuilder;
//!
//! LoggingBuilder::new("./logs", identity.peer_id().short()).init()?;
//! ```
//!
//! Records carry the shared flowchart's short key and the remote peer as
//! top-level columns, so one flowchart's timeline across every peer is a
//! [`flowchart_timeline`] call, or from the shell:
//!
//! ```bash
//! cat logs/*.jsonl | jq -s 'sort_by(.ts) | .[] | select(.key == "9c41d2e0")'
//! ```

pub mod layer;
pub mod record;
pub mod writer;

pub use layer::{JsonlLayer, LoggingBuilder, DEFAULT_FILTER};
pub use record::LogRecord;
pub use writer::{
    flowchart_timeline, read_filtered, read_records, records_for_peer, PeerLogWriter, RecordFilter,
};
