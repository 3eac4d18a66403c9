//! Session status and notifications for the UI layer
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  SessionStatus: where the session is in its lifecycle        │
//! │  ├── Idle: no flowchart shared                               │
//! │  ├── Connecting: joining the discovery topic                 │
//! │  ├── SearchingForPeers: joined, nobody connected yet         │
//! │  ├── Connected: at least one direct channel open             │
//! │  ├── WaitingForPeers: snapshot requests went unanswered      │
//! │  └── Failed: discovery could not be reached                  │
//! │                                                              │
//! │  StateSink: callbacks the session drives                     │
//! │  └── ChannelSink: forwards them as CollabEvent on broadcast  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::ErrorKind;
use crate::types::{EdgeOperation, FlowchartSnapshot, NodeOperation, PeerId, PeerInfo};

/// Capacity of the [`ChannelSink`] broadcast queue
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle of a collaboration session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    Connecting,
    SearchingForPeers,
    Connected {
        /// Peers with an open direct channel
        peer_count: usize,
    },
    WaitingForPeers,
    Failed(String),
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "Idle"),
            SessionStatus::Connecting => write!(f, "Connecting"),
            SessionStatus::SearchingForPeers => write!(f, "Searching for peers"),
            SessionStatus::Connected { peer_count } => {
                write!(f, "Connected ({} peers)", peer_count)
            }
            SessionStatus::WaitingForPeers => write!(f, "Waiting for peers"),
            SessionStatus::Failed(msg) => write!(f, "Failed: {}", msg),
        }
    }
}

/// A mutation requested by the local user
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEdit {
    Node(NodeOperation),
    Edge(EdgeOperation),
}

impl From<NodeOperation> for LocalEdit {
    fn from(op: NodeOperation) -> Self {
        LocalEdit::Node(op)
    }
}

impl From<EdgeOperation> for LocalEdit {
    fn from(op: EdgeOperation) -> Self {
        LocalEdit::Edge(op)
    }
}

/// Receives everything the UI needs to render
///
/// All methods default to doing nothing. They are called from the session
/// task and must not block.
pub trait StateSink: Send + Sync + 'static {
    /// The replicated flowchart changed because of a remote snapshot or operation
    fn on_snapshot_applied(&self, _snapshot: &FlowchartSnapshot) {}

    fn on_peer_list_changed(&self, _peers: &[PeerInfo]) {}

    fn on_error(&self, _kind: ErrorKind, _message: &str) {}

    /// Opaque `flowchart-update` payload from a peer
    fn on_remote_update(&self, _peer: PeerId, _payload: &Value) {}

    fn on_status_changed(&self, _status: &SessionStatus) {}
}

/// Discards all notifications
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl StateSink for NullSink {}

/// Notification forwarded by [`ChannelSink`]
#[derive(Debug, Clone)]
pub enum CollabEvent {
    SnapshotApplied(FlowchartSnapshot),
    PeerListChanged(Vec<PeerInfo>),
    Error { kind: ErrorKind, message: String },
    RemoteUpdate { peer: PeerId, payload: Value },
    StatusChanged(SessionStatus),
}

/// Sink that republishes every callback on a broadcast channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: broadcast::Sender<CollabEvent>,
}

impl Default for ChannelSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollabEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: CollabEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl StateSink for ChannelSink {
    fn on_snapshot_applied(&self, snapshot: &FlowchartSnapshot) {
        self.emit(CollabEvent::SnapshotApplied(snapshot.clone()));
    }

    fn on_peer_list_changed(&self, peers: &[PeerInfo]) {
        self.emit(CollabEvent::PeerListChanged(peers.to_vec()));
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.emit(CollabEvent::Error {
            kind,
            message: message.to_string(),
        });
    }

    fn on_remote_update(&self, peer: PeerId, payload: &Value) {
        self.emit(CollabEvent::RemoteUpdate {
            peer,
            payload: payload.clone(),
        });
    }

    fn on_status_changed(&self, status: &SessionStatus) {
        self.emit(CollabEvent::StatusChanged(status.clone()));
    }
}
