//! Remote collaborator state
//!
//! A [`PeerInfo`] exists from the moment a peer is discovered until its
//! connection closes. It is never persisted.

use serde::{Deserialize, Serialize};

use super::{now_millis, PeerId};

/// Connection lifecycle of a discovered peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Discovered, handshake in progress
    Connecting,
    /// Direct channel open
    Connected,
    /// Channel closed; the entry is about to be removed
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Ephemeral pointer location on the canvas
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// How a participant presents itself to others
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub display_name: String,
    /// CSS color string, e.g. `#e11d48`
    pub color: String,
}

/// Palette used when a user has not picked a color.
const PEER_COLORS: [&str; 8] = [
    "#e11d48", "#2563eb", "#16a34a", "#d97706", "#7c3aed", "#0891b2", "#db2777", "#65a30d",
];

impl UserInfo {
    pub fn new(display_name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            color: color.into(),
        }
    }

    /// Placeholder identity derived from the peer id, stable for the session
    pub fn anonymous(peer_id: &PeerId) -> Self {
        let color = PEER_COLORS[peer_id.as_bytes()[0] as usize % PEER_COLORS.len()];
        Self::new(format!("Guest {}", &peer_id.short()[..4]), color)
    }
}

/// Everything we know about one remote participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub display_name: String,
    pub color: String,
    pub cursor: Option<CursorPosition>,
    /// Unix milliseconds of the last message from this peer
    pub last_seen: i64,
    pub connection_state: ConnectionState,
}

impl PeerInfo {
    /// Entry for a freshly discovered peer
    pub fn new(peer_id: PeerId) -> Self {
        let placeholder = UserInfo::anonymous(&peer_id);
        Self {
            peer_id,
            display_name: placeholder.display_name,
            color: placeholder.color,
            cursor: None,
            last_seen: now_millis(),
            connection_state: ConnectionState::Connecting,
        }
    }

    /// Update the last_seen timestamp to now
    pub fn touch(&mut self) {
        self.last_seen = now_millis();
    }

    /// Apply an announced identity
    pub fn apply_user_info(&mut self, info: &UserInfo) {
        self.display_name = info.display_name.clone();
        self.color = info.color.clone();
        self.touch();
    }

    /// Set the peer's connection state
    pub fn with_state(mut self, state: ConnectionState) -> Self {
        self.connection_state = state;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}
