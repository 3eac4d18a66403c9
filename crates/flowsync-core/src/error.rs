//! Error types for flowsync

use thiserror::Error;

/// Main error type for collaboration operations
#[derive(Error, Debug)]
pub enum CollabError {
    /// Could not join or use the discovery network (transient, retried with backoff)
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// A peer did not complete the connection handshake in time
    #[error("Handshake with peer {peer} timed out after {elapsed_ms}ms")]
    HandshakeTimeout {
        /// Short form of the peer id
        peer: String,
        /// How long we waited
        elapsed_ms: u64,
    },

    /// Handshake protocol violation (unexpected message, wrong state)
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// A flowchart key was not 64 lowercase hex characters
    #[error("Invalid flowchart key: {0}")]
    InvalidKeyFormat(String),

    /// A `flowchart-data` message was missing its node or edge arrays
    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),

    /// Message tagged for a flowchart other than the active one
    #[error("Message for another flowchart ({0})")]
    CrossFlowchartMessage(String),

    /// Operation needs an active shared flowchart
    #[error("No flowchart is being shared")]
    NotSharing,

    /// The direct channel to a peer is gone
    #[error("Channel to peer {0} is closed")]
    ChannelClosed(String),

    /// Transport-level failure (endpoint, QUIC stream)
    #[error("Network error: {0}")]
    Network(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error classes reported to the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Discovery network unreachable; the session could not start
    Signaling,
    /// A single peer failed; other peers are unaffected
    Peer,
    /// Inbound data was rejected
    Protocol,
    /// Local persistence failed
    Storage,
}

impl CollabError {
    /// Classify the error for the state sink
    pub fn kind(&self) -> ErrorKind {
        match self {
            CollabError::Discovery(_) | CollabError::Network(_) => ErrorKind::Signaling,
            CollabError::HandshakeTimeout { .. }
            | CollabError::Handshake(_)
            | CollabError::ChannelClosed(_) => ErrorKind::Peer,
            CollabError::InvalidKeyFormat(_)
            | CollabError::MalformedSnapshot(_)
            | CollabError::CrossFlowchartMessage(_)
            | CollabError::NotSharing
            | CollabError::Serialization(_) => ErrorKind::Protocol,
            CollabError::Storage(_)
            | CollabError::Database(_)
            | CollabError::Transaction(_)
            | CollabError::Table(_)
            | CollabError::StorageOp(_)
            | CollabError::Commit(_)
            | CollabError::Io(_) => ErrorKind::Storage,
        }
    }

    /// Whether the failure is isolated to one peer
    pub fn is_peer_local(&self) -> bool {
        self.kind() == ErrorKind::Peer
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(e: serde_json::Error) -> Self {
        CollabError::Serialization(e.to_string())
    }
}

/// Result type alias using CollabError
pub type CollabResult<T> = Result<T, CollabError>;
