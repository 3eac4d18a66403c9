//! Flowsync Core Library
//!
//! Peer-to-peer collaboration on flowcharts: no server, no accounts, just a
//! shared key.
//!
//! ## Overview
//!
//! A flowchart is shared by handing out its [`FlowchartKey`]. The key hashes
//! to a [`DiscoveryTopic`]; everyone on the topic finds each other, runs a
//! short offer/answer handshake over the discovery link and then talks over
//! a direct, ordered channel. On that channel peers exchange presence,
//! request a full snapshot once, and from then on stream node and edge
//! operations that every replica applies by id.
//!
//! ## Layers
//!
//! - [`transport`]: discovery and direct channels (iroh gossip + QUIC, or in-memory)
//! - [`signaling`]: the handshake that turns a discovery link into a channel
//! - [`sync`]: wire protocol, dispatcher and the [`CollabSession`] actor
//! - [`flowchart`]: the replicated document and its operations
//! - [`keystore`] and [`storage`]: persistent keys and cached snapshots
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use flowsync_core::{ChannelSink, CollabConfig, CollabSession, NodeOperation, PeerIdentity};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sink = Arc::new(ChannelSink::new());
//!     let session = CollabSession::start(
//!         "~/.flowsync",
//!         PeerIdentity::generate(),
//!         CollabConfig::default(),
//!         sink.clone(),
//!     )
//!     .await?;
//!
//!     // Share and hand the key to a collaborator
//!     let key = session.share_flowchart("roadmap".into()).await?;
//!     println!("join with: {}", key);
//!
//!     // Edits are applied locally and relayed to every connected peer
//!     session
//!         .request_local_edit(NodeOperation::Add {
//!             node: flowsync_core::Node::new("start", "terminal", Default::default()),
//!         })
//!         .await?;
//!
//!     let mut events = sink.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod flowchart;
pub mod identity;
pub mod keystore;
pub mod logging;
pub mod signaling;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports
pub use config::CollabConfig;
pub use error::{CollabError, CollabResult, ErrorKind};
pub use flowchart::{FlowchartDoc, OpOutcome, ReplicationState};
pub use identity::PeerIdentity;
pub use keystore::KeyStore;
pub use signaling::{SignalMessage, SignalingChannel};
pub use storage::{NoCache, SnapshotCache, Storage};
pub use sync::{
    ChannelSink, CollabEvent, CollabSession, LocalEdit, NullSink, SessionStatus, StateSink,
};
pub use transport::{
    DirectConnector, DiscoveryEvent, DiscoverySwarm, FrameChannel, GossipTransport, MemoryNetwork,
    MemoryTransport,
};
pub use types::*;
