//! Discovery and direct-channel transports
//!
//! Two seams separate the protocol from the network:
//!
//! - [`DiscoverySwarm`] joins a rendezvous topic and reports peers appearing
//!   and vanishing, each with a [`FrameChannel`] that carries signaling.
//! - [`DirectConnector`] turns a completed handshake into a direct, ordered,
//!   reliable [`FrameChannel`] for the sync protocol.
//!
//! [`gossip::GossipTransport`] implements both over iroh; [`memory`] provides
//! a deterministic in-process network for tests and simulations.

pub mod gossip;
pub mod memory;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{CollabError, CollabResult};
use crate::types::{DiscoveryTopic, PeerId};

pub use gossip::{GossipTransport, COLLAB_ALPN};
pub use memory::{MemoryNetwork, MemoryTransport};

/// Capacity of the discovery event queue handed out by `join`
pub const DISCOVERY_EVENT_CAPACITY: usize = 64;

/// Ordered, reliable, bidirectional frame pipe to one peer
///
/// Sending never blocks; a closed pipe reports
/// [`CollabError::ChannelClosed`].
#[derive(Debug)]
pub struct FrameChannel {
    remote: PeerId,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl FrameChannel {
    pub fn new(
        remote: PeerId,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            remote,
            outbound,
            inbound,
        }
    }

    /// Two connected ends: `a`'s end talks to `b` and vice versa
    pub fn pair(a: PeerId, b: PeerId) -> (FrameChannel, FrameChannel) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (FrameChannel::new(b, a_tx, a_rx), FrameChannel::new(a, b_tx, b_rx))
    }

    /// The peer at the other end
    pub fn remote(&self) -> PeerId {
        self.remote
    }

    pub fn send(&self, frame: Vec<u8>) -> CollabResult<()> {
        self.outbound
            .send(frame)
            .map_err(|_| CollabError::ChannelClosed(self.remote.short()))
    }

    /// Next inbound frame; `None` once the remote end is gone
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Next inbound frame if one is already queued
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.try_recv().ok()
    }

    /// Separate the sending half (cloneable) from the receiving half
    pub fn split(self) -> (FrameSender, mpsc::UnboundedReceiver<Vec<u8>>) {
        (
            FrameSender {
                remote: self.remote,
                outbound: self.outbound,
            },
            self.inbound,
        )
    }
}

/// Cloneable sending half of a [`FrameChannel`]
#[derive(Debug, Clone)]
pub struct FrameSender {
    remote: PeerId,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl FrameSender {
    pub fn remote(&self) -> PeerId {
        self.remote
    }

    pub fn send(&self, frame: Vec<u8>) -> CollabResult<()> {
        self.outbound
            .send(frame)
            .map_err(|_| CollabError::ChannelClosed(self.remote.short()))
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Peer appearing on or vanishing from a joined topic
#[derive(Debug)]
pub enum DiscoveryEvent {
    /// A peer was found; `link` carries signaling frames to and from it
    Connection { peer: PeerId, link: FrameChannel },
    /// The transport-level connection to a peer closed
    Disconnection { peer: PeerId },
}

/// Proof of membership in one topic, returned by `join` and consumed by `leave`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryHandle {
    topic: DiscoveryTopic,
    id: u64,
}

impl DiscoveryHandle {
    pub(crate) fn new(topic: DiscoveryTopic, id: u64) -> Self {
        Self { topic, id }
    }

    pub fn topic(&self) -> DiscoveryTopic {
        self.topic
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

/// Topic-based peer discovery
pub trait DiscoverySwarm: Send + Sync + 'static {
    /// Our id on the discovery network
    fn local_peer(&self) -> PeerId;

    /// Join a topic. The receiver yields an event per peer found or lost.
    fn join(
        &self,
        topic: DiscoveryTopic,
    ) -> impl Future<Output = CollabResult<(DiscoveryHandle, mpsc::Receiver<DiscoveryEvent>)>> + Send;

    /// Leave a topic; all links opened for it are closed
    fn leave(&self, handle: DiscoveryHandle) -> impl Future<Output = ()> + Send;
}

/// Establishes direct data channels once signaling has exchanged descriptions
pub trait DirectConnector: Send + Sync + 'static {
    /// Opaque description of how to reach us, sent in offers and answers
    fn local_description(&self) -> String;

    /// Extra reachability hints, sent as `ice-candidate` messages
    fn local_candidates(&self) -> Vec<String>;

    /// Record a reachability hint received from `peer`
    fn add_remote_candidate(&self, peer: PeerId, candidate: &str) -> CollabResult<()>;

    /// Open a direct channel to `peer` using its description
    fn dial(
        &self,
        peer: PeerId,
        description: &str,
    ) -> impl Future<Output = CollabResult<FrameChannel>> + Send;

    /// Expect a dial from `peer`.
    ///
    /// Arming happens immediately; the returned value resolves once the dial
    /// lands. Inbound dials nobody armed for are refused.
    fn accept_from(&self, peer: PeerId) -> PendingAccept;
}

/// An armed accept, resolved when the expected peer dials in
#[derive(Debug)]
pub struct PendingAccept {
    peer: PeerId,
    rx: oneshot::Receiver<FrameChannel>,
}

impl PendingAccept {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Wait for the dial
    pub async fn wait(self) -> CollabResult<FrameChannel> {
        self.rx
            .await
            .map_err(|_| CollabError::ChannelClosed(self.peer.short()))
    }
}

/// Rendezvous between `accept_from` and inbound dials
#[derive(Debug, Clone, Default)]
pub struct PendingDials {
    slots: Arc<Mutex<HashMap<PeerId, oneshot::Sender<FrameChannel>>>>,
}

impl PendingDials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm for `peer`, replacing any earlier arming
    pub fn arm(&self, peer: PeerId) -> PendingAccept {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(peer, tx);
        PendingAccept { peer, rx }
    }

    /// Hand an inbound channel to whoever armed for its peer.
    ///
    /// Gives the channel back if nobody is waiting.
    pub fn deliver(&self, channel: FrameChannel) -> Result<(), FrameChannel> {
        let peer = channel.remote();
        let slot = self.slots.lock().remove(&peer);
        match slot {
            Some(tx) => tx.send(channel).inspect_err(|_| {
                debug!(peer = %peer.short(), "Accept abandoned before dial arrived");
            }),
            None => Err(channel),
        }
    }

    pub fn is_armed(&self, peer: &PeerId) -> bool {
        self.slots.lock().contains_key(peer)
    }
}
