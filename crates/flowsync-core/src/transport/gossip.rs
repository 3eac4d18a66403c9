//! iroh-based transport
//!
//! Discovery runs on an iroh-gossip topic: `NeighborUp` / `NeighborDown`
//! become connection events, and signaling frames are broadcast on the topic
//! wrapped in a [`RoutedFrame`] naming sender and recipient, then
//! demultiplexed into one link per peer.
//!
//! Only the gossip active view raises `NeighborUp`, so in a large swarm a
//! peer opens channels to a few neighbors rather than to everyone. Edits
//! cross one intermediate neighbor through the session's operation relay;
//! peers further apart than that do not see each other's edits live.
//!
//! Direct channels are QUIC connections on [`COLLAB_ALPN`] carrying one
//! bi-stream framed with `LengthDelimitedCodec`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, EndpointId, PublicKey, RelayUrl};
use iroh_gossip::api::{Event, GossipReceiver, GossipSender};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use super::{
    DirectConnector, DiscoveryEvent, DiscoveryHandle, DiscoverySwarm, FrameChannel,
    PendingAccept, PendingDials, DISCOVERY_EVENT_CAPACITY,
};
use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};
use crate::identity::PeerIdentity;
use crate::types::{DiscoveryTopic, PeerId};

/// ALPN of the direct collaboration channel
pub const COLLAB_ALPN: &[u8] = b"flowsync/collab/1";

/// Signaling messages are small; cap gossip frames well below the data path.
const SIGNALING_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// First frame on every direct stream, so the acceptor sees the stream open.
const STREAM_HELLO: &[u8] = b"flowsync-hello";

/// Signaling frame as broadcast on the gossip topic
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoutedFrame {
    from: PeerId,
    to: PeerId,
    body: String,
}

/// How to reach this endpoint, exchanged as the handshake description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointDescription {
    endpoint_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relay_url: Option<String>,
}

fn public_key(peer: &PeerId) -> CollabResult<PublicKey> {
    PublicKey::from_bytes(peer.as_bytes())
        .map_err(|e| CollabError::Network(format!("invalid endpoint id {}: {}", peer.short(), e)))
}

/// Parse a bootstrap entry: `<endpoint id hex>` or `<endpoint id hex>@<ip:port>`
fn parse_bootstrap(entry: &str) -> CollabResult<EndpointAddr> {
    let (id, addr) = match entry.split_once('@') {
        Some((id, addr)) => (id, Some(addr)),
        None => (entry, None),
    };
    let peer: PeerId = id.parse()?;
    let mut endpoint_addr = EndpointAddr::new(public_key(&peer)?);
    if let Some(addr) = addr {
        let socket_addr: SocketAddr = addr
            .parse()
            .map_err(|e| CollabError::Network(format!("invalid bootstrap address {}: {}", addr, e)))?;
        endpoint_addr = endpoint_addr.with_ip_addr(socket_addr);
    }
    Ok(endpoint_addr)
}

/// Production transport: one iroh endpoint serving gossip and direct channels
pub struct GossipTransport {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    /// Static discovery provider for out-of-band peer addresses
    static_provider: StaticProvider,
    local: PeerId,
    bootstrap: Vec<EndpointId>,
    dials: PendingDials,
    remote_candidates: Mutex<HashMap<PeerId, Vec<SocketAddr>>>,
    topics: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_handle: AtomicU64,
    max_frame_size: usize,
}

impl std::fmt::Debug for GossipTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipTransport")
            .field("local", &self.local)
            .field("bootstrap", &self.bootstrap.len())
            .finish()
    }
}

impl GossipTransport {
    /// Bind an endpoint for `identity` and start gossip and the collab handler
    pub async fn bind(identity: &PeerIdentity, config: &CollabConfig) -> CollabResult<Self> {
        let static_provider = StaticProvider::new();

        let mut bootstrap = Vec::with_capacity(config.bootstrap_peers.len());
        for entry in &config.bootstrap_peers {
            let addr = parse_bootstrap(entry)?;
            bootstrap.push(addr.id);
            static_provider.add_endpoint_info(addr);
        }

        let endpoint = Endpoint::builder()
            .secret_key(identity.secret_key().clone())
            .alpns(vec![GOSSIP_ALPN.to_vec(), COLLAB_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| CollabError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, bootstrap = bootstrap.len(), "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(SIGNALING_MAX_MESSAGE_SIZE)
            .spawn(endpoint.clone());

        let dials = PendingDials::new();
        let handler = CollabProtocolHandler {
            dials: dials.clone(),
            max_frame_size: config.max_frame_size,
        };
        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .accept(COLLAB_ALPN, handler)
            .spawn();

        Ok(Self {
            endpoint,
            gossip,
            router,
            static_provider,
            local: identity.peer_id(),
            bootstrap,
            dials,
            remote_candidates: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            max_frame_size: config.max_frame_size,
        })
    }

    /// This endpoint's current address, for handing to peers out of band
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Make a peer's address known without a discovery service
    pub fn add_peer_addr(&self, endpoint_addr: EndpointAddr) {
        info!(peer = %endpoint_addr.id, "Adding peer address to static discovery");
        self.static_provider.add_endpoint_info(endpoint_addr);
    }

    /// Stop all topics and close the endpoint
    pub async fn shutdown(&self) {
        for (_, task) in self.topics.lock().drain() {
            task.abort();
        }
        if let Err(e) = self.router.shutdown().await {
            warn!(error = %e, "Router shutdown failed");
        }
    }
}

impl DiscoverySwarm for GossipTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn join(
        &self,
        topic: DiscoveryTopic,
    ) -> CollabResult<(DiscoveryHandle, mpsc::Receiver<DiscoveryEvent>)> {
        let topic_id = TopicId::from_bytes(*topic.as_bytes());
        info!(%topic, peer_count = self.bootstrap.len(), "Subscribing to discovery topic");

        let (sender, receiver) = self
            .gossip
            .subscribe(topic_id, self.bootstrap.clone())
            .await
            .map_err(|e| CollabError::Discovery(format!("Failed to subscribe: {}", e)))?
            .split();

        let (events_tx, events_rx) = mpsc::channel(DISCOVERY_EVENT_CAPACITY);
        let router = SignalRouter::new(self.local, topic, sender, events_tx);
        let task = tokio::spawn(router.run(receiver));

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.topics.lock().insert(id, task);
        Ok((DiscoveryHandle::new(topic, id), events_rx))
    }

    async fn leave(&self, handle: DiscoveryHandle) {
        if let Some(task) = self.topics.lock().remove(&handle.id()) {
            task.abort();
            info!(topic = %handle.topic(), "Left discovery topic");
        }
    }
}

impl DirectConnector for GossipTransport {
    fn local_description(&self) -> String {
        let addr = self.endpoint.addr();
        let description = EndpointDescription {
            endpoint_id: self.local,
            relay_url: addr.relay_urls().next().map(|url| url.to_string()),
        };
        serde_json::to_string(&description).unwrap_or_default()
    }

    fn local_candidates(&self) -> Vec<String> {
        self.endpoint
            .addr()
            .ip_addrs()
            .map(|addr| addr.to_string())
            .collect()
    }

    fn add_remote_candidate(&self, peer: PeerId, candidate: &str) -> CollabResult<()> {
        let addr: SocketAddr = candidate
            .parse()
            .map_err(|e| CollabError::Handshake(format!("invalid candidate {}: {}", candidate, e)))?;
        self.remote_candidates.lock().entry(peer).or_default().push(addr);
        Ok(())
    }

    async fn dial(&self, peer: PeerId, description: &str) -> CollabResult<FrameChannel> {
        let description: EndpointDescription = serde_json::from_str(description)
            .map_err(|e| CollabError::Handshake(format!("invalid description: {}", e)))?;
        if description.endpoint_id != peer {
            return Err(CollabError::Handshake(
                "description does not belong to the dialed peer".into(),
            ));
        }

        let mut addr = EndpointAddr::new(public_key(&peer)?);
        if let Some(relay) = &description.relay_url {
            let relay_url: RelayUrl = relay
                .parse()
                .map_err(|e| CollabError::Handshake(format!("invalid relay url: {}", e)))?;
            addr = addr.with_relay_url(relay_url);
        }
        let candidates = self.remote_candidates.lock().remove(&peer).unwrap_or_default();
        for candidate in candidates {
            addr = addr.with_ip_addr(candidate);
        }
        self.static_provider.add_endpoint_info(addr.clone());

        let conn = self
            .endpoint
            .connect(addr, COLLAB_ALPN)
            .await
            .map_err(|e| CollabError::Network(format!("Failed to connect: {}", e)))?;
        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| CollabError::Network(format!("Failed to open stream: {}", e)))?;

        let channel = spawn_stream_pumps(peer, conn, send, recv, self.max_frame_size);
        channel.send(STREAM_HELLO.to_vec())?;
        debug!(peer = %peer.short(), "Direct channel dialed");
        Ok(channel)
    }

    fn accept_from(&self, peer: PeerId) -> PendingAccept {
        self.dials.arm(peer)
    }
}

/// Demultiplexes one gossip topic into per-peer signaling links
struct SignalRouter {
    local: PeerId,
    topic: DiscoveryTopic,
    sender: GossipSender,
    events: mpsc::Sender<DiscoveryEvent>,
    links: HashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>,
    wire_tx: mpsc::UnboundedSender<(PeerId, Vec<u8>)>,
    wire_rx: mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>,
}

impl SignalRouter {
    fn new(
        local: PeerId,
        topic: DiscoveryTopic,
        sender: GossipSender,
        events: mpsc::Sender<DiscoveryEvent>,
    ) -> Self {
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        Self {
            local,
            topic,
            sender,
            events,
            links: HashMap::new(),
            wire_tx,
            wire_rx,
        }
    }

    async fn run(mut self, mut receiver: GossipReceiver) {
        use n0_future::StreamExt as _;

        loop {
            tokio::select! {
                event = receiver.try_next() => {
                    let keep_going = match event {
                        Ok(Some(event)) => self.on_gossip_event(event).await,
                        Ok(None) => false,
                        Err(e) => {
                            warn!(topic = %self.topic, error = ?e, "Error receiving from topic");
                            false
                        }
                    };
                    if !keep_going {
                        break;
                    }
                }
                Some((peer, body)) = self.wire_rx.recv() => {
                    self.broadcast(peer, body).await;
                }
            }
        }
        debug!(topic = %self.topic, "Discovery topic closed");
    }

    async fn on_gossip_event(&mut self, event: Event) -> bool {
        match event {
            Event::NeighborUp(key) => {
                let peer = PeerId::from(key);
                info!(topic = %self.topic, peer = %peer.short(), "Neighbor joined");
                self.open_link(peer).await
            }
            Event::NeighborDown(key) => {
                let peer = PeerId::from(key);
                info!(topic = %self.topic, peer = %peer.short(), "Neighbor left");
                if self.links.remove(&peer).is_some() {
                    return self.events.send(DiscoveryEvent::Disconnection { peer }).await.is_ok();
                }
                true
            }
            Event::Received(msg) => {
                let frame: RoutedFrame = match serde_json::from_slice(&msg.content) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(topic = %self.topic, error = %e, "Ignoring non-signaling gossip frame");
                        return true;
                    }
                };
                if frame.to != self.local {
                    return true;
                }
                // Peers reached through the swarm but not direct neighbors get a link on first contact.
                if !self.links.contains_key(&frame.from) && !self.open_link(frame.from).await {
                    return false;
                }
                if let Some(link) = self.links.get(&frame.from) {
                    if link.send(frame.body.into_bytes()).is_err() {
                        self.links.remove(&frame.from);
                    }
                }
                true
            }
            Event::Lagged => {
                warn!(topic = %self.topic, "Lagged behind on topic");
                true
            }
        }
    }

    async fn open_link(&mut self, peer: PeerId) -> bool {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let wire_tx = self.wire_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if wire_tx.send((peer, frame)).is_err() {
                    break;
                }
            }
        });

        self.links.insert(peer, inbound_tx);
        let link = FrameChannel::new(peer, outbound_tx, inbound_rx);
        self.events
            .send(DiscoveryEvent::Connection { peer, link })
            .await
            .is_ok()
    }

    async fn broadcast(&self, to: PeerId, body: Vec<u8>) {
        let body = match String::from_utf8(body) {
            Ok(body) => body,
            Err(_) => {
                warn!(peer = %to.short(), "Dropping non-UTF-8 signaling frame");
                return;
            }
        };
        let frame = RoutedFrame {
            from: self.local,
            to,
            body,
        };
        let data = match serde_json::to_vec(&frame) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to encode signaling frame");
                return;
            }
        };
        if let Err(e) = self.sender.broadcast(Bytes::from(data)).await {
            warn!(topic = %self.topic, error = %e, "Failed to broadcast signaling frame");
        }
    }
}

/// Wire a QUIC bi-stream to a [`FrameChannel`] with two pump tasks
fn spawn_stream_pumps(
    remote: PeerId,
    conn: Connection,
    send: SendStream,
    recv: RecvStream,
    max_frame_size: usize,
) -> FrameChannel {
    let codec = || {
        LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_size)
            .new_codec()
    };
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let mut writer = FramedWrite::new(send, codec());
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = writer.send(Bytes::from(frame)).await {
                debug!(peer = %remote.short(), error = %e, "Direct channel write failed");
                break;
            }
        }
        let _ = writer.into_inner().finish();
    });

    let mut reader = FramedRead::new(recv, codec());
    tokio::spawn(async move {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(bytes) => {
                    if inbound_tx.send(bytes.to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(peer = %remote.short(), error = %e, "Direct channel read failed");
                    break;
                }
            }
        }
        conn.close(0u32.into(), b"channel closed");
    });

    FrameChannel::new(remote, outbound_tx, inbound_rx)
}

/// Accepts direct channels on [`COLLAB_ALPN`] for peers we armed for
#[derive(Clone)]
struct CollabProtocolHandler {
    dials: PendingDials,
    max_frame_size: usize,
}

impl std::fmt::Debug for CollabProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabProtocolHandler").finish()
    }
}

impl CollabProtocolHandler {
    async fn handle_connection(
        conn: Connection,
        dials: PendingDials,
        max_frame_size: usize,
    ) -> CollabResult<()> {
        let peer = PeerId::from(conn.remote_id());
        if !dials.is_armed(&peer) {
            warn!(peer = %peer.short(), "Refusing unexpected direct channel");
            conn.close(1u32.into(), b"unexpected");
            return Ok(());
        }

        let (send, recv) = conn
            .accept_bi()
            .await
            .map_err(|e| CollabError::Network(format!("Failed to accept bi stream: {}", e)))?;

        let mut channel = spawn_stream_pumps(peer, conn, send, recv, max_frame_size);
        match channel.recv().await {
            Some(hello) if hello == STREAM_HELLO => {}
            _ => return Err(CollabError::Handshake("missing stream hello".into())),
        }

        if dials.deliver(channel).is_err() {
            debug!(peer = %peer.short(), "Accept was withdrawn before the dial landed");
        } else {
            debug!(peer = %peer.short(), "Direct channel accepted");
        }
        Ok(())
    }
}

impl ProtocolHandler for CollabProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let dials = self.dials.clone();
        let max_frame_size = self.max_frame_size;

        async move {
            debug!(peer = %conn.remote_id(), "Router accepting collab connection");
            if let Err(e) = Self::handle_connection(conn, dials, max_frame_size).await {
                error!(error = ?e, "Failed to handle collab connection");
                return Err(AcceptError::from_err(e));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bootstrap_entries() {
        let peer = PeerId::from(iroh::SecretKey::generate(&mut rand::rng()).public());

        let bare = parse_bootstrap(&peer.to_hex()).unwrap();
        assert_eq!(PeerId::from(bare.id), peer);
        assert_eq!(bare.ip_addrs().count(), 0);

        let with_addr = parse_bootstrap(&format!("{}@127.0.0.1:4433", peer.to_hex())).unwrap();
        assert_eq!(with_addr.ip_addrs().count(), 1);

        assert!(parse_bootstrap("not-a-peer").is_err());
        assert!(parse_bootstrap(&format!("{}@nowhere", peer.to_hex())).is_err());
    }

    #[test]
    fn test_routed_frame_shape() {
        let frame = RoutedFrame {
            from: PeerId::from_bytes([1; 32]),
            to: PeerId::from_bytes([2; 32]),
            body: r#"{"type":"offer"}"#.into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["from"], PeerId::from_bytes([1; 32]).to_hex());
        assert_eq!(value["body"], r#"{"type":"offer"}"#);
    }

    #[test]
    fn test_description_round_trip() {
        let description = EndpointDescription {
            endpoint_id: PeerId::from_bytes([9; 32]),
            relay_url: Some("https://relay.example.com./".into()),
        };
        let json = serde_json::to_string(&description).unwrap();
        assert!(json.contains("endpointId"));
        let back: EndpointDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, description);
    }

    #[tokio::test]
    #[ignore = "binds real sockets"]
    async fn test_direct_channel_between_two_endpoints() {
        let config = CollabConfig::default();
        let a_id = PeerIdentity::generate();
        let b_id = PeerIdentity::generate();
        let a = GossipTransport::bind(&a_id, &config).await.unwrap();
        let b = GossipTransport::bind(&b_id, &config).await.unwrap();

        for candidate in b.local_candidates() {
            a.add_remote_candidate(b.local_peer(), &candidate).unwrap();
        }
        let pending = b.accept_from(a.local_peer());
        let mut a_end = a
            .dial(b.local_peer(), &b.local_description())
            .await
            .unwrap();
        let mut b_end = pending.wait().await.unwrap();

        a_end.send(b"over quic".to_vec()).unwrap();
        assert_eq!(b_end.recv().await.unwrap(), b"over quic");

        a.shutdown().await;
        b.shutdown().await;
    }
}
