//! In-process transport for tests and simulations
//!
//! A shared [`MemoryNetwork`] broker routes topic membership and direct dials
//! between [`MemoryTransport`] instances. Joining a topic connects the joiner
//! to every current member; leaving, or [`MemoryNetwork::sever`], reports a
//! disconnection on both sides. Nothing here is used by production paths.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    DirectConnector, DiscoveryEvent, DiscoveryHandle, DiscoverySwarm, FrameChannel,
    PendingAccept, PendingDials, DISCOVERY_EVENT_CAPACITY,
};
use crate::error::{CollabError, CollabResult};
use crate::types::{DiscoveryTopic, PeerId};

const DESCRIPTION_PREFIX: &str = "memory:";
const CANDIDATE_PREFIX: &str = "memory-route:";

struct Member {
    handle_id: u64,
    events: mpsc::Sender<DiscoveryEvent>,
}

#[derive(Default)]
struct NetworkState {
    next_handle: u64,
    offline: bool,
    topics: HashMap<DiscoveryTopic, HashMap<PeerId, Member>>,
    dials: HashMap<PeerId, PendingDials>,
}

fn notify(member: &Member, event: DiscoveryEvent) {
    if let Err(e) = member.events.try_send(event) {
        warn!(error = %e, "Dropping discovery event for slow or departed member");
    }
}

/// Shared broker connecting [`MemoryTransport`] instances
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryNetwork")
            .field("topics", &state.topics.len())
            .field("offline", &state.offline)
            .finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this network
    pub fn transport(&self, local: PeerId) -> MemoryTransport {
        MemoryTransport::new(self, local)
    }

    /// While offline every `join` fails with a discovery error
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Members currently joined to `topic`
    pub fn peers_on(&self, topic: &DiscoveryTopic) -> Vec<PeerId> {
        let state = self.state.lock();
        let mut peers: Vec<PeerId> = state
            .topics
            .get(topic)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Drop the connection between two peers on every topic they share.
    ///
    /// Both sides see a `Disconnection`. They stay members and are not
    /// reconnected.
    pub fn sever(&self, a: PeerId, b: PeerId) {
        let state = self.state.lock();
        for (topic, members) in &state.topics {
            if let (Some(ma), Some(mb)) = (members.get(&a), members.get(&b)) {
                info!(%topic, a = %a.short(), b = %b.short(), "Severing memory link");
                notify(ma, DiscoveryEvent::Disconnection { peer: b });
                notify(mb, DiscoveryEvent::Disconnection { peer: a });
            }
        }
    }

    fn register(&self, local: PeerId, dials: PendingDials) {
        self.state.lock().dials.insert(local, dials);
    }

    fn join(
        &self,
        local: PeerId,
        topic: DiscoveryTopic,
    ) -> CollabResult<(DiscoveryHandle, mpsc::Receiver<DiscoveryEvent>)> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(CollabError::Discovery("memory network is offline".into()));
        }

        state.next_handle += 1;
        let handle_id = state.next_handle;
        let (tx, rx) = mpsc::channel(DISCOVERY_EVENT_CAPACITY);
        let me = Member {
            handle_id,
            events: tx,
        };

        let members = state.topics.entry(topic).or_default();
        for (peer, member) in members.iter() {
            let (mine, theirs) = FrameChannel::pair(local, *peer);
            notify(
                member,
                DiscoveryEvent::Connection {
                    peer: local,
                    link: theirs,
                },
            );
            notify(
                &me,
                DiscoveryEvent::Connection {
                    peer: *peer,
                    link: mine,
                },
            );
        }
        debug!(%topic, peer = %local.short(), existing = members.len(), "Joined memory topic");
        members.insert(local, me);

        Ok((DiscoveryHandle::new(topic, handle_id), rx))
    }

    fn leave(&self, local: PeerId, handle: &DiscoveryHandle) {
        let mut state = self.state.lock();
        let Some(members) = state.topics.get_mut(&handle.topic()) else {
            return;
        };
        if members.get(&local).map(|m| m.handle_id) != Some(handle.id()) {
            return;
        }

        members.remove(&local);
        for member in members.values() {
            notify(member, DiscoveryEvent::Disconnection { peer: local });
        }
        if members.is_empty() {
            state.topics.remove(&handle.topic());
        }
        debug!(topic = %handle.topic(), peer = %local.short(), "Left memory topic");
    }

    fn dial(&self, from: PeerId, to: PeerId) -> CollabResult<FrameChannel> {
        let dials = self
            .state
            .lock()
            .dials
            .get(&to)
            .cloned()
            .ok_or_else(|| CollabError::Network(format!("peer {} is not on the network", to.short())))?;

        let (mine, theirs) = FrameChannel::pair(from, to);
        dials
            .deliver(theirs)
            .map_err(|_| CollabError::Handshake(format!("peer {} is not accepting", to.short())))?;
        Ok(mine)
    }
}

/// One peer's view of a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    local: PeerId,
    network: MemoryNetwork,
    dials: PendingDials,
}

impl MemoryTransport {
    pub fn new(network: &MemoryNetwork, local: PeerId) -> Self {
        let dials = PendingDials::new();
        network.register(local, dials.clone());
        Self {
            local,
            network: network.clone(),
            dials,
        }
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl DiscoverySwarm for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn join(
        &self,
        topic: DiscoveryTopic,
    ) -> CollabResult<(DiscoveryHandle, mpsc::Receiver<DiscoveryEvent>)> {
        self.network.join(self.local, topic)
    }

    async fn leave(&self, handle: DiscoveryHandle) {
        self.network.leave(self.local, &handle);
    }
}

impl DirectConnector for MemoryTransport {
    fn local_description(&self) -> String {
        format!("{}{}", DESCRIPTION_PREFIX, self.local.to_hex())
    }

    fn local_candidates(&self) -> Vec<String> {
        vec![format!("{}{}", CANDIDATE_PREFIX, self.local.short())]
    }

    fn add_remote_candidate(&self, peer: PeerId, candidate: &str) -> CollabResult<()> {
        if candidate.starts_with(CANDIDATE_PREFIX) {
            debug!(peer = %peer.short(), candidate, "Remote candidate");
            Ok(())
        } else {
            Err(CollabError::Handshake(format!("unknown candidate {:?}", candidate)))
        }
    }

    async fn dial(&self, peer: PeerId, description: &str) -> CollabResult<FrameChannel> {
        let expected = format!("{}{}", DESCRIPTION_PREFIX, peer.to_hex());
        if description != expected {
            return Err(CollabError::Handshake(
                "description does not belong to the dialed peer".into(),
            ));
        }
        self.network.dial(self.local, peer)
    }

    fn accept_from(&self, peer: PeerId) -> PendingAccept {
        self.dials.arm(peer)
    }
}
