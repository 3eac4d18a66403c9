//! Message dispatch for one session, free of I/O
//!
//! [`SyncProtocol`] owns the peer table, the active flowchart key and the
//! outstanding snapshot requests. Each input (a frame, a channel opening, a
//! timer tick, a local edit) returns [`Directive`]s that the session executes
//! against the network and the state sink.
//!
//! ## Key gating
//!
//! | local key | message key | accepted types                          |
//! |-----------|-------------|-----------------------------------------|
//! | `A`       | `A`         | all                                     |
//! | `A`       | `B`         | `active-flowchart` (adoption rules)     |
//! | `A`       | none        | `user-info`, `cursor-position`          |
//! | none      | `B`         | `active-flowchart`, presence            |
//! | none      | none        | `user-info`, `cursor-position`          |
//!
//! ## Snapshot requests
//!
//! A side waiting for a flowchart asks each announcing peer once. Unanswered
//! requests are re-sent to every connected peer with doubling waits; after
//! the configured number of retries the session reports that it is waiting
//! for peers. A snapshot is only accepted while a request is outstanding.
//!
//! ## Operation relay
//!
//! A node or edge operation that arrives straight from its author and
//! changes the local document is forwarded to every other connected peer,
//! keeping the author as `source` and its `opId`. Copies whose `source`
//! differs from the sending peer are never forwarded, so an edit travels at
//! most two hops. Every (author, `opId`) pair is applied once; later copies
//! of an older update cannot overwrite a newer one.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde_json::Value;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::events::LocalEdit;
use super::protocol::{CollabMessage, Envelope, ACTIVE_FLOWCHART, FLOWCHART_DATA, PRESENCE_TYPES};
use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};
use crate::flowchart::{OpOutcome, ReplicationState};
use crate::types::{
    ConnectionState, CursorPosition, FlowchartKey, FlowchartSnapshot, PeerId, PeerInfo, UserInfo,
};

/// How the session came to hold its active key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    /// We shared the flowchart
    Created,
    /// The user joined with an explicit key
    Joined,
    /// Picked up from a peer's `active-flowchart` announcement
    Adopted { from_creator: bool },
}

#[derive(Debug, Clone)]
struct ActiveKey {
    key: FlowchartKey,
    origin: KeyOrigin,
    awaiting_snapshot: bool,
}

/// Side effect requested by [`SyncProtocol`]
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Send to one peer's data channel
    Send { peer: PeerId, envelope: Envelope },
    /// Send to every open data channel
    Broadcast(Envelope),
    /// The active key changed to one announced by a peer
    AdoptKey(FlowchartKey),
    /// The replicated flowchart changed
    StateChanged,
    /// The peer table changed
    PeersChanged,
    /// Opaque update for the state sink
    RemoteUpdate { peer: PeerId, payload: Value },
}

#[derive(Debug, Clone)]
struct PendingRequest {
    asked: BTreeSet<PeerId>,
    retries: u32,
    deadline: Instant,
    exhausted: bool,
}

/// Snapshot requests awaiting a reply, by flowchart key
#[derive(Debug, Default)]
pub struct PendingRequestSet {
    entries: HashMap<FlowchartKey, PendingRequest>,
}

impl PendingRequestSet {
    pub fn contains(&self, key: &FlowchartKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `peer` was already asked for `key`
    pub fn asked(&self, key: &FlowchartKey, peer: &PeerId) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.asked.contains(peer))
    }

    /// All retries used up without a reply
    pub fn is_exhausted(&self, key: &FlowchartKey) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.exhausted)
    }

    /// Record a request to `peer`. An exhausted entry starts over.
    fn record(&mut self, key: FlowchartKey, peer: PeerId, now: Instant, wait: Duration) {
        let entry = self.entries.entry(key).or_insert_with(|| PendingRequest {
            asked: BTreeSet::new(),
            retries: 0,
            deadline: now + wait,
            exhausted: false,
        });
        if entry.exhausted {
            entry.exhausted = false;
            entry.retries = 0;
            entry.deadline = now + wait;
        }
        entry.asked.insert(peer);
    }

    fn clear(&mut self, key: &FlowchartKey) -> bool {
        self.entries.remove(key).is_some()
    }

    fn clear_all(&mut self) {
        self.entries.clear();
    }

    fn forget_peer(&mut self, peer: &PeerId) {
        for entry in self.entries.values_mut() {
            entry.asked.remove(peer);
        }
    }

    /// Earliest retry deadline, ignoring exhausted entries
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|entry| !entry.exhausted)
            .map(|entry| entry.deadline)
            .min()
    }

    fn due(&self, now: Instant) -> Vec<FlowchartKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.exhausted && entry.deadline <= now)
            .map(|(key, _)| *key)
            .collect()
    }
}

/// Operations remembered per session for duplicate suppression
const SEEN_OPERATIONS: usize = 4096;

/// Recently applied (author, op id) pairs, oldest evicted first
#[derive(Debug, Default)]
struct SeenOperations {
    order: VecDeque<(PeerId, u64)>,
    set: HashSet<(PeerId, u64)>,
}

impl SeenOperations {
    /// False when the pair was already seen
    fn insert(&mut self, author: PeerId, op_id: u64) -> bool {
        if !self.set.insert((author, op_id)) {
            return false;
        }
        self.order.push_back((author, op_id));
        if self.order.len() > SEEN_OPERATIONS {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        true
    }
}

/// Protocol state machine for one collaboration session
pub struct SyncProtocol {
    local: PeerId,
    user: UserInfo,
    state: ReplicationState,
    config: CollabConfig,
    active: Option<ActiveKey>,
    peers: BTreeMap<PeerId, PeerInfo>,
    pending: PendingRequestSet,
    seen: SeenOperations,
}

impl std::fmt::Debug for SyncProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProtocol")
            .field("local", &self.local)
            .field("active", &self.active)
            .field("peers", &self.peers.len())
            .field("pending", &self.pending)
            .finish()
    }
}

impl SyncProtocol {
    pub fn new(local: PeerId, user: UserInfo, state: ReplicationState, config: CollabConfig) -> Self {
        Self {
            local,
            user,
            state,
            config,
            active: None,
            peers: BTreeMap::new(),
            pending: PendingRequestSet::default(),
            seen: SeenOperations::default(),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn state(&self) -> &ReplicationState {
        &self.state
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    pub fn active_key(&self) -> Option<FlowchartKey> {
        self.active.as_ref().map(|a| a.key)
    }

    pub fn key_origin(&self) -> Option<KeyOrigin> {
        self.active.as_ref().map(|a| a.origin)
    }

    /// Holding a key whose content has not arrived yet
    pub fn is_awaiting_snapshot(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.awaiting_snapshot)
    }

    /// Snapshot requests went unanswered through every retry
    pub fn is_waiting_for_peers(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.awaiting_snapshot && self.pending.is_exhausted(&a.key))
    }

    pub fn pending(&self) -> &PendingRequestSet {
        &self.pending
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.next_deadline()
    }

    /// Peer table, ordered by id
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.values().cloned().collect()
    }

    pub fn peer(&self, id: &PeerId) -> Option<&PeerInfo> {
        self.peers.get(id)
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_connected()).count()
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| p.is_connected())
            .map(|p| p.peer_id)
            .collect()
    }

    fn envelope(&self, message: CollabMessage) -> Envelope {
        Envelope::new(message, self.active_key(), self.local)
    }

    fn announcement(&self) -> Option<Envelope> {
        let active = self.active.as_ref()?;
        Some(self.envelope(CollabMessage::ActiveFlowchart {
            creator: active.origin == KeyOrigin::Created,
        }))
    }

    fn broadcast_if_connected(&self, envelope: Option<Envelope>) -> Vec<Directive> {
        match envelope {
            Some(envelope) if self.connected_count() > 0 => vec![Directive::Broadcast(envelope)],
            _ => Vec::new(),
        }
    }

    fn set_active(&mut self, key: FlowchartKey, origin: KeyOrigin, awaiting_snapshot: bool) {
        self.pending.clear_all();
        self.active = Some(ActiveKey {
            key,
            origin,
            awaiting_snapshot,
        });
    }

    // ---- local intents ----

    /// Start sharing under `key` as its creator
    pub fn share(&mut self, key: FlowchartKey) -> Vec<Directive> {
        self.set_active(key, KeyOrigin::Created, false);
        self.broadcast_if_connected(self.announcement())
    }

    /// Start waiting for the flowchart behind `key`
    pub fn join(&mut self, key: FlowchartKey) -> Vec<Directive> {
        self.set_active(key, KeyOrigin::Joined, true);
        self.broadcast_if_connected(self.announcement())
    }

    /// Drop the active key and forget every peer
    pub fn leave(&mut self) -> Vec<Directive> {
        self.active = None;
        self.pending.clear_all();
        if self.peers.is_empty() {
            return Vec::new();
        }
        self.peers.clear();
        vec![Directive::PeersChanged]
    }

    pub fn set_user(&mut self, user: UserInfo) -> Vec<Directive> {
        self.user = user;
        self.broadcast_if_connected(Some(self.envelope(CollabMessage::user_info(&self.user))))
    }

    /// Apply a local edit and relay it when sharing
    pub fn local_edit(&mut self, edit: LocalEdit) -> (OpOutcome, Vec<Directive>) {
        let (outcome, message) = match edit {
            LocalEdit::Node(operation) => (
                self.state.apply_node_op(&operation),
                CollabMessage::NodeOperation { operation },
            ),
            LocalEdit::Edge(operation) => (
                self.state.apply_edge_op(&operation),
                CollabMessage::EdgeOperation { operation },
            ),
        };
        if !outcome.is_applied() || self.active.is_none() {
            return (outcome, Vec::new());
        }
        let envelope = self.envelope(message).with_op_id();
        if let Some(op_id) = envelope.op_id {
            self.seen.insert(self.local, op_id);
        }
        (outcome, self.broadcast_if_connected(Some(envelope)))
    }

    pub fn cursor(&mut self, position: CursorPosition) -> Vec<Directive> {
        if self.active.is_none() {
            return Vec::new();
        }
        self.broadcast_if_connected(Some(self.envelope(CollabMessage::cursor(position))))
    }

    pub fn flowchart_update(&mut self, payload: Value) -> CollabResult<Vec<Directive>> {
        if self.active.is_none() {
            return Err(CollabError::NotSharing);
        }
        Ok(self.broadcast_if_connected(Some(
            self.envelope(CollabMessage::FlowchartUpdate { payload }),
        )))
    }

    // ---- peer lifecycle ----

    /// A peer showed up on the discovery topic
    pub fn peer_discovered(&mut self, peer: PeerId) -> Vec<Directive> {
        if self.peers.contains_key(&peer) {
            return Vec::new();
        }
        self.peers.insert(peer, PeerInfo::new(peer));
        vec![Directive::PeersChanged]
    }

    /// The direct channel to `peer` opened: introduce ourselves
    pub fn channel_open(&mut self, peer: PeerId) -> Vec<Directive> {
        let info = self.peers.entry(peer).or_insert_with(|| PeerInfo::new(peer));
        info.connection_state = ConnectionState::Connected;
        info.touch();

        let mut directives = vec![
            Directive::PeersChanged,
            Directive::Send {
                peer,
                envelope: self.envelope(CollabMessage::user_info(&self.user)).to(peer),
            },
        ];
        if let Some(announcement) = self.announcement() {
            directives.push(Directive::Send {
                peer,
                envelope: announcement.to(peer),
            });
        }
        directives
    }

    /// The peer is gone; nothing more is dispatched to or from it
    pub fn peer_lost(&mut self, peer: PeerId) -> Vec<Directive> {
        self.pending.forget_peer(&peer);
        match self.peers.remove(&peer) {
            Some(_) => vec![Directive::PeersChanged],
            None => Vec::new(),
        }
    }

    // ---- inbound ----

    /// Decode and dispatch one data-channel frame from `peer`
    ///
    /// Errors mean the frame was discarded; session state is unchanged.
    pub fn handle_inbound(
        &mut self,
        peer: PeerId,
        frame: &[u8],
        now: Instant,
    ) -> CollabResult<Vec<Directive>> {
        if !self.peers.contains_key(&peer) {
            trace!(peer = %peer.short(), "Dropping frame from unknown peer");
            return Ok(Vec::new());
        }

        let value: Value = serde_json::from_slice(frame)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let key = match value.get("flowchartKey") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(FlowchartKey::parse(s).map_err(|_| {
                CollabError::CrossFlowchartMessage(format!("unreadable key on {}", kind))
            })?),
            Some(_) => {
                return Err(CollabError::CrossFlowchartMessage(format!(
                    "unreadable key on {}",
                    kind
                )))
            }
        };
        self.authorize(&kind, key.as_ref())?;

        let envelope: Envelope = serde_json::from_value(value).map_err(|e| {
            if kind == FLOWCHART_DATA {
                CollabError::MalformedSnapshot(e.to_string())
            } else {
                CollabError::from(e)
            }
        })?;
        if envelope.target.is_some_and(|target| target != self.local) {
            trace!(peer = %peer.short(), kind, "Dropping frame addressed to another peer");
            return Ok(Vec::new());
        }
        if let Some(info) = self.peers.get_mut(&peer) {
            info.touch();
        }

        Ok(match envelope.message {
            CollabMessage::UserInfo {
                display_name,
                color,
            } => {
                if let Some(info) = self.peers.get_mut(&peer) {
                    info.apply_user_info(&UserInfo::new(display_name, color));
                }
                vec![Directive::PeersChanged]
            }
            CollabMessage::CursorPosition { x, y } => {
                if let Some(info) = self.peers.get_mut(&peer) {
                    info.cursor = Some(CursorPosition { x, y });
                }
                vec![Directive::PeersChanged]
            }
            CollabMessage::ActiveFlowchart { creator } => {
                let key = key.ok_or_else(|| {
                    CollabError::CrossFlowchartMessage("announcement without key".into())
                })?;
                self.on_announcement(peer, key, creator, now)?
            }
            CollabMessage::RequestFlowchart => self.on_request(peer),
            CollabMessage::FlowchartData {
                properties,
                nodes,
                edges,
            } => self.on_snapshot(
                peer,
                FlowchartSnapshot {
                    properties,
                    nodes,
                    edges,
                },
            ),
            CollabMessage::FlowchartUpdate { payload } => {
                vec![Directive::RemoteUpdate { peer, payload }]
            }
            CollabMessage::NodeOperation { .. } | CollabMessage::EdgeOperation { .. }
                if !self.first_sighting(&envelope) =>
            {
                trace!(peer = %peer.short(), "Dropping operation already applied");
                Vec::new()
            }
            CollabMessage::NodeOperation { ref operation } => {
                let outcome = self.state.apply_node_op(operation);
                let id = operation.id().to_owned();
                self.after_remote_op(peer, &id, outcome, envelope)
            }
            CollabMessage::EdgeOperation { ref operation } => {
                let outcome = self.state.apply_edge_op(operation);
                let id = operation.id().to_owned();
                self.after_remote_op(peer, &id, outcome, envelope)
            }
        })
    }

    fn authorize(&self, kind: &str, key: Option<&FlowchartKey>) -> CollabResult<()> {
        let presence = PRESENCE_TYPES.contains(&kind);
        let allowed = match (self.active_key(), key) {
            (Some(active), Some(key)) => active == *key || kind == ACTIVE_FLOWCHART,
            (None, Some(_)) => presence || kind == ACTIVE_FLOWCHART,
            (_, None) => presence,
        };
        if allowed {
            return Ok(());
        }
        let label = key.map(|k| k.short()).unwrap_or_else(|| "no key".into());
        debug!(kind, key = %label, "Discarding message for another flowchart");
        Err(CollabError::CrossFlowchartMessage(label))
    }

    fn on_announcement(
        &mut self,
        peer: PeerId,
        key: FlowchartKey,
        creator: bool,
        now: Instant,
    ) -> CollabResult<Vec<Directive>> {
        let Some(active) = self.active.as_ref() else {
            info!(peer = %peer.short(), key = %key.short(), creator, "Adopting announced flowchart");
            self.set_active(key, KeyOrigin::Adopted { from_creator: creator }, true);
            return Ok(vec![Directive::AdoptKey(key), self.request(peer, key, now)]);
        };

        if active.key == key {
            if active.awaiting_snapshot && !self.pending.asked(&key, &peer) {
                return Ok(vec![self.request(peer, key, now)]);
            }
            return Ok(Vec::new());
        }

        let replaceable = active.origin == KeyOrigin::Adopted { from_creator: false }
            && active.awaiting_snapshot
            && creator;
        if !replaceable {
            debug!(peer = %peer.short(), key = %key.short(), "Ignoring announcement for another flowchart");
            return Err(CollabError::CrossFlowchartMessage(key.short()));
        }
        info!(
            peer = %peer.short(),
            from = %active.key.short(),
            to = %key.short(),
            "Switching to the creator's flowchart"
        );
        self.set_active(key, KeyOrigin::Adopted { from_creator: true }, true);
        Ok(vec![Directive::AdoptKey(key), self.request(peer, key, now)])
    }

    fn request(&mut self, peer: PeerId, key: FlowchartKey, now: Instant) -> Directive {
        self.pending
            .record(key, peer, now, self.config.snapshot_backoff(1));
        debug!(peer = %peer.short(), key = %key.short(), "Requesting flowchart snapshot");
        Directive::Send {
            peer,
            envelope: self.envelope(CollabMessage::RequestFlowchart).to(peer),
        }
    }

    // A joiner whose cached copy is loaded serves it while it still waits for
    // a fresher one; an empty replica never answers.
    fn on_request(&self, peer: PeerId) -> Vec<Directive> {
        match &self.active {
            Some(active) if !active.awaiting_snapshot || !self.state.is_empty() => {
                debug!(peer = %peer.short(), "Serving flowchart snapshot");
                vec![Directive::Send {
                    peer,
                    envelope: self
                        .envelope(CollabMessage::flowchart_data(self.state.snapshot()))
                        .to(peer),
                }]
            }
            _ => {
                debug!(peer = %peer.short(), "No content to serve yet, ignoring snapshot request");
                Vec::new()
            }
        }
    }

    fn on_snapshot(&mut self, peer: PeerId, snapshot: FlowchartSnapshot) -> Vec<Directive> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        if !self.pending.clear(&active.key) {
            debug!(peer = %peer.short(), "Ignoring unsolicited snapshot");
            return Vec::new();
        }
        active.awaiting_snapshot = false;

        let nodes = snapshot.nodes.len();
        let dropped = self.state.apply_snapshot(snapshot);
        info!(peer = %peer.short(), nodes, dropped_edges = dropped, "Applied flowchart snapshot");
        vec![Directive::StateChanged]
    }

    fn after_remote_op(
        &self,
        peer: PeerId,
        id: &str,
        outcome: OpOutcome,
        envelope: Envelope,
    ) -> Vec<Directive> {
        match outcome {
            OpOutcome::Applied => {
                let mut directives = vec![Directive::StateChanged];
                directives.extend(self.relay(peer, envelope));
                directives
            }
            OpOutcome::NoOp => Vec::new(),
            OpOutcome::Rejected => {
                debug!(peer = %peer.short(), id, "Rejected remote operation");
                Vec::new()
            }
        }
    }

    /// Record the operation's (author, id); operations without an id always pass
    fn first_sighting(&mut self, envelope: &Envelope) -> bool {
        match (envelope.source, envelope.op_id) {
            (Some(author), Some(op_id)) => self.seen.insert(author, op_id),
            _ => true,
        }
    }

    /// Forward an operation received from its author to the other peers
    ///
    /// Discovery only links a peer to its gossip neighbors, so two editors
    /// may share a neighbor without sharing a channel. One hop covers that;
    /// a relayed copy names its author as `source` and is never relayed
    /// again, and peers that already have the edit drop it by id.
    fn relay(&self, peer: PeerId, envelope: Envelope) -> Vec<Directive> {
        if envelope.source != Some(peer) || envelope.op_id.is_none() {
            return Vec::new();
        }
        let targets: Vec<PeerId> = self
            .connected_peers()
            .into_iter()
            .filter(|p| *p != peer)
            .collect();
        if !targets.is_empty() {
            trace!(author = %peer.short(), targets = targets.len(), "Relaying operation");
        }
        targets
            .into_iter()
            .map(|target| Directive::Send {
                peer: target,
                envelope: envelope.clone(),
            })
            .collect()
    }

    // ---- timers ----

    /// Re-send or give up on snapshot requests whose wait has elapsed
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<Directive> {
        let mut directives = Vec::new();
        let connected = self.connected_peers();
        for key in self.pending.due(now) {
            let Some(entry) = self.pending.entries.get_mut(&key) else {
                continue;
            };
            if entry.retries >= self.config.snapshot_max_retries {
                entry.exhausted = true;
                warn!(key = %key.short(), retries = entry.retries, "No peer answered the snapshot request");
                continue;
            }
            entry.retries += 1;
            entry.deadline = now + self.config.snapshot_backoff(entry.retries + 1);
            entry.asked.extend(connected.iter().copied());
            debug!(key = %key.short(), attempt = entry.retries, peers = connected.len(), "Retrying snapshot request");

            for peer in &connected {
                directives.push(Directive::Send {
                    peer: *peer,
                    envelope: Envelope::new(CollabMessage::RequestFlowchart, Some(key), self.local)
                        .to(*peer),
                });
            }
        }
        directives
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Edge, EdgeOperation, Node, NodeOperation, NodePatch, Position};
    use serde_json::json;

    fn protocol(user: &str) -> SyncProtocol {
        let local = PeerId::random();
        let config = CollabConfig::default().with_snapshot_retry(Duration::from_secs(1), 2);
        SyncProtocol::new(
            local,
            UserInfo::new(user, "#111111"),
            ReplicationState::new("fc".into()),
            config,
        )
    }

    fn frame(envelope: &Envelope) -> Vec<u8> {
        envelope.encode().unwrap()
    }

    fn sent_to(directives: &[Directive], peer: PeerId) -> Vec<&CollabMessage> {
        directives
            .iter()
            .filter_map(|d| match d {
                Directive::Send { peer: p, envelope } if *p == peer => Some(&envelope.message),
                _ => None,
            })
            .collect()
    }

    fn add_node(id: &str) -> NodeOperation {
        NodeOperation::Add {
            node: Node::new(id, "process", Position::default()),
        }
    }

    /// Creator with one node and a connected joiner, both with open channels
    fn connected_pair() -> (SyncProtocol, SyncProtocol, FlowchartKey) {
        let key = FlowchartKey::generate();
        let mut creator = protocol("creator");
        let mut joiner = protocol("joiner");
        creator.share(key);
        creator.local_edit(add_node("n1").into());
        joiner.join(key);
        creator.channel_open(joiner.local_peer());
        joiner.channel_open(creator.local_peer());
        (creator, joiner, key)
    }

    /// Deliver every `Send` addressed to `to.local_peer()`
    fn deliver(from: &SyncProtocol, directives: Vec<Directive>, to: &mut SyncProtocol) -> Vec<Directive> {
        let mut out = Vec::new();
        for directive in directives {
            let envelope = match directive {
                Directive::Send { peer, envelope } if peer == to.local_peer() => envelope,
                Directive::Broadcast(envelope) => envelope,
                _ => continue,
            };
            out.extend(
                to.handle_inbound(from.local_peer(), &frame(&envelope), Instant::now())
                    .unwrap(),
            );
        }
        out
    }

    #[test]
    fn test_channel_open_introduces_and_announces() {
        let mut creator = protocol("creator");
        let key = FlowchartKey::generate();
        creator.share(key);
        let peer = PeerId::random();

        let directives = creator.channel_open(peer);
        let messages = sent_to(&directives, peer);
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], CollabMessage::UserInfo { display_name, .. } if display_name == "creator"));
        assert_eq!(messages[1], &CollabMessage::ActiveFlowchart { creator: true });
        assert!(creator.peer(&peer).unwrap().is_connected());
    }

    #[test]
    fn test_joiner_receives_snapshot_on_request() {
        let (mut creator, mut joiner, key) = connected_pair();

        // Creator announces, joiner asks, creator answers
        let announce = creator.channel_open(joiner.local_peer());
        let request = deliver(&creator, announce, &mut joiner);
        assert!(joiner.pending().contains(&key));
        let reply = deliver(&joiner, request, &mut creator);
        let applied = deliver(&creator, reply, &mut joiner);

        assert!(applied.contains(&Directive::StateChanged));
        assert!(!joiner.is_awaiting_snapshot());
        assert!(joiner.pending().is_empty());
        assert_eq!(joiner.state().snapshot().nodes[0].id, "n1");
    }

    #[test]
    fn test_user_info_and_cursor_update_peer() {
        let (creator, mut joiner, _) = connected_pair();
        let cursor = Envelope::new(
            CollabMessage::cursor(CursorPosition { x: 3.0, y: 4.0 }),
            None,
            creator.local_peer(),
        );
        let user = Envelope::new(
            CollabMessage::user_info(&UserInfo::new("Grace", "#00ff00")),
            None,
            creator.local_peer(),
        );
        joiner
            .handle_inbound(creator.local_peer(), &frame(&cursor), Instant::now())
            .unwrap();
        joiner
            .handle_inbound(creator.local_peer(), &frame(&user), Instant::now())
            .unwrap();

        let info = joiner.peer(&creator.local_peer()).unwrap();
        assert_eq!(info.display_name, "Grace");
        assert_eq!(info.cursor, Some(CursorPosition { x: 3.0, y: 4.0 }));
    }

    #[test]
    fn test_cross_flowchart_operation_is_discarded() {
        let (creator, mut joiner, _) = connected_pair();
        let other = FlowchartKey::generate();
        let envelope = Envelope::new(
            CollabMessage::NodeOperation {
                operation: add_node("intruder"),
            },
            Some(other),
            creator.local_peer(),
        );

        let err = joiner
            .handle_inbound(creator.local_peer(), &frame(&envelope), Instant::now())
            .unwrap_err();
        assert!(matches!(err, CollabError::CrossFlowchartMessage(_)));
        assert!(joiner.state().snapshot().nodes.is_empty());
    }

    #[test]
    fn test_unkeyed_operation_is_discarded() {
        let (creator, mut joiner, _) = connected_pair();
        let envelope = Envelope::new(
            CollabMessage::NodeOperation {
                operation: add_node("n9"),
            },
            None,
            creator.local_peer(),
        );
        assert!(joiner
            .handle_inbound(creator.local_peer(), &frame(&envelope), Instant::now())
            .is_err());
    }

    #[test]
    fn test_malformed_snapshot_leaves_state_unchanged() {
        let (creator, mut joiner, key) = connected_pair();
        let announce = creator.announcement().unwrap().to(joiner.local_peer());
        joiner
            .handle_inbound(creator.local_peer(), &frame(&announce), Instant::now())
            .unwrap();
        joiner
            .state()
            .apply_node_op(&add_node("local-draft"));

        let bad = json!({
            "type": "flowchart-data",
            "flowchartKey": key.to_hex(),
            "nodes": {"not": "an array"},
            "edges": []
        });
        let err = joiner
            .handle_inbound(
                creator.local_peer(),
                &serde_json::to_vec(&bad).unwrap(),
                Instant::now(),
            )
            .unwrap_err();
        assert!(matches!(err, CollabError::MalformedSnapshot(_)));
        assert_eq!(joiner.state().snapshot().nodes[0].id, "local-draft");
        assert!(joiner.pending().contains(&key));
    }

    #[test]
    fn test_unsolicited_snapshot_is_ignored() {
        let (mut creator, joiner, _) = connected_pair();
        let push = joiner.envelope(CollabMessage::flowchart_data(FlowchartSnapshot::default()));

        let directives = creator
            .handle_inbound(joiner.local_peer(), &frame(&push), Instant::now())
            .unwrap();
        assert!(directives.is_empty());
        assert_eq!(creator.state().snapshot().nodes.len(), 1);
    }

    #[test]
    fn test_waiting_side_does_not_serve_snapshots() {
        let (creator, mut joiner, _) = connected_pair();
        let request = creator.envelope(CollabMessage::RequestFlowchart);
        let directives = joiner
            .handle_inbound(creator.local_peer(), &frame(&request), Instant::now())
            .unwrap();
        assert!(directives.is_empty());
    }

    #[test]
    fn test_joiner_with_cached_content_serves_requests() {
        let key = FlowchartKey::generate();
        let mut rejoiner = protocol("rejoiner");
        rejoiner.state().apply_node_op(&add_node("cached"));
        rejoiner.join(key);
        assert!(rejoiner.is_awaiting_snapshot());

        let mut newcomer = protocol("newcomer");
        newcomer.join(key);
        rejoiner.channel_open(newcomer.local_peer());
        newcomer.channel_open(rejoiner.local_peer());

        let request = newcomer.envelope(CollabMessage::RequestFlowchart);
        let reply = rejoiner
            .handle_inbound(newcomer.local_peer(), &frame(&request), Instant::now())
            .unwrap();
        let messages = sent_to(&reply, newcomer.local_peer());
        assert!(matches!(
            messages.as_slice(),
            [CollabMessage::FlowchartData { nodes, .. }] if nodes.len() == 1
        ));
        // Still asking the network for a fresher copy
        assert!(rejoiner.is_awaiting_snapshot());
    }

    #[test]
    fn test_remote_operations_apply() {
        let (mut creator, joiner, _) = connected_pair();
        let op = joiner.envelope(CollabMessage::EdgeOperation {
            operation: EdgeOperation::Add {
                edge: Edge::new("e1", "n1", "n1"),
            },
        });
        let directives = creator
            .handle_inbound(joiner.local_peer(), &frame(&op), Instant::now())
            .unwrap();
        assert_eq!(directives, vec![Directive::StateChanged]);

        // Same op again is a no-op
        let directives = creator
            .handle_inbound(joiner.local_peer(), &frame(&op), Instant::now())
            .unwrap();
        assert!(directives.is_empty());
    }

    #[test]
    fn test_operation_from_author_is_relayed_once() {
        // joiner - creator - outsider, with no channel between the ends
        let (mut creator, joiner, key) = connected_pair();
        let mut outsider = protocol("outsider");
        outsider.join(key);
        outsider.channel_open(creator.local_peer());
        creator.channel_open(outsider.local_peer());

        let op = joiner
            .envelope(CollabMessage::NodeOperation {
                operation: add_node("from-joiner"),
            })
            .with_op_id();
        let directives = creator
            .handle_inbound(joiner.local_peer(), &frame(&op), Instant::now())
            .unwrap();
        assert!(sent_to(&directives, joiner.local_peer()).is_empty());
        let relayed: Vec<&Envelope> = directives
            .iter()
            .filter_map(|d| match d {
                Directive::Send { peer, envelope } if *peer == outsider.local_peer() => Some(envelope),
                _ => None,
            })
            .collect();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].source, Some(joiner.local_peer()));
        assert_eq!(relayed[0].op_id, op.op_id);

        // The outsider applies it but never forwards a relayed copy
        let onward = outsider
            .handle_inbound(creator.local_peer(), &frame(relayed[0]), Instant::now())
            .unwrap();
        assert_eq!(onward, vec![Directive::StateChanged]);
        assert!(outsider
            .state()
            .with_doc(|doc| doc.nodes().iter().any(|n| n.id == "from-joiner")));

        // A duplicate arriving over another path changes nothing
        let again = creator
            .handle_inbound(outsider.local_peer(), &frame(relayed[0]), Instant::now())
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_late_copy_of_older_update_is_dropped() {
        let (mut creator, mut joiner, _) = connected_pair();
        joiner.local_edit(add_node("n1").into());
        let mut moves = Vec::new();
        for x in [1.0, 2.0] {
            let (_, directives) = joiner.local_edit(
                NodeOperation::Update {
                    id: "n1".into(),
                    changes: NodePatch {
                        position: Some(Position::new(x, x)),
                        ..Default::default()
                    },
                }
                .into(),
            );
            moves.extend(directives);
        }
        let envelopes: Vec<Envelope> = moves
            .into_iter()
            .filter_map(|d| match d {
                Directive::Broadcast(envelope) => Some(envelope),
                _ => None,
            })
            .collect();
        assert_eq!(envelopes.len(), 2);
        assert_ne!(envelopes[0].op_id, envelopes[1].op_id);

        for envelope in &envelopes {
            creator
                .handle_inbound(joiner.local_peer(), &frame(envelope), Instant::now())
                .unwrap();
        }
        // The first move shows up again, as if relayed by a slower neighbor
        let late = creator
            .handle_inbound(joiner.local_peer(), &frame(&envelopes[0]), Instant::now())
            .unwrap();
        assert!(late.is_empty());
        let position = creator.state().with_doc(|doc| doc.nodes()[0].position);
        assert_eq!(position, Position::new(2.0, 2.0));
    }

    #[test]
    fn test_operation_without_id_is_applied_but_not_relayed() {
        let (mut creator, joiner, key) = connected_pair();
        let mut outsider = protocol("outsider");
        outsider.join(key);
        creator.channel_open(outsider.local_peer());

        let op = joiner.envelope(CollabMessage::NodeOperation {
            operation: add_node("legacy"),
        });
        let directives = creator
            .handle_inbound(joiner.local_peer(), &frame(&op), Instant::now())
            .unwrap();
        assert_eq!(directives, vec![Directive::StateChanged]);
    }

    #[test]
    fn test_local_edit_is_broadcast_only_when_applied() {
        let (mut creator, _joiner, _) = connected_pair();
        let (outcome, directives) = creator.local_edit(add_node("n2").into());
        assert_eq!(outcome, OpOutcome::Applied);
        assert!(matches!(directives.as_slice(), [Directive::Broadcast(_)]));

        let (outcome, directives) = creator.local_edit(
            EdgeOperation::Add {
                edge: Edge::new("e", "n1", "missing"),
            }
            .into(),
        );
        assert_eq!(outcome, OpOutcome::Rejected);
        assert!(directives.is_empty());
    }

    #[test]
    fn test_flowchart_update_requires_key() {
        let mut lone = protocol("lone");
        assert!(matches!(
            lone.flowchart_update(json!({"zoom": 2})),
            Err(CollabError::NotSharing)
        ));
    }

    #[test]
    fn test_retries_then_waiting_for_peers() {
        let (creator, mut joiner, key) = connected_pair();
        let start = Instant::now();
        let announce = creator.announcement().unwrap();
        joiner
            .handle_inbound(creator.local_peer(), &frame(&announce), start)
            .unwrap();

        // 1s, then 2s, then 4s with two retries configured
        let first = joiner.poll_timeouts(start + Duration::from_secs(1));
        assert_eq!(sent_to(&first, creator.local_peer()).len(), 1);
        let second = joiner.poll_timeouts(start + Duration::from_secs(3));
        assert_eq!(second.len(), 1);
        assert!(!joiner.is_waiting_for_peers());

        let last = joiner.poll_timeouts(start + Duration::from_secs(7));
        assert!(last.is_empty());
        assert!(joiner.is_waiting_for_peers());
        assert!(joiner.next_deadline().is_none());
        assert!(joiner.pending().contains(&key));
    }

    #[test]
    fn test_not_due_yet_does_nothing() {
        let (creator, mut joiner, _) = connected_pair();
        let start = Instant::now();
        joiner
            .handle_inbound(creator.local_peer(), &frame(&creator.announcement().unwrap()), start)
            .unwrap();
        assert!(joiner.poll_timeouts(start + Duration::from_millis(10)).is_empty());
    }

    #[test]
    fn test_unkeyed_side_adopts_announcement() {
        let key = FlowchartKey::generate();
        let mut creator = protocol("creator");
        creator.share(key);
        let mut fresh = protocol("fresh");
        fresh.channel_open(creator.local_peer());

        let directives = fresh
            .handle_inbound(
                creator.local_peer(),
                &frame(&creator.announcement().unwrap()),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(directives[0], Directive::AdoptKey(key));
        assert_eq!(fresh.active_key(), Some(key));
        assert_eq!(
            fresh.key_origin(),
            Some(KeyOrigin::Adopted { from_creator: true })
        );
        assert_eq!(sent_to(&directives, creator.local_peer()), vec![&CollabMessage::RequestFlowchart]);
    }

    #[test]
    fn test_creator_announcement_replaces_borrowed_key() {
        let mut fresh = protocol("fresh");
        let relay = PeerId::random();
        let creator = PeerId::random();
        fresh.channel_open(relay);
        fresh.channel_open(creator);

        let borrowed = FlowchartKey::generate();
        let relayed = Envelope::new(CollabMessage::ActiveFlowchart { creator: false }, Some(borrowed), relay);
        fresh
            .handle_inbound(relay, &frame(&relayed), Instant::now())
            .unwrap();
        assert_eq!(fresh.active_key(), Some(borrowed));

        let original = FlowchartKey::generate();
        let authoritative =
            Envelope::new(CollabMessage::ActiveFlowchart { creator: true }, Some(original), creator);
        let directives = fresh
            .handle_inbound(creator, &frame(&authoritative), Instant::now())
            .unwrap();
        assert_eq!(directives[0], Directive::AdoptKey(original));
        assert_eq!(fresh.active_key(), Some(original));
        assert!(!fresh.pending().contains(&borrowed));
    }

    #[test]
    fn test_created_key_is_never_replaced() {
        let mut creator = protocol("creator");
        let key = FlowchartKey::generate();
        creator.share(key);
        let rival = PeerId::random();
        creator.channel_open(rival);

        let other = Envelope::new(
            CollabMessage::ActiveFlowchart { creator: true },
            Some(FlowchartKey::generate()),
            rival,
        );
        assert!(creator
            .handle_inbound(rival, &frame(&other), Instant::now())
            .is_err());
        assert_eq!(creator.active_key(), Some(key));
    }

    #[test]
    fn test_lost_peer_frames_are_dropped() {
        let (mut creator, joiner, _) = connected_pair();
        let directives = creator.peer_lost(joiner.local_peer());
        assert_eq!(directives, vec![Directive::PeersChanged]);
        assert!(creator.peers().is_empty());

        let op = joiner.envelope(CollabMessage::NodeOperation {
            operation: add_node("late"),
        });
        let directives = creator
            .handle_inbound(joiner.local_peer(), &frame(&op), Instant::now())
            .unwrap();
        assert!(directives.is_empty());
        assert_eq!(creator.state().snapshot().nodes.len(), 1);
    }

    #[test]
    fn test_leave_clears_everything() {
        let (mut creator, _, _) = connected_pair();
        assert_eq!(creator.leave(), vec![Directive::PeersChanged]);
        assert!(creator.active_key().is_none());
        assert_eq!(creator.connected_count(), 0);
    }
}
