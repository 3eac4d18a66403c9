//! Collaboration session: the actor that ties discovery, signaling and the
//! sync protocol together
//!
//! [`CollabSession`] is a cheap handle. All mutable session state lives in a
//! single background task that owns the [`SyncProtocol`], the discovery
//! membership and the per-peer links. Each peer gets its own task for the
//! handshake and for pumping frames, so a slow or silent peer never holds up
//! the others.
//!
//! # Example
//!
//! ```ignore
//! use flowsync_core::{CollabConfig, CollabSession, NullSink, PeerIdentity};
//!
//! let session = CollabSession::start("~/.flowsync", PeerIdentity::generate(),
//!     CollabConfig::default(), Arc::new(NullSink)).await?;
//! let key = session.share_flowchart("roadmap".into()).await?;
//! println!("share this key: {}", key);
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, field, info, info_span, trace, warn, Instrument, Span};

use super::dispatch::{Directive, SyncProtocol};
use super::events::{LocalEdit, SessionStatus, StateSink};
use super::protocol::Envelope;
use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};
use crate::flowchart::{OpOutcome, ReplicationState};
use crate::identity::PeerIdentity;
use crate::keystore::KeyStore;
use crate::signaling::SignalingChannel;
use crate::storage::{SnapshotCache, Storage};
use crate::transport::{
    DirectConnector, DiscoveryEvent, DiscoveryHandle, DiscoverySwarm, FrameChannel, FrameSender,
    GossipTransport,
};
use crate::types::{CursorPosition, FlowchartKey, LocalFlowchartId, PeerId, PeerInfo, UserInfo};

/// Flowchart the state is bound to before anything is opened or shared
pub const UNTITLED_FLOWCHART: &str = "untitled";

/// Database file created by [`CollabSession::start`]
pub const DATABASE_FILE: &str = "flowsync.redb";

const COMMAND_CAPACITY: usize = 64;

fn session_closed() -> CollabError {
    CollabError::ChannelClosed("session".into())
}

enum Command {
    Open {
        id: LocalFlowchartId,
        reply: oneshot::Sender<()>,
    },
    Share {
        id: LocalFlowchartId,
        reply: oneshot::Sender<CollabResult<FlowchartKey>>,
    },
    Join {
        key: FlowchartKey,
        reply: oneshot::Sender<CollabResult<LocalFlowchartId>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    Edit {
        edit: LocalEdit,
        reply: oneshot::Sender<OpOutcome>,
    },
    Update {
        payload: Value,
        reply: oneshot::Sender<CollabResult<()>>,
    },
    Cursor(CursorPosition),
    SetUser(UserInfo),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Caller waiting for a topic join to settle
enum JoinReply {
    Share {
        id: LocalFlowchartId,
        key: FlowchartKey,
        reply: oneshot::Sender<CollabResult<FlowchartKey>>,
    },
    Join {
        id: LocalFlowchartId,
        key: FlowchartKey,
        reply: oneshot::Sender<CollabResult<LocalFlowchartId>>,
    },
}

impl JoinReply {
    fn succeed(self) {
        match self {
            JoinReply::Share { id, key, reply } => {
                info!(flowchart = %id, key = %key.short(), "Sharing flowchart");
                let _ = reply.send(Ok(key));
            }
            JoinReply::Join { id, key, reply } => {
                info!(flowchart = %id, key = %key.short(), "Joined shared flowchart");
                let _ = reply.send(Ok(id));
            }
        }
    }

    fn fail(self, error: CollabError) {
        match self {
            JoinReply::Share { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            JoinReply::Join { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Discovery join between a failed attempt and its retry
struct TopicJoin {
    key: FlowchartKey,
    attempt: u32,
    retry_at: Instant,
    reply: JoinReply,
}

/// Read-mostly copy of actor state for synchronous getters
#[derive(Debug, Default)]
struct SessionView {
    status: RwLock<SessionStatus>,
    peers: RwLock<Vec<PeerInfo>>,
    active_key: RwLock<Option<FlowchartKey>>,
}

/// Handle to a running collaboration session
pub struct CollabSession<T> {
    local: PeerId,
    commands: mpsc::Sender<Command>,
    state: ReplicationState,
    keystore: Arc<KeyStore>,
    transport: Arc<T>,
    view: Arc<SessionView>,
    task: JoinHandle<()>,
}

impl<T> std::fmt::Debug for CollabSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabSession")
            .field("local", &self.local)
            .field("status", &*self.view.status.read())
            .field("active_key", &*self.view.active_key.read())
            .finish()
    }
}

impl CollabSession<GossipTransport> {
    /// Open storage under `data_dir`, bind an iroh endpoint and start a session
    ///
    /// # Errors
    ///
    /// Returns `CollabError::Io` if the directory cannot be created and
    /// `CollabError::Network` if the endpoint cannot bind. An unreadable
    /// database is not an error: the session starts with in-memory storage.
    pub async fn start(
        data_dir: impl AsRef<Path>,
        identity: PeerIdentity,
        config: CollabConfig,
        sink: Arc<dyn StateSink>,
    ) -> CollabResult<Self> {
        let data_dir = data_dir.as_ref();
        info!(?data_dir, "Starting collaboration session");
        std::fs::create_dir_all(data_dir)?;

        let storage = Storage::open_or_in_memory(data_dir.join(DATABASE_FILE))?;
        let keystore = Arc::new(KeyStore::with_storage(&storage, &config.namespace)?);
        let transport = Arc::new(GossipTransport::bind(&identity, &config).await?);

        Ok(Self::new(
            identity,
            keystore,
            transport,
            Arc::new(storage),
            sink,
            config,
        ))
    }
}

impl<T: DiscoverySwarm + DirectConnector> CollabSession<T> {
    /// Spawn the session task. Must be called inside a tokio runtime.
    pub fn new(
        identity: PeerIdentity,
        keystore: Arc<KeyStore>,
        transport: Arc<T>,
        cache: Arc<dyn SnapshotCache>,
        sink: Arc<dyn StateSink>,
        config: CollabConfig,
    ) -> Self {
        let local = transport.local_peer();
        let state = ReplicationState::open(LocalFlowchartId::new(UNTITLED_FLOWCHART), cache);
        let view = Arc::new(SessionView::default());
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            protocol: SyncProtocol::new(local, identity.user().clone(), state.clone(), config.clone()),
            transport: transport.clone(),
            keystore: keystore.clone(),
            sink,
            config,
            view: view.clone(),
            membership: None,
            links: HashMap::new(),
            next_link: 0,
            peer_tx,
            failure: None,
            joining: None,
            span: info_span!("session", local = %local.short(), key = field::Empty),
        };
        let span = actor.span.clone();
        let task = tokio::spawn(actor.run(command_rx, peer_rx).instrument(span));
        debug!(local = %local.short(), "Collaboration session started");

        Self {
            local,
            commands,
            state,
            keystore,
            transport,
            view,
            task,
        }
    }

    async fn call<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> CollabResult<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| session_closed())?;
        rx.await.map_err(|_| session_closed())
    }

    async fn tell(&self, command: Command) -> CollabResult<()> {
        self.commands.send(command).await.map_err(|_| session_closed())
    }

    /// Bind the local state to `id` without sharing it
    ///
    /// Leaves the currently shared flowchart, if any.
    pub async fn open_flowchart(&self, id: LocalFlowchartId) -> CollabResult<()> {
        self.call(|reply| Command::Open { id, reply }).await
    }

    /// Share a local flowchart, creating its key on first use
    pub async fn share_flowchart(&self, id: LocalFlowchartId) -> CollabResult<FlowchartKey> {
        self.call(|reply| Command::Share { id, reply }).await?
    }

    /// Join a flowchart shared by someone else
    ///
    /// The key is validated before anything touches the network.
    pub async fn join_shared_flowchart(&self, key: &str) -> CollabResult<LocalFlowchartId> {
        let key = FlowchartKey::parse(key.trim())?;
        self.call(|reply| Command::Join { key, reply }).await?
    }

    /// Leave the discovery topic and drop every peer
    pub async fn leave_flowchart(&self) -> CollabResult<()> {
        self.call(|reply| Command::Leave { reply }).await
    }

    /// Apply a local edit and relay it to connected peers
    pub async fn request_local_edit(&self, edit: impl Into<LocalEdit>) -> CollabResult<OpOutcome> {
        let edit = edit.into();
        self.call(|reply| Command::Edit { edit, reply }).await
    }

    /// Send an opaque payload to every connected peer
    pub async fn send_flowchart_update(&self, payload: Value) -> CollabResult<()> {
        self.call(|reply| Command::Update { payload, reply }).await?
    }

    pub async fn send_cursor_position(&self, x: f64, y: f64) -> CollabResult<()> {
        self.tell(Command::Cursor(CursorPosition { x, y })).await
    }

    /// Change the announced display name and color
    pub async fn set_user_info(&self, user: UserInfo) -> CollabResult<()> {
        self.tell(Command::SetUser(user)).await
    }

    /// Leave the topic, flush cached snapshots and stop the session task
    pub async fn shutdown(&self) -> CollabResult<()> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}

impl<T> CollabSession<T> {
    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    /// Shared handle to the replicated flowchart
    pub fn state(&self) -> ReplicationState {
        self.state.clone()
    }

    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn status(&self) -> SessionStatus {
        self.view.status.read().clone()
    }

    /// Known peers, ordered by id
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.view.peers.read().clone()
    }

    pub fn active_key(&self) -> Option<FlowchartKey> {
        *self.view.active_key.read()
    }
}

impl<T> Drop for CollabSession<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Membership<T> {
    handle: DiscoveryHandle,
    events: mpsc::Receiver<DiscoveryEvent>,
    signaling: SignalingChannel<T>,
    closed: bool,
}

struct PeerLink {
    id: u64,
    task: JoinHandle<()>,
    sender: Option<FrameSender>,
}

enum PeerEventKind {
    Open(FrameSender),
    Frame(Vec<u8>),
    Closed,
    Failed(CollabError),
}

struct PeerEvent {
    link: u64,
    peer: PeerId,
    kind: PeerEventKind,
}

struct SessionActor<T> {
    protocol: SyncProtocol,
    transport: Arc<T>,
    keystore: Arc<KeyStore>,
    sink: Arc<dyn StateSink>,
    config: CollabConfig,
    view: Arc<SessionView>,
    membership: Option<Membership<T>>,
    links: HashMap<PeerId, PeerLink>,
    next_link: u64,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    /// Why the last discovery join failed, until the next join or leave
    failure: Option<String>,
    joining: Option<TopicJoin>,
    /// Carries the active flowchart key for every record the actor emits
    span: Span,
}

async fn next_discovery<T>(membership: &mut Option<Membership<T>>) -> Option<DiscoveryEvent> {
    match membership {
        Some(m) if !m.closed => m.events.recv().await,
        _ => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<T: DiscoverySwarm + DirectConnector> SessionActor<T> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        loop {
            let deadline = self.protocol.next_deadline();
            let join_retry = self.joining.as_ref().map(|j| j.retry_at);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop_topic().await;
                        self.protocol.state().flush().await;
                        self.publish_status(SessionStatus::Idle);
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.stop_topic().await;
                        self.protocol.state().flush().await;
                        break;
                    }
                },
                event = next_discovery(&mut self.membership) => self.on_discovery(event),
                Some(event) = peer_rx.recv() => self.on_peer_event(event),
                _ = sleep_until(deadline) => {
                    let directives = self.protocol.poll_timeouts(Instant::now());
                    self.execute(directives);
                }
                _ = sleep_until(join_retry) => {
                    if let Some(join) = self.joining.take() {
                        self.try_join(join).await;
                    }
                }
            }
            self.refresh_status();
        }
        debug!("Collaboration session stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Open { id, reply } => {
                if self.protocol.active_key().is_some() {
                    self.stop_topic().await;
                }
                self.protocol.state().switch_to(id);
                let _ = reply.send(());
            }
            Command::Share { id, reply } => self.share(id, reply).await,
            Command::Join { key, reply } => self.join(key, reply).await,
            Command::Leave { reply } => {
                self.stop_topic().await;
                info!("Left shared flowchart");
                let _ = reply.send(());
            }
            Command::Edit { edit, reply } => {
                let (outcome, directives) = self.protocol.local_edit(edit);
                self.execute(directives);
                let _ = reply.send(outcome);
            }
            Command::Update { payload, reply } => {
                let result = self
                    .protocol
                    .flowchart_update(payload)
                    .map(|directives| self.execute(directives));
                let _ = reply.send(result);
            }
            Command::Cursor(position) => {
                let directives = self.protocol.cursor(position);
                self.execute(directives);
            }
            Command::SetUser(user) => {
                let directives = self.protocol.set_user(user);
                self.execute(directives);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn share(&mut self, id: LocalFlowchartId, reply: oneshot::Sender<CollabResult<FlowchartKey>>) {
        let key = match self.keystore.get_or_create_key(&id) {
            Ok(key) => key,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        self.stop_topic().await;
        self.protocol.state().switch_to(id.clone());
        let directives = self.protocol.share(key);
        self.execute(directives);
        *self.view.active_key.write() = Some(key);

        self.start_topic(key, JoinReply::Share { id, key, reply }).await;
    }

    async fn join(&mut self, key: FlowchartKey, reply: oneshot::Sender<CollabResult<LocalFlowchartId>>) {
        let id = match self.keystore.resolve_local_id(&key) {
            Ok(id) => id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        self.stop_topic().await;
        self.protocol.state().switch_to(id.clone());
        let directives = self.protocol.join(key);
        self.execute(directives);
        *self.view.active_key.write() = Some(key);

        self.start_topic(key, JoinReply::Join { id, key, reply }).await;
    }

    async fn start_topic(&mut self, key: FlowchartKey, reply: JoinReply) {
        self.span.record("key", field::display(key.short()));
        self.failure = None;
        self.publish_status(SessionStatus::Connecting);
        let join = TopicJoin {
            key,
            attempt: 1,
            retry_at: Instant::now(),
            reply,
        };
        self.try_join(join).await;
    }

    // Failed attempts park the join until `retry_at` so the loop keeps
    // serving commands and peers in the meantime.
    async fn try_join(&mut self, mut join: TopicJoin) {
        let topic = join.key.topic();
        match self.transport.join(topic).await {
            Ok((handle, events)) => {
                debug!(%topic, attempt = join.attempt, "Joined discovery topic");
                let signaling = SignalingChannel::new(
                    self.transport.clone(),
                    self.protocol.local_peer(),
                    topic,
                    self.config.handshake_timeout,
                );
                self.membership = Some(Membership {
                    handle,
                    events,
                    signaling,
                    closed: false,
                });
                self.refresh_status();
                join.reply.succeed();
            }
            Err(e) if join.attempt < self.config.discovery_retries => {
                let delay = self.config.discovery_delay(join.attempt);
                warn!(%topic, attempt = join.attempt, ?delay, error = %e, "Discovery join failed, retrying");
                join.attempt += 1;
                join.retry_at = Instant::now() + delay;
                self.joining = Some(join);
            }
            Err(e) => {
                error!(%topic, attempts = join.attempt, error = %e, "Could not reach the discovery network");
                self.failure = Some(e.to_string());
                self.refresh_status();
                self.sink.on_error(e.kind(), &e.to_string());
                join.reply.fail(e);
            }
        }
    }

    async fn stop_topic(&mut self) {
        if let Some(join) = self.joining.take() {
            debug!(key = %join.key.short(), "Abandoning discovery join");
            join.reply
                .fail(CollabError::Discovery("join superseded before it completed".into()));
        }
        for (_, link) in self.links.drain() {
            link.task.abort();
        }
        if let Some(membership) = self.membership.take() {
            self.transport.leave(membership.handle).await;
        }
        self.failure = None;
        let directives = self.protocol.leave();
        self.execute(directives);
        *self.view.active_key.write() = None;
        self.span.record("key", "");
        self.refresh_status();
    }

    fn on_discovery(&mut self, event: Option<DiscoveryEvent>) {
        match event {
            Some(DiscoveryEvent::Connection { peer, link }) => self.connect_peer(peer, link),
            Some(DiscoveryEvent::Disconnection { peer }) => {
                info!(peer = %peer.short(), "Peer disconnected");
                self.drop_peer(peer);
            }
            None => {
                warn!("Discovery event stream ended");
                if let Some(membership) = self.membership.as_mut() {
                    membership.closed = true;
                }
            }
        }
    }

    fn connect_peer(&mut self, peer: PeerId, mut link: FrameChannel) {
        let Some(membership) = self.membership.as_ref() else {
            return;
        };
        if peer == self.protocol.local_peer() {
            return;
        }
        let signaling = membership.signaling.clone();
        if let Some(old) = self.links.remove(&peer) {
            debug!(peer = %peer.short(), "Replacing existing link");
            old.task.abort();
        }

        self.next_link += 1;
        let id = self.next_link;
        let events = self.peer_tx.clone();
        let task = tokio::spawn(async move {
            let send = |kind| events.send(PeerEvent { link: id, peer, kind }).is_ok();

            let channel = match signaling.establish(&mut link).await {
                Ok(channel) => channel,
                Err(error) => {
                    send(PeerEventKind::Failed(error));
                    return;
                }
            };
            let (sender, mut inbound) = channel.split();
            if !send(PeerEventKind::Open(sender)) {
                return;
            }
            while let Some(frame) = inbound.recv().await {
                if !send(PeerEventKind::Frame(frame)) {
                    return;
                }
            }
            send(PeerEventKind::Closed);
            drop(link);
        }
        .instrument(info_span!(parent: &self.span, "link", remote = %peer.short())));

        self.links.insert(
            peer,
            PeerLink {
                id,
                task,
                sender: None,
            },
        );
        let directives = self.protocol.peer_discovered(peer);
        self.execute(directives);
    }

    fn drop_peer(&mut self, peer: PeerId) {
        if let Some(link) = self.links.remove(&peer) {
            link.task.abort();
        }
        let directives = self.protocol.peer_lost(peer);
        self.execute(directives);
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        let PeerEvent { link, peer, kind } = event;
        if self.links.get(&peer).map(|l| l.id) != Some(link) {
            trace!(peer = %peer.short(), "Dropping event from a stale link");
            return;
        }

        match kind {
            PeerEventKind::Open(sender) => {
                if let Some(link) = self.links.get_mut(&peer) {
                    link.sender = Some(sender);
                }
                let directives = self.protocol.channel_open(peer);
                self.execute(directives);
            }
            PeerEventKind::Frame(frame) => {
                match self.protocol.handle_inbound(peer, &frame, Instant::now()) {
                    Ok(directives) => self.execute(directives),
                    Err(e @ CollabError::CrossFlowchartMessage(_)) => {
                        debug!(peer = %peer.short(), error = %e, "Discarded message");
                    }
                    Err(e) => {
                        warn!(peer = %peer.short(), error = %e, "Discarded malformed message");
                    }
                }
            }
            PeerEventKind::Closed => {
                info!(peer = %peer.short(), "Data channel closed");
                self.drop_peer(peer);
            }
            PeerEventKind::Failed(error) => {
                warn!(peer = %peer.short(), %error, "Could not connect to peer");
                self.drop_peer(peer);
            }
        }
    }

    fn execute(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                Directive::Send { peer, envelope } => self.send_to(peer, &envelope),
                Directive::Broadcast(envelope) => {
                    let frame = match envelope.encode() {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode broadcast");
                            continue;
                        }
                    };
                    for (peer, link) in &self.links {
                        if let Some(sender) = &link.sender {
                            if let Err(e) = sender.send(frame.clone()) {
                                debug!(peer = %peer.short(), error = %e, "Broadcast to closed channel");
                            }
                        }
                    }
                }
                Directive::AdoptKey(key) => self.adopt(key),
                Directive::StateChanged => {
                    self.sink
                        .on_snapshot_applied(&self.protocol.state().snapshot());
                }
                Directive::PeersChanged => {
                    let peers = self.protocol.peers();
                    *self.view.peers.write() = peers.clone();
                    self.sink.on_peer_list_changed(&peers);
                }
                Directive::RemoteUpdate { peer, payload } => {
                    self.sink.on_remote_update(peer, &payload);
                }
            }
        }
    }

    fn send_to(&self, peer: PeerId, envelope: &Envelope) {
        let Some(sender) = self.links.get(&peer).and_then(|l| l.sender.as_ref()) else {
            trace!(peer = %peer.short(), "No open channel, dropping message");
            return;
        };
        match envelope.encode() {
            Ok(frame) => {
                if let Err(e) = sender.send(frame) {
                    debug!(peer = %peer.short(), error = %e, "Send to closed channel");
                }
            }
            Err(e) => warn!(peer = %peer.short(), error = %e, "Failed to encode message"),
        }
    }

    // The announcing peer shares our topic, so membership stays as is.
    fn adopt(&mut self, key: FlowchartKey) {
        let id = match self.keystore.resolve_local_id(&key) {
            Ok(id) => id,
            Err(e) => {
                warn!(key = %key.short(), error = %e, "Failed to record adopted key");
                key.synthesized_local_id()
            }
        };
        self.protocol.state().switch_to(id);
        *self.view.active_key.write() = Some(key);
    }

    fn derive_status(&self) -> SessionStatus {
        if let Some(reason) = &self.failure {
            return SessionStatus::Failed(reason.clone());
        }
        if self.joining.is_some() {
            return SessionStatus::Connecting;
        }
        if self.membership.is_none() {
            return SessionStatus::Idle;
        }
        if self.protocol.is_waiting_for_peers() {
            return SessionStatus::WaitingForPeers;
        }
        match self.protocol.connected_count() {
            0 => SessionStatus::SearchingForPeers,
            peer_count => SessionStatus::Connected { peer_count },
        }
    }

    fn refresh_status(&self) {
        self.publish_status(self.derive_status());
    }

    fn publish_status(&self, status: SessionStatus) {
        {
            let mut current = self.view.status.write();
            if *current == status {
                return;
            }
            *current = status.clone();
        }
        info!(%status, "Session status changed");
        self.sink.on_status_changed(&status);
    }
}
