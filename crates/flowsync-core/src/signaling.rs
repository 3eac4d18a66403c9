//! Connection-setup handshake over a discovery link
//!
//! ```text
//! initiator (smaller PeerId)            responder
//!   ice-candidate*  ───────────────────▶
//!   offer           ───────────────────▶  verify topic, arm accept
//!                   ◀───────────────────  ice-candidate*
//!                   ◀───────────────────  answer
//!   dial            ═══════════════════▶  accept
//!   Open                                  Open
//! ```
//!
//! Candidates precede the offer or answer on the same ordered link, so the
//! dialing side has every hint before it dials. The whole exchange runs under
//! one timeout.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CollabError, CollabResult};
use crate::transport::{DirectConnector, FrameChannel};
use crate::types::{DiscoveryTopic, PeerId};

/// Handshake message exchanged over the discovery link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Offer {
        topic: DiscoveryTopic,
        source: PeerId,
        target: PeerId,
        description: String,
    },
    Answer {
        topic: DiscoveryTopic,
        source: PeerId,
        target: PeerId,
        description: String,
    },
    IceCandidate {
        topic: DiscoveryTopic,
        source: PeerId,
        target: PeerId,
        candidate: String,
    },
}

impl SignalMessage {
    pub fn topic(&self) -> &DiscoveryTopic {
        match self {
            SignalMessage::Offer { topic, .. }
            | SignalMessage::Answer { topic, .. }
            | SignalMessage::IceCandidate { topic, .. } => topic,
        }
    }

    pub fn source(&self) -> PeerId {
        match self {
            SignalMessage::Offer { source, .. }
            | SignalMessage::Answer { source, .. }
            | SignalMessage::IceCandidate { source, .. } => *source,
        }
    }

    pub fn target(&self) -> PeerId {
        match self {
            SignalMessage::Offer { target, .. }
            | SignalMessage::Answer { target, .. }
            | SignalMessage::IceCandidate { target, .. } => *target,
        }
    }
}

/// Which side of a pair sends the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The lexicographically smaller peer id initiates
    pub fn for_pair(local: &PeerId, remote: &PeerId) -> Role {
        if local < remote {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

/// Per-peer handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Offering,
    AwaitingOffer,
    Negotiating,
    Open,
    Closed,
}

/// Handshake state machine for one peer
#[derive(Debug, Clone)]
pub struct Handshake {
    peer: PeerId,
    role: Role,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(local: PeerId, peer: PeerId) -> Self {
        Self {
            peer,
            role: Role::for_pair(&local, &peer),
            state: HandshakeState::Idle,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn transition(&mut self, from: HandshakeState, to: HandshakeState) -> CollabResult<()> {
        if self.state != from {
            return Err(CollabError::Handshake(format!(
                "peer {}: cannot move to {:?} from {:?}",
                self.peer.short(),
                to,
                self.state
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Idle → Offering (initiator) or AwaitingOffer (responder)
    pub fn start(&mut self) -> CollabResult<Role> {
        let next = match self.role {
            Role::Initiator => HandshakeState::Offering,
            Role::Responder => HandshakeState::AwaitingOffer,
        };
        self.transition(HandshakeState::Idle, next)?;
        Ok(self.role)
    }

    /// Offering → Negotiating
    pub fn on_answer(&mut self) -> CollabResult<()> {
        self.transition(HandshakeState::Offering, HandshakeState::Negotiating)
    }

    /// AwaitingOffer → Negotiating
    pub fn on_offer(&mut self) -> CollabResult<()> {
        self.transition(HandshakeState::AwaitingOffer, HandshakeState::Negotiating)
    }

    /// Negotiating → Open
    pub fn open(&mut self) -> CollabResult<()> {
        self.transition(HandshakeState::Negotiating, HandshakeState::Open)
    }

    /// Any state → Closed
    pub fn close(&mut self) {
        self.state = HandshakeState::Closed;
    }
}

/// Runs handshakes for one joined topic
pub struct SignalingChannel<C> {
    connector: Arc<C>,
    local: PeerId,
    topic: DiscoveryTopic,
    timeout: Duration,
}

impl<C> Clone for SignalingChannel<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            local: self.local,
            topic: self.topic,
            timeout: self.timeout,
        }
    }
}

impl<C: DirectConnector> SignalingChannel<C> {
    pub fn new(connector: Arc<C>, local: PeerId, topic: DiscoveryTopic, timeout: Duration) -> Self {
        Self {
            connector,
            local,
            topic,
            timeout,
        }
    }

    pub fn topic(&self) -> DiscoveryTopic {
        self.topic
    }

    /// Perform the handshake with the peer at the other end of `link`.
    ///
    /// Returns the open direct channel, or `HandshakeTimeout` if the
    /// exchange does not finish in time. The link stays usable afterwards.
    pub async fn establish(&self, link: &mut FrameChannel) -> CollabResult<FrameChannel> {
        let peer = link.remote();
        let mut handshake = Handshake::new(self.local, peer);
        debug!(peer = %peer.short(), role = ?handshake.role(), "Starting handshake");

        let result = tokio::time::timeout(self.timeout, self.run(link, &mut handshake)).await;
        match result {
            Ok(Ok(channel)) => {
                info!(peer = %peer.short(), role = ?handshake.role(), "Direct channel open");
                Ok(channel)
            }
            Ok(Err(e)) => {
                handshake.close();
                Err(e)
            }
            Err(_) => {
                handshake.close();
                Err(CollabError::HandshakeTimeout {
                    peer: peer.short(),
                    elapsed_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn run(&self, link: &mut FrameChannel, handshake: &mut Handshake) -> CollabResult<FrameChannel> {
        let peer = handshake.peer();
        match handshake.start()? {
            Role::Initiator => {
                self.send_candidates(link, peer)?;
                self.send(
                    link,
                    &SignalMessage::Offer {
                        topic: self.topic,
                        source: self.local,
                        target: peer,
                        description: self.connector.local_description(),
                    },
                )?;

                let description = loop {
                    match self.next_message(link).await? {
                        SignalMessage::Answer { description, .. } => break description,
                        SignalMessage::IceCandidate { candidate, .. } => {
                            self.add_candidate(peer, &candidate);
                        }
                        SignalMessage::Offer { .. } => {
                            warn!(peer = %peer.short(), "Ignoring offer from the responding side");
                        }
                    }
                };
                handshake.on_answer()?;

                let channel = self.connector.dial(peer, &description).await?;
                handshake.open()?;
                Ok(channel)
            }
            Role::Responder => {
                loop {
                    match self.next_message(link).await? {
                        SignalMessage::Offer { .. } => break,
                        SignalMessage::IceCandidate { candidate, .. } => {
                            self.add_candidate(peer, &candidate);
                        }
                        SignalMessage::Answer { .. } => {
                            warn!(peer = %peer.short(), "Ignoring answer before any offer");
                        }
                    }
                }
                handshake.on_offer()?;

                let pending = self.connector.accept_from(peer);
                self.send_candidates(link, peer)?;
                self.send(
                    link,
                    &SignalMessage::Answer {
                        topic: self.topic,
                        source: self.local,
                        target: peer,
                        description: self.connector.local_description(),
                    },
                )?;

                let channel = pending.wait().await?;
                handshake.open()?;
                Ok(channel)
            }
        }
    }

    /// Next message from `link` that is addressed to us, from its peer, for our topic
    async fn next_message(&self, link: &mut FrameChannel) -> CollabResult<SignalMessage> {
        let peer = link.remote();
        loop {
            let frame = link
                .recv()
                .await
                .ok_or_else(|| CollabError::ChannelClosed(peer.short()))?;

            let message: SignalMessage = match serde_json::from_slice(&frame) {
                Ok(message) => message,
                Err(e) => {
                    debug!(peer = %peer.short(), error = %e, "Ignoring undecodable signaling frame");
                    continue;
                }
            };
            if message.source() != peer || message.target() != self.local {
                debug!(peer = %peer.short(), "Ignoring signaling frame not meant for this link");
                continue;
            }
            if message.topic() != &self.topic {
                // No reply, nothing armed: the peer is left to time out.
                warn!(
                    peer = %peer.short(),
                    topic = %message.topic(),
                    joined = %self.topic,
                    "Rejecting handshake message for a topic we have not joined"
                );
                continue;
            }
            return Ok(message);
        }
    }

    fn send(&self, link: &FrameChannel, message: &SignalMessage) -> CollabResult<()> {
        link.send(serde_json::to_vec(message)?)
    }

    fn send_candidates(&self, link: &FrameChannel, peer: PeerId) -> CollabResult<()> {
        for candidate in self.connector.local_candidates() {
            self.send(
                link,
                &SignalMessage::IceCandidate {
                    topic: self.topic,
                    source: self.local,
                    target: peer,
                    candidate,
                },
            )?;
        }
        Ok(())
    }

    fn add_candidate(&self, peer: PeerId, candidate: &str) {
        if let Err(e) = self.connector.add_remote_candidate(peer, candidate) {
            debug!(peer = %peer.short(), error = %e, "Ignoring unusable candidate");
        }
    }
}
