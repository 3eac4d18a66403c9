//! Per-session peer identity
//!
//! The peer id is the public half of an iroh endpoint key generated fresh for
//! each session. Peers are therefore not recognisable across restarts unless a
//! caller deliberately reuses a secret key via [`PeerIdentity::from_secret_key`].

use iroh::SecretKey;

use crate::types::{PeerId, UserInfo};

/// Local peer identity for one session
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    secret_key: SecretKey,
    peer_id: PeerId,
    user: UserInfo,
}

impl PeerIdentity {
    /// Generate a random identity
    pub fn generate() -> Self {
        Self::from_secret_key(SecretKey::generate(&mut rand::rng()))
    }

    /// Build an identity around an existing endpoint key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let peer_id = PeerId::from(secret_key.public());
        let user = UserInfo::anonymous(&peer_id);
        Self {
            secret_key,
            peer_id,
            user,
        }
    }

    /// Set the announced display name and color
    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = user;
        self
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Endpoint key for the network transport
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    pub fn set_user(&mut self, user: UserInfo) {
        self.user = user;
    }
}
