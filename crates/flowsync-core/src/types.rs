//! Core identifier types for flowsync

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CollabError, CollabResult};

pub mod flowchart;
pub mod peer;

pub use flowchart::{
    Edge, EdgeOperation, EdgePatch, FlowchartProperties, FlowchartSnapshot, Node, NodeOperation,
    NodePatch, Position,
};
pub use peer::{ConnectionState, CursorPosition, PeerInfo, UserInfo};

/// Domain separation prefix for discovery topics.
const TOPIC_PREFIX: &[u8] = b"flowsync-topic-v1:";

/// Prefix of local ids synthesized from a bare key.
pub const SHARED_ID_PREFIX: &str = "shared-";

/// Number of hex characters of the key kept in a synthesized local id.
const SHARED_ID_HEX_LEN: usize = 8;

fn parse_hex32(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out).ok()?;
    Some(out)
}

/// Shared secret identifying one sharable flowchart
///
/// Anyone holding the key may join the flowchart. It seeds the discovery
/// topic through a one-way hash, so the key itself never appears on the
/// discovery network.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowchartKey([u8; 32]);

impl FlowchartKey {
    /// Generate a new random key from the OS CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the key
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a 64-character lowercase hex string
    pub fn parse(s: &str) -> CollabResult<Self> {
        parse_hex32(s).map(Self).ok_or_else(|| {
            CollabError::InvalidKeyFormat(format!(
                "expected 64 lowercase hex characters, got {} characters",
                s.len()
            ))
        })
    }

    /// Lowercase hex form (64 chars)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex chars, for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Rendezvous topic derived from this key
    pub fn topic(&self) -> DiscoveryTopic {
        DiscoveryTopic::derive(self)
    }

    /// Local id synthesized for a key joined without a known local id
    pub fn synthesized_local_id(&self) -> LocalFlowchartId {
        let hex = self.to_hex();
        LocalFlowchartId::new(format!("{}{}", SHARED_ID_PREFIX, &hex[..SHARED_ID_HEX_LEN]))
    }
}

impl fmt::Display for FlowchartKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FlowchartKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print the full secret
        write!(f, "FlowchartKey({}…)", self.short())
    }
}

impl FromStr for FlowchartKey {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for FlowchartKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FlowchartKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Rendezvous topic for one flowchart
///
/// ```text
/// topic = BLAKE3("flowsync-topic-v1:" || key_bytes)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiscoveryTopic([u8; 32]);

impl DiscoveryTopic {
    /// Derive the topic for a flowchart key
    pub fn derive(key: &FlowchartKey) -> Self {
        let mut input = Vec::with_capacity(TOPIC_PREFIX.len() + 32);
        input.extend_from_slice(TOPIC_PREFIX);
        input.extend_from_slice(key.as_bytes());

        let hash = blake3::hash(&input);
        Self(*hash.as_bytes())
    }

    /// Create a topic from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the topic
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex chars, for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for DiscoveryTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topic_{}", self.short())
    }
}

impl Serialize for DiscoveryTopic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DiscoveryTopic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_hex32(&s)
            .map(Self)
            .ok_or_else(|| serde::de::Error::custom("topic must be 64 lowercase hex characters"))
    }
}

/// Application-level flowchart identifier, distinct from the shared key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalFlowchartId(String);

impl LocalFlowchartId {
    /// Wrap an application-chosen id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was synthesized from a joined key
    pub fn is_synthesized(&self) -> bool {
        self.0.starts_with(SHARED_ID_PREFIX)
    }
}

impl fmt::Display for LocalFlowchartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LocalFlowchartId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of one peer for one discovery session
///
/// In production this is the peer's iroh endpoint public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Random peer id (tests and simulations)
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create a peer id from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the peer id
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex chars, for display
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex32(s)
            .map(Self)
            .ok_or_else(|| CollabError::Serialization(format!("invalid peer id: {}", s)))
    }
}

impl From<iroh::PublicKey> for PeerId {
    fn from(key: iroh::PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Current wall-clock time in unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hex_is_64_lowercase_chars() {
        let key = FlowchartKey::generate();
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(FlowchartKey::parse(&hex).unwrap(), key);
    }

    #[test]
    fn test_key_parse_rejects_bad_input() {
        assert!(matches!(
            FlowchartKey::parse("abc"),
            Err(CollabError::InvalidKeyFormat(_))
        ));
        let upper = "A".repeat(64);
        assert!(FlowchartKey::parse(&upper).is_err());
        let non_hex = "g".repeat(64);
        assert!(FlowchartKey::parse(&non_hex).is_err());
    }

    #[test]
    fn test_synthesized_local_id() {
        let key = FlowchartKey::parse(&format!("0123abcd{}", "f".repeat(56))).unwrap();
        let id = key.synthesized_local_id();
        assert_eq!(id.as_str(), "shared-0123abcd");
        assert!(id.is_synthesized());
        assert!(!LocalFlowchartId::new("fc1").is_synthesized());
    }

    #[test]
    fn test_topic_is_not_the_key() {
        let key = FlowchartKey::generate();
        let topic = key.topic();
        assert_ne!(topic.as_bytes(), key.as_bytes());
        assert_eq!(topic, DiscoveryTopic::derive(&key));
        assert_ne!(topic, FlowchartKey::generate().topic());
    }

    #[test]
    fn test_key_debug_hides_secret() {
        let key = FlowchartKey::generate();
        let debug = format!("{:?}", key);
        assert!(!debug.contains(&key.to_hex()));
        assert!(debug.contains(&key.short()));
    }

    #[test]
    fn test_key_serde_as_hex_string() {
        let key = FlowchartKey::generate();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_hex()));
        let back: FlowchartKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<FlowchartKey>("\"nothex\"").is_err());
    }

    #[test]
    fn test_peer_id_ordering_and_parse() {
        let a = PeerId::from_bytes([1u8; 32]);
        let b = PeerId::from_bytes([2u8; 32]);
        assert!(a < b);
        assert_eq!(a.to_hex().parse::<PeerId>().unwrap(), a);
        assert_eq!(a.short(), "01010101");
    }
}
