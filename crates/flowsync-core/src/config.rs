//! Session configuration
//!
//! All fields have working defaults; embedders usually only set the storage
//! namespace and, for the iroh transport, the bootstrap peers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default storage namespace for key tables
pub const DEFAULT_NAMESPACE: &str = "flowsync";

/// Upper bound on any retry delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound for one data-channel frame (snapshots included)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Tunables for a [`CollabSession`](crate::sync::CollabSession)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollabConfig {
    /// Storage namespace for the key store tables
    pub namespace: String,
    /// Bound on a whole offer/answer exchange
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
    /// Wait before re-sending an unanswered snapshot request
    #[serde(with = "duration_ms")]
    pub snapshot_timeout: Duration,
    /// Re-sends before reporting "still waiting for peers"
    pub snapshot_max_retries: u32,
    /// Attempts to join the discovery topic before giving up
    pub discovery_retries: u32,
    /// First backoff between discovery attempts (doubles each time)
    #[serde(with = "duration_ms")]
    pub discovery_backoff: Duration,
    /// Rendezvous peers (iroh endpoint ids, hex) used to enter the network
    pub bootstrap_peers: Vec<String>,
    /// Largest accepted data-channel frame in bytes
    pub max_frame_size: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            handshake_timeout: Duration::from_secs(10),
            snapshot_timeout: Duration::from_secs(5),
            snapshot_max_retries: 3,
            discovery_retries: 4,
            discovery_backoff: Duration::from_millis(500),
            bootstrap_peers: Vec::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl CollabConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_snapshot_retry(mut self, timeout: Duration, max_retries: u32) -> Self {
        self.snapshot_timeout = timeout;
        self.snapshot_max_retries = max_retries;
        self
    }

    pub fn with_discovery_retry(mut self, retries: u32, backoff: Duration) -> Self {
        self.discovery_retries = retries;
        self.discovery_backoff = backoff;
        self
    }

    pub fn with_bootstrap_peers(mut self, peers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.bootstrap_peers = peers.into_iter().map(Into::into).collect();
        self
    }

    /// Delay before the given retry attempt (1-based), doubling each time
    pub fn snapshot_backoff(&self, attempt: u32) -> Duration {
        doubled(self.snapshot_timeout, attempt)
    }

    /// Delay before the given discovery attempt (1-based), doubling each time
    pub fn discovery_delay(&self, attempt: u32) -> Duration {
        doubled(self.discovery_backoff, attempt)
    }
}

/// `base * 2^(attempt - 1)`, capped at [`MAX_BACKOFF`]
fn doubled(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.snapshot_max_retries, 3);
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
    }

    #[test]
    fn test_backoff_doubles() {
        let config = CollabConfig::default().with_snapshot_retry(Duration::from_secs(1), 3);
        assert_eq!(config.snapshot_backoff(1), Duration::from_secs(1));
        assert_eq!(config.snapshot_backoff(2), Duration::from_secs(2));
        assert_eq!(config.snapshot_backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_saturates_at_cap() {
        let config = CollabConfig::default()
            .with_snapshot_retry(Duration::from_secs(u64::MAX / 2), 40)
            .with_discovery_retry(100, Duration::from_millis(500));
        assert_eq!(config.snapshot_backoff(1), MAX_BACKOFF);
        assert_eq!(config.snapshot_backoff(u32::MAX), MAX_BACKOFF);
        assert_eq!(config.discovery_delay(64), MAX_BACKOFF);
        assert_eq!(config.discovery_delay(2), Duration::from_secs(1));
    }

    #[test]
    fn test_deserialize_partial_json_uses_defaults() {
        let config: CollabConfig =
            serde_json::from_str(r#"{"namespace":"editor","handshakeTimeout":2500}"#).unwrap();
        assert_eq!(config.namespace, "editor");
        assert_eq!(config.handshake_timeout, Duration::from_millis(2500));
        assert_eq!(config.snapshot_timeout, Duration::from_secs(5));
    }
}
