//! Configuration for consensus gossip.

use {
    serde::{Deserialize, Serialize},
    std::time::Duration,
};

/// Largest encoded consensus message accepted from or sent to a peer.
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Timing and limits for the per-peer gossip loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// How long a gossip loop sleeps after a pass with nothing to send.
    /// Consecutive idle passes double the sleep up to
    /// `peer_gossip_max_sleep_ms`.
    pub peer_gossip_sleep_ms: u64,
    pub peer_gossip_max_sleep_ms: u64,

    /// Interval between +2/3 announcements to a peer.
    pub peer_query_maj23_sleep_ms: u64,

    /// Maximum size of a single encoded message in bytes.
    pub max_message_size: usize,

    /// Votes a peer must deliver before it is reported as good.
    pub votes_to_become_good_peer: u64,
    /// Block parts a peer must deliver before it is reported as good.
    pub block_parts_to_become_good_peer: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            peer_gossip_sleep_ms: 100,
            peer_gossip_max_sleep_ms: 800,
            peer_query_maj23_sleep_ms: 2_000,
            max_message_size: MAX_MESSAGE_SIZE,
            votes_to_become_good_peer: 10_000,
            block_parts_to_become_good_peer: 10_000,
        }
    }
}

impl GossipConfig {
    /// Create a config suitable for local testing with shorter sleeps.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            peer_gossip_sleep_ms: 5,
            peer_gossip_max_sleep_ms: 40,
            peer_query_maj23_sleep_ms: 100,
            votes_to_become_good_peer: 10,
            block_parts_to_become_good_peer: 2,
            ..Self::default()
        }
    }

    pub fn peer_gossip_sleep(&self) -> Duration {
        Duration::from_millis(self.peer_gossip_sleep_ms)
    }

    pub fn peer_gossip_max_sleep(&self) -> Duration {
        Duration::from_millis(self.peer_gossip_max_sleep_ms.max(self.peer_gossip_sleep_ms))
    }

    pub fn peer_query_maj23_sleep(&self) -> Duration {
        Duration::from_millis(self.peer_query_maj23_sleep_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_sleep_never_below_base() {
        let config = GossipConfig {
            peer_gossip_sleep_ms: 300,
            peer_gossip_max_sleep_ms: 100,
            ..GossipConfig::default()
        };
        assert_eq!(config.peer_gossip_max_sleep(), Duration::from_millis(300));
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: GossipConfig = serde_json::from_str(r#"{"peer_gossip_sleep_ms": 7}"#).unwrap();
        assert_eq!(config.peer_gossip_sleep_ms, 7);
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
    }
}
