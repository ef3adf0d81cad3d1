//! Node configuration, read from a JSON file.
//!
//! Every field has a default, so a file only needs the values it changes:
//!
//! ```json
//! {
//!   "chain_id": "kestrel-testnet",
//!   "consensus": { "timeout_commit_ms": 500, "skip_timeout_commit": true },
//!   "gossip": { "peer_gossip_sleep_ms": 50 },
//!   "tx_pool_capacity": 20000
//! }
//! ```

use {
    crate::error::ConfigError,
    kestrel_consensus_bft::ConsensusConfig,
    kestrel_consensus_net::GossipConfig,
    serde::{Deserialize, Serialize},
    std::{fs, path::Path},
};

pub const DEFAULT_CHAIN_ID: &str = "kestrel";
pub const DEFAULT_TX_POOL_CAPACITY: usize = 10_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chain_id: String,
    pub consensus: ConsensusConfig,
    pub gossip: GossipConfig,
    /// Pending transactions held before submissions are refused.
    pub tx_pool_capacity: usize,
    /// Drop the oldest pending transaction instead of refusing a new one.
    pub tx_pool_evict_on_full: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chain_id: DEFAULT_CHAIN_ID.to_string(),
            consensus: ConsensusConfig::default(),
            gossip: GossipConfig::default(),
            tx_pool_capacity: DEFAULT_TX_POOL_CAPACITY,
            tx_pool_evict_on_full: false,
        }
    }
}

impl NodeConfig {
    /// Short timeouts for tests and local clusters.
    #[cfg(feature = "dev-context-only-utils")]
    pub fn dev_default(chain_id: &str) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            consensus: ConsensusConfig::dev_default(),
            gossip: GossipConfig::dev_default(),
            tx_pool_capacity: 1_000,
            tx_pool_evict_on_full: false,
        }
    }

    /// Reads and validates the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chain_id.is_empty() {
            return Err(ConfigError::EmptyChainId);
        }
        if self.tx_pool_capacity == 0 {
            return Err(ConfigError::ZeroTxPoolCapacity);
        }
        if self.gossip.max_message_size == 0 {
            return Err(ConfigError::ZeroMaxMessageSize);
        }
        self.consensus.validate()?;
        Ok(())
    }
}
