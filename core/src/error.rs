use {
    kestrel_chain_store::{StoreError, TxPoolError},
    kestrel_consensus_bft::ConsensusError,
    kestrel_consensus_net::ConsensusNetError,
    kestrel_types::{FatalError, TypesError},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("chain_id must not be empty")]
    EmptyChainId,

    #[error("tx_pool_capacity must be > 0")]
    ZeroTxPoolCapacity,

    #[error("gossip.max_message_size must be > 0")]
    ZeroMaxMessageSize,

    #[error("consensus config: {0}")]
    Consensus(#[from] kestrel_consensus_bft::ConfigError),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("genesis chain id {genesis} does not match configured chain id {config}")]
    ChainIdMismatch { config: String, genesis: String },

    #[error("stored state belongs to chain {stored}, not {config}")]
    StoredChainIdMismatch { config: String, stored: String },

    #[error(transparent)]
    Types(#[from] TypesError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Net(#[from] ConsensusNetError),

    #[error(transparent)]
    TxPool(#[from] TxPoolError),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("consensus halted: {0}")]
    Fatal(#[from] FatalError),

    #[error("thread {0} panicked")]
    ThreadPanicked(&'static str),
}

pub type Result<T> = std::result::Result<T, NodeError>;
