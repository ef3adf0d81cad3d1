use {
    kestrel_types::{FatalError, TypesError},
    solana_hash::Hash,
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Types(#[from] TypesError),

    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error("block height mismatch: expected {expected}, got {got}")]
    HeightMismatch { expected: u64, got: u64 },

    #[error("wrong chain id: expected {expected}, got {got}")]
    WrongChainId { expected: String, got: String },

    #[error("last block id mismatch: expected {expected}, got {got}")]
    LastBlockIdMismatch { expected: String, got: String },

    #[error("validators hash mismatch: expected {expected}, got {got}")]
    ValidatorsHashMismatch { expected: Hash, got: Hash },

    #[error("state root mismatch: expected {expected}, got {got}")]
    StateRootMismatch { expected: Hash, got: Hash },

    #[error("proposer {0} is not a validator")]
    UnknownProposer(solana_pubkey::Pubkey),

    #[error("block time {time_ms} is not after the last block time {last_ms}")]
    NonMonotonicTime { time_ms: u64, last_ms: u64 },

    #[error("block contains too many transactions: {count} > {max}")]
    TooManyTransactions { count: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxPoolError {
    #[error("transaction pool is full ({capacity} transactions)")]
    PoolFull { capacity: usize },

    #[error("transaction {0} is already pending")]
    Duplicate(Hash),
}
