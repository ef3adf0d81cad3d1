//! Error types shared by every Kestrel crate.

use {solana_hash::Hash, solana_pubkey::Pubkey, thiserror::Error};

/// Recoverable errors raised while validating or signing core types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypesError {
    #[error("invalid signature from {0}")]
    InvalidSignature(Pubkey),

    #[error("vote address {vote} does not match validator {validator}")]
    AddressMismatch { vote: Pubkey, validator: Pubkey },

    #[error("negative round {0}")]
    NegativeRound(i32),

    #[error("invalid height {0}")]
    InvalidHeight(u64),

    #[error("invalid POL round {pol_round} for round {round}")]
    InvalidPolRound { round: i32, pol_round: i32 },

    #[error("invalid block id: {0}")]
    InvalidBlockId(&'static str),

    #[error("missing signature")]
    MissingSignature,

    #[error("part index {index} out of range (total {total})")]
    PartIndexOutOfRange { index: u32, total: u32 },

    #[error("invalid merkle proof for part {0}")]
    InvalidPartProof(u32),

    #[error("part of {size} bytes exceeds the {max} byte limit")]
    PartTooLarge { size: usize, max: usize },

    #[error("block data hash mismatch: header {header}, computed {computed}")]
    DataHashMismatch { header: Hash, computed: Hash },

    #[error("last commit hash mismatch: header {header}, computed {computed}")]
    LastCommitHashMismatch { header: Hash, computed: Hash },

    #[error("block declares {declared} txs but carries {actual}")]
    TxCountMismatch { declared: u64, actual: u64 },

    #[error("height regression: last signed {last}, requested {requested}")]
    HeightRegression { last: u64, requested: u64 },

    #[error("round regression at height {height}: last signed {last}, requested {requested}")]
    RoundRegression { height: u64, last: i32, requested: i32 },

    #[error("step regression at h={height} r={round}: last signed {last}, requested {requested}")]
    StepRegression {
        height: u64,
        round: i32,
        last: i8,
        requested: i8,
    },

    #[error("conflicting data already signed at h={height} r={round} step={step}")]
    ConflictingSign { height: u64, round: i32, step: i8 },

    #[error("duplicate validator {0}")]
    DuplicateValidator(Pubkey),

    #[error("validator {0} has zero voting power")]
    ZeroVotingPower(Pubkey),

    #[error("total voting power {0} exceeds the maximum")]
    TotalVotingPowerOverflow(u64),

    #[error("invalid commit: {0}")]
    InvalidCommit(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for TypesError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// A structural invariant violation.
///
/// Continuing after one of these risks forking from the rest of the network,
/// so callers must stop participating in consensus instead of recovering.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error(
        "state height {state_height} does not match round state height {round_height} \
         (commit round {commit_round})"
    )]
    HeightMismatch {
        state_height: u64,
        round_height: u64,
        commit_round: i32,
    },

    #[error("non-contiguous block save: store height {store_height}, block height {block_height}")]
    NonContiguousHeight { store_height: u64, block_height: u64 },

    #[error("+2/3 prevoted for invalid block {block_hash} at h={height} r={round}: {reason}")]
    InvalidPolkaBlock {
        height: u64,
        round: i32,
        block_hash: Hash,
        reason: String,
    },

    #[error("+2/3 committed invalid block {block_hash} at h={height}: {reason}")]
    InvalidCommittedBlock {
        height: u64,
        block_hash: Hash,
        reason: String,
    },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}
