use {
    kestrel_chain_store::StoreError,
    kestrel_types::{BlockId, FatalError, PeerId, TypesError, Vote, VoteType},
    thiserror::Error,
};

/// Reasons a vote is not accepted into a vote set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VoteSetError {
    #[error("vote is for {got_height}/{got_round}/{got_type}, vote set is {height}/{round}/{vote_type}")]
    UnexpectedStep {
        height: u64,
        round: i32,
        vote_type: VoteType,
        got_height: u64,
        got_round: i32,
        got_type: VoteType,
    },

    #[error("no validator at index {0}")]
    InvalidValidatorIndex(u32),

    #[error("validator at index {index} is {expected}, vote claims {got}")]
    InvalidValidatorAddress {
        index: u32,
        expected: solana_pubkey::Pubkey,
        got: solana_pubkey::Pubkey,
    },

    #[error("invalid vote signature: {0}")]
    InvalidSignature(#[from] TypesError),

    /// The same validator signed two different votes for one height, round
    /// and type.
    #[error("conflicting votes from validator {}", existing.validator_address)]
    ConflictingVote {
        existing: Box<Vote>,
        conflicting: Box<Vote>,
    },

    #[error("peer {peer} already claimed +2/3 for {existing}, now claims {got}")]
    ConflictingPeerMaj23 {
        peer: PeerId,
        existing: BlockId,
        got: BlockId,
    },

    #[error("peer {peer} sent a vote for round {round}, exceeding its catch-up rounds")]
    UnwantedRound { peer: PeerId, round: i32 },
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Types(#[from] TypesError),

    #[error(transparent)]
    VoteSet(#[from] VoteSetError),

    #[error("proposal has invalid pol round {pol_round} for round {round}")]
    InvalidProposalPolRound { round: i32, pol_round: i32 },

    #[error("proposal is not signed by the round's proposer")]
    InvalidProposalSignature,

    #[error("proposal block exceeds {max} bytes")]
    ProposalBlockTooLarge { max: usize },

    #[error("consensus service is not running")]
    Stopped,
}

impl ConsensusError {
    /// The invariant violation behind this error, if it is one.
    pub fn fatal(&self) -> Option<&FatalError> {
        match self {
            Self::Fatal(err) | Self::Store(StoreError::Fatal(err)) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
