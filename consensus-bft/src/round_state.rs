//! The height/round/step state owned by the consensus state machine.

use {
    crate::{height_vote_set::HeightVoteSet, vote_set::VoteSet},
    kestrel_types::{
        BitArray, Block, BlockId, PartSet, PartSetHeader, Proposal, ValidatorSet, VoteSetReader,
    },
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    std::fmt,
};

/// Steps of a round, in the order they are entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RoundStep {
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    PrevoteWait,
    Precommit,
    PrecommitWait,
    Commit,
}

impl RoundStep {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::NewHeight => 1,
            Self::NewRound => 2,
            Self::Propose => 3,
            Self::Prevote => 4,
            Self::PrevoteWait => 5,
            Self::Precommit => 6,
            Self::PrecommitWait => 7,
            Self::Commit => 8,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::NewHeight,
            2 => Self::NewRound,
            3 => Self::Propose,
            4 => Self::Prevote,
            5 => Self::PrevoteWait,
            6 => Self::Precommit,
            7 => Self::PrecommitWait,
            8 => Self::Commit,
            _ => return None,
        })
    }
}

impl fmt::Display for RoundStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything the state machine knows about the height being decided.
///
/// `locked_block` is set iff `locked_round >= 0`, and likewise for
/// `valid_block` and `valid_round`.
#[derive(Clone, Debug)]
pub struct RoundState {
    pub height: u64,
    pub round: i32,
    pub step: RoundStep,
    pub start_time_ms: u64,
    /// When +2/3 precommits for a block were first seen, 0 before that.
    pub commit_time_ms: u64,
    pub validators: ValidatorSet,
    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,
    pub locked_round: i32,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,
    /// Last round with a polka for a block we hold.
    pub valid_round: i32,
    pub valid_block: Option<Block>,
    pub valid_block_parts: Option<PartSet>,
    pub votes: HeightVoteSet,
    pub commit_round: i32,
    /// Precommits that committed the previous height.
    pub last_commit: Option<VoteSet>,
    pub last_validators: ValidatorSet,
    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    pub fn proposer(&self) -> Option<Pubkey> {
        self.validators.get_proposer().map(|v| v.address)
    }

    pub fn prevotes(&self, round: i32) -> Option<&VoteSet> {
        self.votes.prevotes(round)
    }

    pub fn precommits(&self, round: i32) -> Option<&VoteSet> {
        self.votes.precommits(round)
    }

    /// True if the proposal block is complete and hashes to `block_id`.
    pub fn has_proposal_block(&self, block_id: &BlockId) -> bool {
        self.proposal_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash))
    }

    pub fn summary(&self) -> RoundStateSummary {
        let vote_rounds = self
            .votes
            .rounds()
            .map(|(round, rvs)| RoundVotesSummary {
                round: *round,
                prevotes: rvs.prevotes.string_short(),
                precommits: rvs.precommits.string_short(),
            })
            .collect();
        RoundStateSummary {
            height: self.height,
            round: self.round,
            step: self.step,
            start_time_ms: self.start_time_ms,
            commit_time_ms: self.commit_time_ms,
            proposer: self.proposer(),
            validators: self.validators.size(),
            proposal: self.proposal.as_ref().map(|p| p.block_parts_header),
            proposal_block_hash: self.proposal_block.as_ref().map(Block::hash),
            locked_round: self.locked_round,
            locked_block_hash: self.locked_block.as_ref().map(Block::hash),
            valid_round: self.valid_round,
            valid_block_hash: self.valid_block.as_ref().map(Block::hash),
            commit_round: self.commit_round,
            last_commit: self.last_commit.as_ref().map(VoteSet::string_short),
            votes: vote_rounds,
        }
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.height, self.round, self.step)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoundVotesSummary {
    pub round: i32,
    pub prevotes: String,
    pub precommits: String,
}

/// A serializable view of a [`RoundState`] for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoundStateSummary {
    pub height: u64,
    pub round: i32,
    pub step: RoundStep,
    pub start_time_ms: u64,
    pub commit_time_ms: u64,
    pub proposer: Option<Pubkey>,
    pub validators: usize,
    pub proposal: Option<PartSetHeader>,
    pub proposal_block_hash: Option<Hash>,
    pub locked_round: i32,
    pub locked_block_hash: Option<Hash>,
    pub valid_round: i32,
    pub valid_block_hash: Option<Hash>,
    pub commit_round: i32,
    pub last_commit: Option<String>,
    pub votes: Vec<RoundVotesSummary>,
}

/// The step fields every node announces to its peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStepInfo {
    pub height: u64,
    pub round: i32,
    pub step: RoundStep,
    pub seconds_since_start_time: u64,
    pub last_commit_round: i32,
}

impl RoundStepInfo {
    pub fn from_round_state(rs: &RoundState, now_ms: u64) -> Self {
        Self {
            height: rs.height,
            round: rs.round,
            step: rs.step,
            seconds_since_start_time: now_ms.saturating_sub(rs.start_time_ms) / 1000,
            last_commit_round: rs
                .last_commit
                .as_ref()
                .map_or(-1, |lc| lc.round()),
        }
    }
}

/// Announced when a node sees a polka for a block or +2/3 precommits, so
/// peers know which parts to expect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidBlockInfo {
    pub height: u64,
    pub round: i32,
    pub block_parts_header: PartSetHeader,
    pub block_parts: BitArray,
    pub is_commit: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_are_ordered() {
        assert!(RoundStep::NewHeight < RoundStep::NewRound);
        assert!(RoundStep::Prevote < RoundStep::PrevoteWait);
        assert!(RoundStep::PrevoteWait < RoundStep::Precommit);
        assert!(RoundStep::PrecommitWait < RoundStep::Commit);
    }

    #[test]
    fn test_step_u8_conversion() {
        for step in [
            RoundStep::NewHeight,
            RoundStep::NewRound,
            RoundStep::Propose,
            RoundStep::Prevote,
            RoundStep::PrevoteWait,
            RoundStep::Precommit,
            RoundStep::PrecommitWait,
            RoundStep::Commit,
        ] {
            assert_eq!(RoundStep::from_u8(step.as_u8()), Some(step));
        }
        assert_eq!(RoundStep::from_u8(0), None);
        assert_eq!(RoundStep::from_u8(9), None);
    }
}
