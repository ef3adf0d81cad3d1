//! Message types and serialization for consensus gossip.
//!
//! All messages are serialized with bincode. A [`ConsensusNetMessage`] is
//! sent on exactly one of four channels; receivers check the channel against
//! the message kind and run [`ConsensusNetMessage::validate_basic`] before
//! anything reaches the state machine.

use {
    crate::error::{ConsensusNetError, Result},
    bincode::Options,
    kestrel_consensus_bft::{RoundStep, RoundStepInfo, ValidBlockInfo},
    kestrel_types::{BitArray, BlockId, Part, PartSetHeader, Proposal, Vote, VoteType},
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// Round steps, +2/3 announcements and has-vote notices.
pub const STATE_CHANNEL: u8 = 0x20;
/// Proposals, proof-of-lock prevote bits and block parts.
pub const DATA_CHANNEL: u8 = 0x21;
pub const VOTE_CHANNEL: u8 = 0x22;
/// Answers to +2/3 announcements.
pub const VOTE_SET_BITS_CHANNEL: u8 = 0x23;

/// Upper bound on the size of a validator set, and therefore of any vote bit
/// array a peer may send.
pub const MAX_VOTES_COUNT: usize = 10_000;

/// Upper bound on the number of parts in a block.
pub const MAX_BLOCK_PARTS_COUNT: usize = 1_601;

/// Top-level consensus gossip message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsensusNetMessage {
    /// Sent on every step transition and to new peers.
    NewRoundStep {
        height: u64,
        round: i32,
        step: RoundStep,
        seconds_since_start_time: u64,
        last_commit_round: i32,
    },

    /// A polka for a block, or +2/3 precommits, was seen. Tells the peer
    /// which part set to gather.
    NewValidBlock {
        height: u64,
        round: i32,
        block_parts_header: PartSetHeader,
        block_parts: BitArray,
        is_commit: bool,
    },

    Proposal(Proposal),

    /// The prevotes we hold for the proposal's proof-of-lock round.
    ProposalPol {
        height: u64,
        proposal_pol_round: i32,
        proposal_pol: BitArray,
    },

    BlockPart {
        height: u64,
        round: i32,
        part: Part,
    },

    Vote(Vote),

    /// The sender now holds the vote of validator `index`.
    HasVote {
        height: u64,
        round: i32,
        vote_type: VoteType,
        index: u32,
    },

    /// The sender has seen +2/3 votes for `block_id`.
    VoteSetMaj23 {
        height: u64,
        round: i32,
        vote_type: VoteType,
        block_id: BlockId,
    },

    /// Which votes for `block_id` the sender holds, in reply to a
    /// [`ConsensusNetMessage::VoteSetMaj23`].
    VoteSetBits {
        height: u64,
        round: i32,
        vote_type: VoteType,
        block_id: BlockId,
        votes: BitArray,
    },
}

fn invalid(reason: impl Into<String>) -> ConsensusNetError {
    ConsensusNetError::InvalidMessage(reason.into())
}

fn check_height(height: u64) -> Result<()> {
    if height == 0 {
        return Err(invalid("zero height"));
    }
    Ok(())
}

fn check_round(round: i32) -> Result<()> {
    if round < 0 {
        return Err(invalid(format!("negative round {round}")));
    }
    Ok(())
}

fn check_vote_bits(bits: &BitArray, what: &str) -> Result<()> {
    if bits.size() > MAX_VOTES_COUNT {
        return Err(invalid(format!(
            "{what} has {} bits, max {MAX_VOTES_COUNT}",
            bits.size()
        )));
    }
    if !bits.is_well_formed() {
        return Err(invalid(format!("malformed {what} bit array")));
    }
    Ok(())
}

fn wire_options(max_size: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(max_size as u64)
}

impl ConsensusNetMessage {
    pub fn new_round_step(info: &RoundStepInfo) -> Self {
        Self::NewRoundStep {
            height: info.height,
            round: info.round,
            step: info.step,
            seconds_since_start_time: info.seconds_since_start_time,
            last_commit_round: info.last_commit_round,
        }
    }

    pub fn new_valid_block(info: &ValidBlockInfo) -> Self {
        Self::NewValidBlock {
            height: info.height,
            round: info.round,
            block_parts_header: info.block_parts_header,
            block_parts: info.block_parts.clone(),
            is_commit: info.is_commit,
        }
    }

    /// Channel this message travels on.
    pub fn channel(&self) -> u8 {
        match self {
            Self::NewRoundStep { .. }
            | Self::NewValidBlock { .. }
            | Self::HasVote { .. }
            | Self::VoteSetMaj23 { .. } => STATE_CHANNEL,
            Self::Proposal(_) | Self::ProposalPol { .. } | Self::BlockPart { .. } => DATA_CHANNEL,
            Self::Vote(_) => VOTE_CHANNEL,
            Self::VoteSetBits { .. } => VOTE_SET_BITS_CHANNEL,
        }
    }

    /// Short name of the variant for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewRoundStep { .. } => "NewRoundStep",
            Self::NewValidBlock { .. } => "NewValidBlock",
            Self::Proposal(_) => "Proposal",
            Self::ProposalPol { .. } => "ProposalPol",
            Self::BlockPart { .. } => "BlockPart",
            Self::Vote(_) => "Vote",
            Self::HasVote { .. } => "HasVote",
            Self::VoteSetMaj23 { .. } => "VoteSetMaj23",
            Self::VoteSetBits { .. } => "VoteSetBits",
        }
    }

    /// Cheap structural checks. Signatures and anything that needs the
    /// validator set are checked by the state machine.
    pub fn validate_basic(&self) -> Result<()> {
        match self {
            Self::NewRoundStep {
                height,
                round,
                last_commit_round,
                ..
            } => {
                check_height(*height)?;
                check_round(*round)?;
                if *last_commit_round < -1 {
                    return Err(invalid(format!(
                        "invalid last commit round {last_commit_round}"
                    )));
                }
                if *height == 1 && *last_commit_round != -1 {
                    return Err(invalid("last commit round must be -1 at the first height"));
                }
                if *height > 1 && *last_commit_round < 0 {
                    return Err(invalid(format!(
                        "last commit round must be set at height {height}"
                    )));
                }
                Ok(())
            }
            Self::NewValidBlock {
                height,
                round,
                block_parts_header,
                block_parts,
                ..
            } => {
                check_height(*height)?;
                check_round(*round)?;
                if block_parts_header.total == 0 {
                    return Err(invalid("empty block part set header"));
                }
                if block_parts.size() != block_parts_header.total as usize {
                    return Err(invalid(format!(
                        "block parts bit array has {} bits, header says {}",
                        block_parts.size(),
                        block_parts_header.total
                    )));
                }
                if block_parts.size() > MAX_BLOCK_PARTS_COUNT {
                    return Err(invalid(format!(
                        "{} block parts, max {MAX_BLOCK_PARTS_COUNT}",
                        block_parts.size()
                    )));
                }
                if !block_parts.is_well_formed() {
                    return Err(invalid("malformed block parts bit array"));
                }
                Ok(())
            }
            Self::Proposal(proposal) => proposal
                .validate_basic()
                .map_err(|err| invalid(format!("proposal: {err}"))),
            Self::ProposalPol {
                height,
                proposal_pol_round,
                proposal_pol,
            } => {
                check_height(*height)?;
                check_round(*proposal_pol_round)?;
                if proposal_pol.size() == 0 {
                    return Err(invalid("empty proposal POL bit array"));
                }
                check_vote_bits(proposal_pol, "proposal POL")
            }
            Self::BlockPart {
                height,
                round,
                part,
            } => {
                check_height(*height)?;
                check_round(*round)?;
                part.validate_basic()
                    .map_err(|err| invalid(format!("block part: {err}")))
            }
            Self::Vote(vote) => vote
                .validate_basic()
                .map_err(|err| invalid(format!("vote: {err}"))),
            Self::HasVote { height, round, .. } => {
                check_height(*height)?;
                check_round(*round)
            }
            Self::VoteSetMaj23 {
                height,
                round,
                block_id,
                ..
            } => {
                check_height(*height)?;
                check_round(*round)?;
                block_id
                    .validate_basic()
                    .map_err(|err| invalid(format!("block id: {err}")))
            }
            Self::VoteSetBits {
                height,
                round,
                block_id,
                votes,
                ..
            } => {
                check_height(*height)?;
                check_round(*round)?;
                block_id
                    .validate_basic()
                    .map_err(|err| invalid(format!("block id: {err}")))?;
                check_vote_bits(votes, "vote set bits")
            }
        }
    }

    /// Serialize this message, failing if it exceeds `max_size` bytes.
    pub fn encode(&self, max_size: usize) -> Result<Vec<u8>> {
        let size = wire_options(usize::MAX).serialized_size(self)?;
        if size > max_size as u64 {
            return Err(ConsensusNetError::MessageTooLarge {
                size: usize::try_from(size).unwrap_or(usize::MAX),
                max: max_size,
            });
        }
        Ok(wire_options(max_size).serialize(self)?)
    }

    /// Deserialize a message of at most `max_size` bytes. Trailing bytes are
    /// rejected.
    pub fn decode(data: &[u8], max_size: usize) -> Result<Self> {
        if data.len() > max_size {
            return Err(ConsensusNetError::MessageTooLarge {
                size: data.len(),
                max: max_size,
            });
        }
        Ok(wire_options(max_size).deserialize(data)?)
    }
}

impl fmt::Display for ConsensusNetMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewRoundStep {
                height,
                round,
                step,
                last_commit_round,
                ..
            } => write!(f, "[NewRoundStep H:{height} R:{round} S:{step} LCR:{last_commit_round}]"),
            Self::NewValidBlock {
                height,
                round,
                block_parts_header,
                block_parts,
                is_commit,
            } => write!(
                f,
                "[NewValidBlock H:{height} R:{round} BP:{block_parts_header} BA:{block_parts:?} IsCommit:{is_commit}]"
            ),
            Self::Proposal(proposal) => write!(f, "[Proposal {proposal}]"),
            Self::ProposalPol {
                height,
                proposal_pol_round,
                proposal_pol,
            } => write!(
                f,
                "[ProposalPOL H:{height} POLR:{proposal_pol_round} POL:{proposal_pol:?}]"
            ),
            Self::BlockPart {
                height,
                round,
                part,
            } => write!(f, "[BlockPart H:{height} R:{round} P:{}]", part.index),
            Self::Vote(vote) => write!(f, "[Vote {vote}]"),
            Self::HasVote {
                height,
                round,
                vote_type,
                index,
            } => write!(f, "[HasVote VI:{index} V:{{{height}/{round:02}/{vote_type}}}]"),
            Self::VoteSetMaj23 {
                height,
                round,
                vote_type,
                block_id,
            } => write!(f, "[VSM23 {height}/{round:02}/{vote_type} {block_id}]"),
            Self::VoteSetBits {
                height,
                round,
                vote_type,
                block_id,
                votes,
            } => write!(f, "[VSB {height}/{round:02}/{vote_type} {block_id} {votes:?}]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        assert_matches::assert_matches,
        solana_hash::Hash,
    };

    fn make_block_id() -> BlockId {
        BlockId::new(
            Hash::new_unique(),
            PartSetHeader {
                total: 3,
                hash: Hash::new_unique(),
            },
        )
    }

    fn make_round_step(height: u64, round: i32, last_commit_round: i32) -> ConsensusNetMessage {
        ConsensusNetMessage::NewRoundStep {
            height,
            round,
            step: RoundStep::Propose,
            seconds_since_start_time: 0,
            last_commit_round,
        }
    }

    fn make_vote_set_bits(bits: usize) -> ConsensusNetMessage {
        ConsensusNetMessage::VoteSetBits {
            height: 1,
            round: 0,
            vote_type: VoteType::Prevote,
            block_id: make_block_id(),
            votes: BitArray::new(bits),
        }
    }

    #[test]
    fn test_channels() {
        assert_eq!(make_round_step(1, 0, -1).channel(), STATE_CHANNEL);
        assert_eq!(make_vote_set_bits(4).channel(), VOTE_SET_BITS_CHANNEL);
        let part_msg = ConsensusNetMessage::ProposalPol {
            height: 1,
            proposal_pol_round: 0,
            proposal_pol: BitArray::new(4),
        };
        assert_eq!(part_msg.channel(), DATA_CHANNEL);
    }

    #[test]
    fn test_new_round_step_validation() {
        assert!(make_round_step(1, 0, -1).validate_basic().is_ok());
        assert!(make_round_step(5, 2, 0).validate_basic().is_ok());
        assert_matches!(
            make_round_step(0, 0, -1).validate_basic(),
            Err(ConsensusNetError::InvalidMessage(_))
        );
        assert!(make_round_step(1, -1, -1).validate_basic().is_err());
        assert!(make_round_step(1, 0, 0).validate_basic().is_err());
        assert!(make_round_step(2, 0, -1).validate_basic().is_err());
        assert!(make_round_step(2, 0, -2).validate_basic().is_err());
    }

    #[test]
    fn test_new_valid_block_bits_must_match_header() {
        let header = PartSetHeader {
            total: 3,
            hash: Hash::new_unique(),
        };
        let msg = |bits| ConsensusNetMessage::NewValidBlock {
            height: 1,
            round: 0,
            block_parts_header: header,
            block_parts: BitArray::new(bits),
            is_commit: false,
        };
        assert!(msg(3).validate_basic().is_ok());
        assert!(msg(2).validate_basic().is_err());
        assert!(msg(4).validate_basic().is_err());
    }

    #[test]
    fn test_vote_set_bits_size_capped() {
        assert!(make_vote_set_bits(MAX_VOTES_COUNT).validate_basic().is_ok());
        assert_matches!(
            make_vote_set_bits(MAX_VOTES_COUNT + 1).validate_basic(),
            Err(ConsensusNetError::InvalidMessage(_))
        );
    }

    #[test]
    fn test_empty_proposal_pol_rejected() {
        let msg = ConsensusNetMessage::ProposalPol {
            height: 1,
            proposal_pol_round: 0,
            proposal_pol: BitArray::new(0),
        };
        assert!(msg.validate_basic().is_err());
    }

    #[test]
    fn test_half_block_id_rejected() {
        let msg = ConsensusNetMessage::VoteSetMaj23 {
            height: 1,
            round: 0,
            vote_type: VoteType::Precommit,
            block_id: BlockId::new(Hash::new_unique(), PartSetHeader::default()),
        };
        assert!(msg.validate_basic().is_err());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let msg = make_vote_set_bits(MAX_VOTES_COUNT);
        assert_matches!(
            msg.encode(64),
            Err(ConsensusNetError::MessageTooLarge { max: 64, .. })
        );
        let bytes = msg.encode(MAX_MESSAGE).unwrap();
        assert_matches!(
            ConsensusNetMessage::decode(&bytes, 64),
            Err(ConsensusNetError::MessageTooLarge { .. })
        );
    }

    const MAX_MESSAGE: usize = crate::config::MAX_MESSAGE_SIZE;

    #[test]
    fn test_garbage_rejected() {
        assert_matches!(
            ConsensusNetMessage::decode(&[0xff; 16], MAX_MESSAGE),
            Err(ConsensusNetError::Serialization(_))
        );
        let mut bytes = make_round_step(1, 0, -1).encode(MAX_MESSAGE).unwrap();
        bytes.push(0);
        assert!(ConsensusNetMessage::decode(&bytes, MAX_MESSAGE).is_err());
    }
}
