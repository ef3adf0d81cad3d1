//! Votes of one type for one height and round.
//!
//! A `VoteSet` keeps at most one vote per validator in its main slot list.
//! Votes are also tracked per block id, so that when a validator
//! equivocates and a peer tells us some block has +2/3, we can still collect
//! the votes that make up that majority. Votes for a block nobody claimed
//! +2/3 for are dropped on conflict.

use {
    crate::error::VoteSetError,
    kestrel_types::{
        exceeds_two_thirds, BitArray, BlockId, Commit, FatalError, PeerId, ValidatorSet, Vote,
        VoteSetReader, VoteType,
    },
    solana_pubkey::Pubkey,
    std::{collections::HashMap, fmt, sync::Arc},
};

#[derive(Clone, Debug)]
struct BlockVotes {
    /// A peer claimed this block has +2/3.
    peer_maj23: bool,
    bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: u64,
}

impl BlockVotes {
    fn new(peer_maj23: bool, size: usize) -> Self {
        Self {
            peer_maj23,
            bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: 0,
        }
    }

    fn add_verified_vote(&mut self, vote: Vote, power: u64) {
        let index = vote.validator_index as usize;
        let Some(slot) = self.votes.get_mut(index) else {
            return;
        };
        if slot.is_none() {
            self.bit_array.set_index(index, true);
            self.sum = self.sum.saturating_add(power);
        }
        *slot = Some(vote);
    }
}

#[derive(Clone, Debug)]
pub struct VoteSet {
    chain_id: String,
    height: u64,
    round: i32,
    vote_type: VoteType,
    validators: Arc<ValidatorSet>,
    votes_bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: u64,
    maj23: Option<BlockId>,
    votes_by_block: HashMap<BlockId, BlockVotes>,
    peer_maj23s: HashMap<PeerId, BlockId>,
}

impl VoteSet {
    pub fn new(
        chain_id: &str,
        height: u64,
        round: i32,
        vote_type: VoteType,
        validators: Arc<ValidatorSet>,
    ) -> Self {
        let size = validators.size();
        Self {
            chain_id: chain_id.to_string(),
            height,
            round,
            vote_type,
            validators,
            votes_bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: 0,
            maj23: None,
            votes_by_block: HashMap::new(),
            peer_maj23s: HashMap::new(),
        }
    }

    /// Adds a signed vote.
    ///
    /// Returns `Ok(false)` for a vote already held. A second, different vote
    /// from a validator is a [`VoteSetError::ConflictingVote`]; it only
    /// replaces the first one if it is for the block that reached +2/3.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        if vote.height != self.height
            || vote.round != self.round
            || vote.vote_type != self.vote_type
        {
            return Err(VoteSetError::UnexpectedStep {
                height: self.height,
                round: self.round,
                vote_type: self.vote_type,
                got_height: vote.height,
                got_round: vote.round,
                got_type: vote.vote_type,
            });
        }
        let index = vote.validator_index;
        let Some(validator) = self.validators.get_by_index(index) else {
            return Err(VoteSetError::InvalidValidatorIndex(index));
        };
        if validator.address != vote.validator_address {
            return Err(VoteSetError::InvalidValidatorAddress {
                index,
                expected: validator.address,
                got: vote.validator_address,
            });
        }
        let power = validator.voting_power;

        if self.vote_for_block(index, &vote.block_id).is_some() {
            return Ok(false);
        }
        vote.verify(&self.chain_id, &validator.address)?;
        self.add_verified_vote(vote, power)
    }

    fn vote_for_block(&self, index: u32, block_id: &BlockId) -> Option<&Vote> {
        let index = index as usize;
        if let Some(Some(vote)) = self.votes.get(index) {
            if vote.block_id == *block_id {
                return Some(vote);
            }
        }
        self.votes_by_block
            .get(block_id)
            .and_then(|bv| bv.votes.get(index))
            .and_then(Option::as_ref)
    }

    fn add_verified_vote(&mut self, vote: Vote, power: u64) -> Result<bool, VoteSetError> {
        let index = vote.validator_index as usize;
        let block_id = vote.block_id;

        let conflicting = match self.votes.get(index) {
            Some(Some(existing)) if existing.block_id != block_id => Some(existing.clone()),
            _ => None,
        };
        match &conflicting {
            Some(_) => {
                if self.maj23 == Some(block_id) {
                    if let Some(slot) = self.votes.get_mut(index) {
                        *slot = Some(vote.clone());
                    }
                }
            }
            None => {
                if let Some(slot) = self.votes.get_mut(index) {
                    *slot = Some(vote.clone());
                    self.votes_bit_array.set_index(index, true);
                    self.sum = self.sum.saturating_add(power);
                }
            }
        }

        let conflict_error = |existing: Vote, vote: Vote| VoteSetError::ConflictingVote {
            existing: Box::new(existing),
            conflicting: Box::new(vote),
        };
        if let Some(existing) = &conflicting {
            let claimed = self
                .votes_by_block
                .get(&block_id)
                .is_some_and(|bv| bv.peer_maj23);
            if !claimed {
                return Err(conflict_error(existing.clone(), vote));
            }
        }
        let size = self.validators.size();
        let block_votes = self
            .votes_by_block
            .entry(block_id)
            .or_insert_with(|| BlockVotes::new(false, size));

        let total = self.validators.total_voting_power();
        let had_maj23 = exceeds_two_thirds(block_votes.sum, total);
        block_votes.add_verified_vote(vote.clone(), power);
        if !had_maj23 && exceeds_two_thirds(block_votes.sum, total) && self.maj23.is_none() {
            self.maj23 = Some(block_id);
            for (i, v) in block_votes.votes.iter().enumerate() {
                if let (Some(v), Some(slot)) = (v, self.votes.get_mut(i)) {
                    *slot = Some(v.clone());
                }
            }
        }

        match conflicting {
            Some(existing) => Err(conflict_error(existing, vote)),
            None => Ok(true),
        }
    }

    /// Records that `peer` claims +2/3 for `block_id`, so conflicting votes
    /// for it are kept from now on.
    pub fn set_peer_maj23(&mut self, peer: PeerId, block_id: BlockId) -> Result<(), VoteSetError> {
        if let Some(existing) = self.peer_maj23s.get(&peer) {
            if *existing == block_id {
                return Ok(());
            }
            return Err(VoteSetError::ConflictingPeerMaj23 {
                peer,
                existing: *existing,
                got: block_id,
            });
        }
        self.peer_maj23s.insert(peer, block_id);
        let size = self.validators.size();
        self.votes_by_block
            .entry(block_id)
            .and_modify(|bv| bv.peer_maj23 = true)
            .or_insert_with(|| BlockVotes::new(true, size));
        Ok(())
    }

    /// Which validators voted for exactly `block_id`.
    pub fn bit_array_by_block_id(&self, block_id: &BlockId) -> Option<BitArray> {
        self.votes_by_block
            .get(block_id)
            .map(|bv| bv.bit_array.clone())
    }

    pub fn get_by_address(&self, address: &Pubkey) -> Option<&Vote> {
        let (index, _) = self.validators.get_by_address(address)?;
        self.votes.get(index as usize).and_then(Option::as_ref)
    }

    /// The block id with more than two thirds of the voting power, if any.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// More than two thirds of the power voted, for anything.
    pub fn has_two_thirds_any(&self) -> bool {
        exceeds_two_thirds(self.sum, self.validators.total_voting_power())
    }

    pub fn has_all(&self) -> bool {
        self.sum == self.validators.total_voting_power()
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// The commit formed by the +2/3 precommits. Only votes for the committed
    /// block are kept.
    pub fn make_commit(&self) -> Result<Commit, FatalError> {
        if self.vote_type != VoteType::Precommit {
            return Err(FatalError::Invariant(
                "cannot make a commit from prevotes".to_string(),
            ));
        }
        let Some(block_id) = self.maj23.filter(|id| !id.is_zero()) else {
            return Err(FatalError::Invariant(format!(
                "cannot make a commit for {}/{} without +2/3 for a block",
                self.height, self.round
            )));
        };
        let precommits = self
            .votes
            .iter()
            .map(|v| v.as_ref().filter(|v| v.block_id == block_id).cloned())
            .collect();
        Ok(Commit::new(block_id, precommits))
    }

    /// Short form for logs and round state dumps.
    pub fn string_short(&self) -> String {
        let maj23 = self
            .maj23
            .map_or_else(|| "none".to_string(), |id| id.to_string());
        format!(
            "VoteSet{{H:{} R:{} T:{} +2/3:{maj23} {:?}}}",
            self.height, self.round, self.vote_type, self.votes_bit_array
        )
    }
}

impl VoteSetReader for VoteSet {
    fn height(&self) -> u64 {
        self.height
    }

    fn round(&self) -> i32 {
        self.round
    }

    fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    fn size(&self) -> usize {
        self.validators.size()
    }

    fn bit_array(&self) -> BitArray {
        self.votes_bit_array.clone()
    }

    fn get_by_index(&self, index: u32) -> Option<&Vote> {
        self.votes.get(index as usize).and_then(Option::as_ref)
    }

    fn is_commit(&self) -> bool {
        self.vote_type == VoteType::Precommit && self.maj23.is_some_and(|id| !id.is_zero())
    }
}

impl fmt::Display for VoteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string_short())
    }
}
