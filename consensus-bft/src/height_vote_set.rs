//! Prevotes and precommits of every round of one height.
//!
//! Rounds up to the state machine's current round + 1 are always tracked.
//! Votes for rounds beyond that are accepted from each peer for at most
//! `max_catchup_rounds` distinct rounds, so a peer cannot grow the map
//! without bound.

use {
    crate::{error::VoteSetError, vote_set::VoteSet},
    kestrel_types::{BlockId, FatalError, PeerId, ValidatorSet, Vote, VoteType},
    log::*,
    std::{
        collections::{BTreeMap, HashMap},
        sync::Arc,
    },
};

#[derive(Clone, Debug)]
pub struct RoundVoteSet {
    pub prevotes: VoteSet,
    pub precommits: VoteSet,
}

#[derive(Clone, Debug)]
pub struct HeightVoteSet {
    chain_id: String,
    height: u64,
    validators: Arc<ValidatorSet>,
    round: i32,
    round_vote_sets: BTreeMap<i32, RoundVoteSet>,
    peer_catchup_rounds: HashMap<PeerId, Vec<i32>>,
    max_catchup_rounds: usize,
}

impl HeightVoteSet {
    pub fn new(
        chain_id: &str,
        height: u64,
        validators: Arc<ValidatorSet>,
        max_catchup_rounds: usize,
    ) -> Self {
        let mut hvs = Self {
            chain_id: chain_id.to_string(),
            height,
            validators,
            round: 0,
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
            max_catchup_rounds,
        };
        hvs.add_round(0);
        hvs
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> i32 {
        self.round
    }

    /// Tracks every round up to and including `round`. Rounds only move
    /// forward; the first call at round 0 is the only exception.
    pub fn set_round(&mut self, round: i32) -> Result<(), FatalError> {
        if self.round != 0 && round <= self.round {
            return Err(FatalError::Invariant(format!(
                "set_round({round}) must move past round {} at height {}",
                self.round, self.height
            )));
        }
        for r in self.round..=round {
            if !self.round_vote_sets.contains_key(&r) {
                self.add_round(r);
            }
        }
        self.round = round;
        Ok(())
    }

    fn add_round(&mut self, round: i32) {
        trace!("tracking votes for h={} r={round}", self.height);
        let new_set = |vote_type| {
            VoteSet::new(
                &self.chain_id,
                self.height,
                round,
                vote_type,
                self.validators.clone(),
            )
        };
        let rvs = RoundVoteSet {
            prevotes: new_set(VoteType::Prevote),
            precommits: new_set(VoteType::Precommit),
        };
        self.round_vote_sets.insert(round, rvs);
    }

    /// Adds a vote received from `peer`. A vote for an untracked round opens
    /// that round as one of the peer's catch-up rounds.
    pub fn add_vote(&mut self, vote: Vote, peer: &PeerId) -> Result<bool, VoteSetError> {
        if !self.round_vote_sets.contains_key(&vote.round) {
            let rounds = self.peer_catchup_rounds.entry(peer.clone()).or_default();
            if rounds.len() >= self.max_catchup_rounds {
                return Err(VoteSetError::UnwantedRound {
                    peer: peer.clone(),
                    round: vote.round,
                });
            }
            rounds.push(vote.round);
            debug!(
                "peer {peer} opened catch-up round h={} r={}",
                self.height, vote.round
            );
            self.add_round(vote.round);
        }
        match self.vote_set_mut(vote.round, vote.vote_type) {
            Some(set) => set.add_vote(vote),
            None => Ok(false),
        }
    }

    pub fn prevotes(&self, round: i32) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|rvs| &rvs.prevotes)
    }

    pub fn precommits(&self, round: i32) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|rvs| &rvs.precommits)
    }

    pub fn vote_set(&self, round: i32, vote_type: VoteType) -> Option<&VoteSet> {
        match vote_type {
            VoteType::Prevote => self.prevotes(round),
            VoteType::Precommit => self.precommits(round),
        }
    }

    fn vote_set_mut(&mut self, round: i32, vote_type: VoteType) -> Option<&mut VoteSet> {
        self.round_vote_sets
            .get_mut(&round)
            .map(|rvs| match vote_type {
                VoteType::Prevote => &mut rvs.prevotes,
                VoteType::Precommit => &mut rvs.precommits,
            })
    }

    /// The last round with a prevote polka and its block id, or
    /// `(-1, BlockId::default())`.
    pub fn pol_info(&self) -> (i32, BlockId) {
        self.round_vote_sets
            .iter()
            .rev()
            .filter(|(round, _)| **round <= self.round)
            .find_map(|(round, rvs)| rvs.prevotes.two_thirds_majority().map(|id| (*round, id)))
            .unwrap_or((-1, BlockId::default()))
    }

    /// Records a peer's claim of +2/3 for `block_id`. Unknown rounds are
    /// ignored.
    pub fn set_peer_maj23(
        &mut self,
        round: i32,
        vote_type: VoteType,
        peer: PeerId,
        block_id: BlockId,
    ) -> Result<(), VoteSetError> {
        match self.vote_set_mut(round, vote_type) {
            Some(set) => set.set_peer_maj23(peer, block_id),
            None => Ok(()),
        }
    }

    /// Tracked rounds in ascending order.
    pub fn rounds(&self) -> impl Iterator<Item = (&i32, &RoundVoteSet)> {
        self.round_vote_sets.iter()
    }
}
