//! What we know about a peer's round state.
//!
//! A [`PeerState`] is updated from the peer's own announcements and from
//! what we send it, and is read by the gossip loops to decide what the peer
//! is still missing. It never reaches the consensus state machine.

use {
    crate::message::ConsensusNetMessage,
    kestrel_consensus_bft::RoundStep,
    kestrel_types::{
        now_ms, BitArray, PartSetHeader, PeerId, Proposal, Vote, VoteSetReader, VoteType,
    },
    parking_lot::Mutex,
    serde::Serialize,
    std::cmp::Ordering,
};

/// A peer's height, round and step, and which proposal parts and votes it
/// holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PeerRoundState {
    /// 0 until the peer announces itself.
    pub height: u64,
    pub round: i32,
    pub step: RoundStep,
    /// Estimated from the peer's `seconds_since_start_time`.
    pub start_time_ms: u64,

    pub proposal: bool,
    pub proposal_block_parts_header: PartSetHeader,
    pub proposal_block_parts: Option<BitArray>,
    /// Proof-of-lock round of the peer's proposal, -1 if none.
    pub proposal_pol_round: i32,
    /// None until the peer sends its proof-of-lock bits.
    pub proposal_pol: Option<BitArray>,

    pub prevotes: Option<BitArray>,
    pub precommits: Option<BitArray>,
    pub last_commit_round: i32,
    pub last_commit: Option<BitArray>,
    /// Round of a commit we are sending the peer while it catches up.
    pub catchup_commit_round: i32,
    pub catchup_commit: Option<BitArray>,
}

impl Default for PeerRoundState {
    fn default() -> Self {
        Self {
            height: 0,
            round: -1,
            step: RoundStep::NewHeight,
            start_time_ms: 0,
            proposal: false,
            proposal_block_parts_header: PartSetHeader::default(),
            proposal_block_parts: None,
            proposal_pol_round: -1,
            proposal_pol: None,
            prevotes: None,
            precommits: None,
            last_commit_round: -1,
            last_commit: None,
            catchup_commit_round: -1,
            catchup_commit: None,
        }
    }
}

impl PeerRoundState {
    fn vote_bit_array(&self, height: u64, round: i32, vote_type: VoteType) -> Option<&BitArray> {
        if self.height == height {
            if self.round == round {
                return match vote_type {
                    VoteType::Prevote => self.prevotes.as_ref(),
                    VoteType::Precommit => self.precommits.as_ref(),
                };
            }
            if self.catchup_commit_round == round {
                return match vote_type {
                    VoteType::Prevote => None,
                    VoteType::Precommit => self.catchup_commit.as_ref(),
                };
            }
            if self.proposal_pol_round == round {
                return match vote_type {
                    VoteType::Prevote => self.proposal_pol.as_ref(),
                    VoteType::Precommit => None,
                };
            }
            return None;
        }
        if self.height == height.saturating_add(1) && self.last_commit_round == round {
            return match vote_type {
                VoteType::Prevote => None,
                VoteType::Precommit => self.last_commit.as_ref(),
            };
        }
        None
    }

    fn vote_bit_array_mut(
        &mut self,
        height: u64,
        round: i32,
        vote_type: VoteType,
    ) -> Option<&mut BitArray> {
        if self.height == height {
            if self.round == round {
                return match vote_type {
                    VoteType::Prevote => self.prevotes.as_mut(),
                    VoteType::Precommit => self.precommits.as_mut(),
                };
            }
            if self.catchup_commit_round == round {
                return match vote_type {
                    VoteType::Prevote => None,
                    VoteType::Precommit => self.catchup_commit.as_mut(),
                };
            }
            if self.proposal_pol_round == round {
                return match vote_type {
                    VoteType::Prevote => self.proposal_pol.as_mut(),
                    VoteType::Precommit => None,
                };
            }
            return None;
        }
        if self.height == height.saturating_add(1) && self.last_commit_round == round {
            return match vote_type {
                VoteType::Prevote => None,
                VoteType::Precommit => self.last_commit.as_mut(),
            };
        }
        None
    }

    fn compare_hrs(&self, height: u64, round: i32, step: RoundStep) -> Ordering {
        height
            .cmp(&self.height)
            .then(round.cmp(&self.round))
            .then(step.cmp(&self.step))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PeerStats {
    pub votes: u64,
    pub block_parts: u64,
}

#[derive(Serialize)]
struct Inner {
    round_state: PeerRoundState,
    stats: PeerStats,
}

pub struct PeerState {
    peer_id: PeerId,
    inner: Mutex<Inner>,
}

impl PeerState {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            inner: Mutex::new(Inner {
                round_state: PeerRoundState::default(),
                stats: PeerStats::default(),
            }),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// A copy of the peer's round state.
    pub fn get_round_state(&self) -> PeerRoundState {
        self.inner.lock().round_state.clone()
    }

    pub fn stats(&self) -> PeerStats {
        self.inner.lock().stats
    }

    /// The round state and counters as JSON, for diagnostics.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&*self.inner.lock())
    }

    pub fn set_has_proposal(&self, proposal: &Proposal) {
        let prs = &mut self.inner.lock().round_state;
        if prs.height != proposal.height || prs.round != proposal.round || prs.proposal {
            return;
        }
        prs.proposal = true;
        // A NewValidBlock may already have told us which parts to expect.
        if prs.proposal_block_parts.is_some() {
            return;
        }
        prs.proposal_block_parts_header = proposal.block_parts_header;
        prs.proposal_block_parts = Some(BitArray::new(proposal.block_parts_header.total as usize));
        prs.proposal_pol_round = proposal.pol_round;
        prs.proposal_pol = None;
    }

    /// Starts tracking parts of a block the peer needs while catching up.
    pub fn init_proposal_block_parts(&self, header: PartSetHeader) {
        let prs = &mut self.inner.lock().round_state;
        if prs.proposal_block_parts.is_some() {
            return;
        }
        prs.proposal_block_parts_header = header;
        prs.proposal_block_parts = Some(BitArray::new(header.total as usize));
    }

    pub fn set_has_proposal_block_part(&self, height: u64, round: i32, index: u32) {
        let prs = &mut self.inner.lock().round_state;
        if prs.height != height || prs.round != round {
            return;
        }
        if let Some(parts) = prs.proposal_block_parts.as_mut() {
            parts.set_index(index as usize, true);
        }
    }

    /// Picks a vote from `votes` the peer does not have yet. The caller
    /// marks it with [`PeerState::set_has_vote`] once it is sent.
    pub fn pick_vote_to_send(&self, votes: &dyn VoteSetReader) -> Option<Vote> {
        let size = votes.size();
        if size == 0 {
            return None;
        }
        let (height, round, vote_type) = (votes.height(), votes.round(), votes.vote_type());
        let mut inner = self.inner.lock();
        let prs = &mut inner.round_state;
        if votes.is_commit() {
            ensure_catchup_commit_round(prs, height, round, size);
        }
        ensure_vote_bit_arrays(prs, height, size);
        let peer_votes = prs.vote_bit_array(height, round, vote_type)?;
        let index = votes.bit_array().sub(peer_votes).pick_random()?;
        votes.get_by_index(u32::try_from(index).ok()?).cloned()
    }

    /// Sizes the vote bit arrays for `height` once the validator count is
    /// known.
    pub fn ensure_vote_bit_arrays(&self, height: u64, num_validators: usize) {
        ensure_vote_bit_arrays(&mut self.inner.lock().round_state, height, num_validators);
    }

    pub fn ensure_catchup_commit_round(&self, height: u64, round: i32, num_validators: usize) {
        ensure_catchup_commit_round(
            &mut self.inner.lock().round_state,
            height,
            round,
            num_validators,
        );
    }

    pub fn set_has_vote(&self, vote: &Vote) {
        self.set_has_vote_at(vote.height, vote.round, vote.vote_type, vote.validator_index);
    }

    fn set_has_vote_at(&self, height: u64, round: i32, vote_type: VoteType, index: u32) {
        let prs = &mut self.inner.lock().round_state;
        if let Some(votes) = prs.vote_bit_array_mut(height, round, vote_type) {
            votes.set_index(index as usize, true);
        }
    }

    /// Counts a vote received from the peer. Returns the new total.
    pub fn record_vote(&self) -> u64 {
        let stats = &mut self.inner.lock().stats;
        stats.votes = stats.votes.saturating_add(1);
        stats.votes
    }

    /// Counts a block part received from the peer. Returns the new total.
    pub fn record_block_part(&self) -> u64 {
        let stats = &mut self.inner.lock().stats;
        stats.block_parts = stats.block_parts.saturating_add(1);
        stats.block_parts
    }

    /// Applies a message that only updates what we know about the peer.
    /// Returns false for messages this does not handle.
    pub fn apply(&self, msg: &ConsensusNetMessage) -> bool {
        match msg {
            ConsensusNetMessage::NewRoundStep {
                height,
                round,
                step,
                seconds_since_start_time,
                last_commit_round,
            } => self.apply_new_round_step(
                *height,
                *round,
                *step,
                *seconds_since_start_time,
                *last_commit_round,
            ),
            ConsensusNetMessage::NewValidBlock {
                height,
                round,
                block_parts_header,
                block_parts,
                is_commit,
            } => self.apply_new_valid_block(
                *height,
                *round,
                *block_parts_header,
                block_parts,
                *is_commit,
            ),
            ConsensusNetMessage::ProposalPol {
                height,
                proposal_pol_round,
                proposal_pol,
            } => self.apply_proposal_pol(*height, *proposal_pol_round, proposal_pol),
            ConsensusNetMessage::HasVote {
                height,
                round,
                vote_type,
                index,
            } => self.apply_has_vote(*height, *round, *vote_type, *index),
            _ => return false,
        }
        true
    }

    pub fn apply_new_round_step(
        &self,
        height: u64,
        round: i32,
        step: RoundStep,
        seconds_since_start_time: u64,
        last_commit_round: i32,
    ) {
        let prs = &mut self.inner.lock().round_state;
        // Ignore duplicates and regressions.
        if prs.compare_hrs(height, round, step) != Ordering::Greater {
            return;
        }

        let old_height = prs.height;
        let old_round = prs.round;

        prs.height = height;
        prs.round = round;
        prs.step = step;
        prs.start_time_ms = now_ms().saturating_sub(seconds_since_start_time.saturating_mul(1_000));

        if old_height == height && old_round == round {
            return;
        }
        let old_precommits = prs.precommits.take();
        prs.proposal = false;
        prs.proposal_block_parts_header = PartSetHeader::default();
        prs.proposal_block_parts = None;
        prs.proposal_pol_round = -1;
        prs.proposal_pol = None;
        // Resized once we know the validator count.
        prs.prevotes = None;

        if old_height == height {
            if round == prs.catchup_commit_round {
                // The peer moved to the round we were sending it a commit for.
                prs.precommits = prs.catchup_commit.clone();
            }
            return;
        }
        prs.last_commit_round = last_commit_round;
        prs.last_commit = if old_height.saturating_add(1) == height
            && old_round == last_commit_round
        {
            old_precommits
        } else {
            None
        };
        prs.catchup_commit_round = -1;
        prs.catchup_commit = None;
    }

    pub fn apply_new_valid_block(
        &self,
        height: u64,
        round: i32,
        block_parts_header: PartSetHeader,
        block_parts: &BitArray,
        is_commit: bool,
    ) {
        let prs = &mut self.inner.lock().round_state;
        if prs.height != height || (prs.round != round && !is_commit) {
            return;
        }
        prs.proposal_block_parts_header = block_parts_header;
        prs.proposal_block_parts = Some(block_parts.clone());
    }

    pub fn apply_proposal_pol(
        &self,
        height: u64,
        proposal_pol_round: i32,
        proposal_pol: &BitArray,
    ) {
        let prs = &mut self.inner.lock().round_state;
        if prs.height != height || prs.proposal_pol_round != proposal_pol_round {
            return;
        }
        prs.proposal_pol = Some(proposal_pol.clone());
    }

    pub fn apply_has_vote(&self, height: u64, round: i32, vote_type: VoteType, index: u32) {
        if self.inner.lock().round_state.height != height {
            return;
        }
        self.set_has_vote_at(height, round, vote_type, index);
    }

    /// Merges the peer's answer to our +2/3 announcement. `our_votes` are the
    /// votes we hold for the same block, if we are at that height; any of
    /// those the peer did not claim are assumed missing on its side.
    pub fn apply_vote_set_bits(
        &self,
        height: u64,
        round: i32,
        vote_type: VoteType,
        votes: &BitArray,
        our_votes: Option<&BitArray>,
    ) {
        let prs = &mut self.inner.lock().round_state;
        let Some(peer_votes) = prs.vote_bit_array_mut(height, round, vote_type) else {
            return;
        };
        match our_votes {
            None => peer_votes.update(votes),
            Some(ours) => {
                let has_votes = peer_votes.sub(ours).or(votes);
                peer_votes.update(&has_votes);
            }
        }
    }
}

fn ensure_vote_bit_arrays(prs: &mut PeerRoundState, height: u64, num_validators: usize) {
    if prs.height == height {
        for bits in [
            &mut prs.prevotes,
            &mut prs.precommits,
            &mut prs.catchup_commit,
            &mut prs.proposal_pol,
        ] {
            if bits.is_none() {
                *bits = Some(BitArray::new(num_validators));
            }
        }
    } else if prs.height == height.saturating_add(1) && prs.last_commit.is_none() {
        prs.last_commit = Some(BitArray::new(num_validators));
    }
}

fn ensure_catchup_commit_round(
    prs: &mut PeerRoundState,
    height: u64,
    round: i32,
    num_validators: usize,
) {
    if prs.height != height || prs.catchup_commit_round == round {
        return;
    }
    prs.catchup_commit_round = round;
    prs.catchup_commit = if round == prs.round {
        prs.precommits.clone()
    } else {
        Some(BitArray::new(num_validators))
    };
}
