//! Double-sign evidence collection.
//!
//! Vote sets reject a second, different vote from a validator for the same
//! height, round and type. Both votes are signed, so the pair proves the
//! validator misbehaved. This module keeps those pairs until they are
//! drained for submission.

use {
    kestrel_types::{Vote, VoteType},
    log::*,
    serde::{Deserialize, Serialize},
    solana_pubkey::Pubkey,
    std::collections::HashSet,
};

/// Two conflicting signed votes from one validator.
///
/// `vote_a` is the vote with the lower block hash, so the same pair always
/// produces the same evidence regardless of arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateVoteEvidence {
    pub vote_a: Vote,
    pub vote_b: Vote,
}

impl DuplicateVoteEvidence {
    /// `None` unless the votes really conflict.
    pub fn new(first: Vote, second: Vote) -> Option<Self> {
        let conflicting = first.validator_address == second.validator_address
            && first.height == second.height
            && first.round == second.round
            && first.vote_type == second.vote_type
            && first.block_id != second.block_id;
        if !conflicting {
            return None;
        }
        let (vote_a, vote_b) = if first.block_id.hash <= second.block_id.hash {
            (first, second)
        } else {
            (second, first)
        };
        Some(Self { vote_a, vote_b })
    }

    pub fn validator(&self) -> Pubkey {
        self.vote_a.validator_address
    }

    pub fn height(&self) -> u64 {
        self.vote_a.height
    }

    pub fn round(&self) -> i32 {
        self.vote_a.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_a.vote_type
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EvidenceKey {
    validator: Pubkey,
    height: u64,
    round: i32,
    vote_type: VoteType,
}

impl From<&DuplicateVoteEvidence> for EvidenceKey {
    fn from(ev: &DuplicateVoteEvidence) -> Self {
        Self {
            validator: ev.validator(),
            height: ev.height(),
            round: ev.round(),
            vote_type: ev.vote_type(),
        }
    }
}

/// Collects double-sign evidence, one entry per offence.
#[derive(Debug, Default)]
pub struct EvidenceCollector {
    seen: HashSet<EvidenceKey>,
    evidence: Vec<DuplicateVoteEvidence>,
    /// Offences below this height are no longer tracked.
    min_height: u64,
}

impl EvidenceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the conflict between `existing` and `conflicting`. Returns the
    /// evidence if it is new.
    pub fn record(&mut self, existing: Vote, conflicting: Vote) -> Option<DuplicateVoteEvidence> {
        let ev = DuplicateVoteEvidence::new(existing, conflicting)?;
        if ev.height() < self.min_height {
            return None;
        }
        if !self.seen.insert(EvidenceKey::from(&ev)) {
            return None;
        }
        warn!(
            "double sign by {} at {}/{} {}: {} vs {}",
            ev.validator(),
            ev.height(),
            ev.round(),
            ev.vote_type(),
            ev.vote_a.block_id,
            ev.vote_b.block_id
        );
        self.evidence.push(ev.clone());
        Some(ev)
    }

    /// Stops tracking offences below `min_height`. Collected evidence is
    /// kept until drained.
    pub fn prune(&mut self, min_height: u64) {
        self.min_height = min_height;
        self.seen.retain(|k| k.height >= min_height);
    }

    pub fn evidence(&self) -> &[DuplicateVoteEvidence] {
        &self.evidence
    }

    pub fn drain_evidence(&mut self) -> Vec<DuplicateVoteEvidence> {
        std::mem::take(&mut self.evidence)
    }

    pub fn has_evidence_against(&self, validator: &Pubkey) -> bool {
        self.evidence.iter().any(|e| e.validator() == *validator)
    }
}
