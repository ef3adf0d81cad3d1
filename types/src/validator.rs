//! Weighted validator set with proposer-priority rotation.
//!
//! Validators are ordered by voting power (descending), then address
//! (ascending), so every node derives the same validator indices. Proposer
//! selection is a weighted round-robin: each increment adds every
//! validator's power to its priority, the highest priority proposes and pays
//! the total power back. Over `total_voting_power` increments each validator
//! proposes exactly `voting_power` times.

use {
    crate::{
        block::Commit,
        block_id::BlockId,
        error::TypesError,
        vote::{VoteSetReader, VoteType},
    },
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_sha256_hasher::hashv,
    std::collections::{HashMap, HashSet},
};

/// Keeps priority arithmetic well inside `i64`.
pub const MAX_TOTAL_VOTING_POWER: u64 = (i64::MAX / 8) as u64;

/// Priorities are rescaled so that max - min stays within this many times
/// the total voting power.
const PRIORITY_WINDOW_SIZE_FACTOR: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Pubkey,
    pub voting_power: u64,
    pub proposer_priority: i64,
}

impl Validator {
    pub fn new(address: Pubkey, voting_power: u64) -> Self {
        Self {
            address,
            voting_power,
            proposer_priority: 0,
        }
    }

    /// Higher priority wins; ties go to the lower address.
    fn compare_priority(&self, other: &Validator) -> std::cmp::Ordering {
        self.proposer_priority
            .cmp(&other.proposer_priority)
            .then_with(|| other.address.cmp(&self.address))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    #[serde(skip)]
    index: HashMap<Pubkey, usize>,
    proposer: Option<usize>,
    total_voting_power: u64,
}

impl PartialEq for ValidatorSet {
    fn eq(&self, other: &Self) -> bool {
        self.validators == other.validators && self.proposer == other.proposer
    }
}

impl Eq for ValidatorSet {}

impl ValidatorSet {
    /// Builds a set and selects its first proposer.
    pub fn new(validators: Vec<Validator>) -> Result<Self, TypesError> {
        let mut seen = HashSet::new();
        let mut total: u64 = 0;
        for v in &validators {
            if !seen.insert(v.address) {
                return Err(TypesError::DuplicateValidator(v.address));
            }
            if v.voting_power == 0 {
                return Err(TypesError::ZeroVotingPower(v.address));
            }
            total = total.saturating_add(v.voting_power);
            if total > MAX_TOTAL_VOTING_POWER {
                return Err(TypesError::TotalVotingPowerOverflow(total));
            }
        }

        let mut validators = validators;
        validators.sort_by(|a, b| {
            b.voting_power
                .cmp(&a.voting_power)
                .then_with(|| a.address.cmp(&b.address))
        });

        let mut set = Self {
            validators,
            index: HashMap::new(),
            proposer: None,
            total_voting_power: total,
        };
        set.rebuild_index();
        if !set.validators.is_empty() {
            set.advance_proposer(1);
        }
        Ok(set)
    }

    /// Restores the address index after deserialization.
    pub fn rebuild_index(&mut self) {
        self.index = self
            .validators
            .iter()
            .enumerate()
            .map(|(i, v)| (v.address, i))
            .collect();
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_voting_power(&self) -> u64 {
        self.total_voting_power
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    pub fn has_address(&self, address: &Pubkey) -> bool {
        self.get_by_address(address).is_some()
    }

    /// Index and validator for `address`.
    pub fn get_by_address(&self, address: &Pubkey) -> Option<(u32, &Validator)> {
        match self.index.get(address) {
            Some(i) => self.validators.get(*i).map(|v| (*i as u32, v)),
            // Index is skipped by serde; fall back to a scan.
            None if self.index.len() != self.validators.len() => self
                .validators
                .iter()
                .enumerate()
                .find(|(_, v)| v.address == *address)
                .map(|(i, v)| (i as u32, v)),
            None => None,
        }
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    pub fn get_proposer(&self) -> Option<&Validator> {
        match self.proposer {
            Some(i) => self.validators.get(i),
            None => self.find_proposer().and_then(|i| self.validators.get(i)),
        }
    }

    pub fn is_proposer(&self, address: &Pubkey) -> bool {
        self.get_proposer().is_some_and(|p| p.address == *address)
    }

    /// Commits to the validator addresses and powers, not the priorities.
    pub fn hash(&self) -> Hash {
        let mut items: Vec<Vec<u8>> = Vec::with_capacity(self.validators.len());
        for v in &self.validators {
            let mut item = v.address.to_bytes().to_vec();
            item.extend_from_slice(&v.voting_power.to_le_bytes());
            items.push(item);
        }
        let refs: Vec<&[u8]> = items.iter().map(Vec::as_slice).collect();
        hashv(&refs)
    }

    /// Runs `times` rounds of proposer selection.
    pub fn advance_proposer(&mut self, times: u32) {
        if self.validators.is_empty() || times == 0 {
            return;
        }
        let total = self.total_voting_power as i64;
        self.rescale_priorities(PRIORITY_WINDOW_SIZE_FACTOR.saturating_mul(total));
        self.shift_by_avg_priority();
        for _ in 0..times {
            self.proposer = Some(self.increment_once());
        }
    }

    /// A copy advanced by `times`, leaving `self` untouched.
    pub fn copy_advance(&self, times: u32) -> Self {
        let mut copy = self.clone();
        copy.advance_proposer(times);
        copy
    }

    /// Checks that `commit` carries +2/3 of this set's power for `block_id`.
    pub fn verify_commit(
        &self,
        chain_id: &str,
        block_id: &BlockId,
        height: u64,
        commit: &Commit,
    ) -> Result<(), TypesError> {
        if commit.size() != self.size() {
            return Err(TypesError::InvalidCommit(format!(
                "commit has {} slots, validator set has {}",
                commit.size(),
                self.size()
            )));
        }
        if commit.height() != height {
            return Err(TypesError::InvalidCommit(format!(
                "commit is for height {}, expected {height}",
                commit.height()
            )));
        }
        if commit.block_id != *block_id {
            return Err(TypesError::InvalidCommit(format!(
                "commit is for block {}, expected {block_id}",
                commit.block_id
            )));
        }
        let mut tallied: u64 = 0;
        for (index, vote) in commit.precommits.iter().enumerate() {
            let Some(vote) = vote else { continue };
            let Some(validator) = self.validators.get(index) else {
                continue;
            };
            if vote.vote_type != VoteType::Precommit {
                return Err(TypesError::InvalidCommit(format!("vote {index} is not a precommit")));
            }
            vote.verify(chain_id, &validator.address)?;
            if vote.block_id == *block_id {
                tallied = tallied.saturating_add(validator.voting_power);
            }
        }
        if crate::exceeds_two_thirds(tallied, self.total_voting_power) {
            Ok(())
        } else {
            Err(TypesError::InvalidCommit(format!(
                "insufficient voting power: got {tallied}, total {}",
                self.total_voting_power
            )))
        }
    }

    fn find_proposer(&self) -> Option<usize> {
        self.validators
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.compare_priority(b))
            .map(|(i, _)| i)
    }

    fn increment_once(&mut self) -> usize {
        for v in self.validators.iter_mut() {
            v.proposer_priority = v.proposer_priority.saturating_add(v.voting_power as i64);
        }
        // Non-empty: checked by the caller.
        let proposer = self.find_proposer().unwrap_or(0);
        let total = self.total_voting_power as i64;
        let chosen = &mut self.validators[proposer];
        chosen.proposer_priority = chosen.proposer_priority.saturating_sub(total);
        proposer
    }

    fn rescale_priorities(&mut self, diff_max: i64) {
        if diff_max <= 0 {
            return;
        }
        let max = self.validators.iter().map(|v| v.proposer_priority).max().unwrap_or(0);
        let min = self.validators.iter().map(|v| v.proposer_priority).min().unwrap_or(0);
        let diff = max.saturating_sub(min);
        if diff > diff_max {
            let ratio = diff
                .saturating_add(diff_max.saturating_sub(1))
                .checked_div(diff_max)
                .unwrap_or(1);
            for v in self.validators.iter_mut() {
                v.proposer_priority = v.proposer_priority.checked_div(ratio).unwrap_or(0);
            }
        }
    }

    fn shift_by_avg_priority(&mut self) {
        let n = self.validators.len() as i128;
        if n == 0 {
            return;
        }
        let sum: i128 = self
            .validators
            .iter()
            .map(|v| v.proposer_priority as i128)
            .sum();
        let avg = sum.checked_div(n).unwrap_or(0) as i64;
        for v in self.validators.iter_mut() {
            v.proposer_priority = v.proposer_priority.saturating_sub(avg);
        }
    }
}
