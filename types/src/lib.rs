//! # Kestrel Types
//!
//! The data model shared by consensus, gossip and block storage: blocks and
//! their gossip parts, votes, proposals, commits, the weighted validator set
//! and the private validator that signs on a node's behalf.
//!
//! Heights are `u64` and start at 1. Rounds are `i32`; -1 marks "no round"
//! in fields such as `locked_round` or `pol_round`.

pub mod bit_array;
pub mod block;
pub mod block_id;
pub mod chain_state;
pub mod error;
pub mod merkle;
pub mod part_set;
pub mod priv_validator;
pub mod proposal;
pub mod validator;
pub mod vote;

pub use {
    bit_array::BitArray,
    block::{Block, BlockMeta, Commit, Header, Transaction},
    block_id::{BlockId, PartSetHeader},
    chain_state::{ChainState, GenesisDoc, GenesisValidator},
    error::{FatalError, TypesError},
    part_set::{Part, PartSet, BLOCK_PART_SIZE_BYTES},
    priv_validator::{KeypairValidator, PrivValidator},
    proposal::Proposal,
    validator::{Validator, ValidatorSet},
    vote::{Vote, VoteSetReader, VoteType},
};

use {
    serde::{Deserialize, Serialize},
    std::{
        fmt,
        time::{SystemTime, UNIX_EPOCH},
    },
};

/// Strict two-thirds supermajority: `3 * voted > 2 * total`.
pub fn exceeds_two_thirds(voted: u64, total: u64) -> bool {
    (voted as u128).saturating_mul(3) > (total as u128).saturating_mul(2)
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Transport-level identity of a connected peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_thirds_threshold() {
        assert!(!exceeds_two_thirds(2, 3));
        assert!(exceeds_two_thirds(3, 4));
        assert!(!exceeds_two_thirds(6, 9));
        assert!(exceeds_two_thirds(7, 9));
        assert!(!exceeds_two_thirds(0, 0));
        assert!(exceeds_two_thirds(u64::MAX, u64::MAX));
    }
}
