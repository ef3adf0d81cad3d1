use {
    kestrel_types::{BlockId, PartSetHeader, Validator, ValidatorSet, Vote, VoteType},
    solana_hash::Hash,
    solana_keypair::Keypair,
    solana_signature::Signature,
    solana_signer::Signer,
    std::sync::Arc,
};

pub const CHAIN_ID: &str = "invariants";

/// Keypairs ordered by their index in the returned set.
pub fn make_validators(powers: &[u64]) -> (Arc<ValidatorSet>, Vec<Keypair>) {
    let mut keys: Vec<Keypair> = powers.iter().map(|_| Keypair::new()).collect();
    let set = ValidatorSet::new(
        keys.iter()
            .zip(powers)
            .map(|(k, p)| Validator::new(k.pubkey(), *p))
            .collect(),
    )
    .unwrap();
    keys.sort_by_key(|k| set.get_by_address(&k.pubkey()).unwrap().0);
    (Arc::new(set), keys)
}

/// A complete block id derived from `seed`, which must be non-zero.
pub fn make_block_id(seed: u8) -> BlockId {
    BlockId::new(
        Hash::new_from_array([seed; 32]),
        PartSetHeader {
            total: 1,
            hash: Hash::new_from_array([!seed; 32]),
        },
    )
}

pub fn signed_vote(
    key: &Keypair,
    index: u32,
    height: u64,
    round: i32,
    vote_type: VoteType,
    block_id: BlockId,
) -> Vote {
    let mut vote = Vote {
        validator_address: key.pubkey(),
        validator_index: index,
        height,
        round,
        timestamp_ms: 1,
        vote_type,
        block_id,
        signature: Signature::default(),
    };
    vote.signature = key.sign_message(&vote.sign_bytes(CHAIN_ID));
    vote
}

/// Summed power of the validators set in `indices`.
pub fn power_of(validators: &ValidatorSet, indices: &[usize]) -> u64 {
    indices
        .iter()
        .filter_map(|i| validators.get_by_index(*i as u32))
        .map(|v| v.voting_power)
        .sum()
}
