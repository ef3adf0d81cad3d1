//! Property-based tests for gossip wire messages.
//!
//! Properties tested:
//! 1. A VoteSetBits message with more bits than `MAX_VOTES_COUNT` fails
//!    `validate_basic`; one within the limit passes.
//! 2. NewRoundStep validation accepts exactly the consistent
//!    height / round / last-commit-round combinations.
//! 3. Encoding and decoding both refuse anything over the size limit.

#[cfg(test)]
mod tests {
    use {
        crate::fixtures::make_block_id,
        kestrel_consensus_bft::RoundStep,
        kestrel_consensus_net::{ConsensusNetError, ConsensusNetMessage, MAX_VOTES_COUNT},
        kestrel_types::{BitArray, VoteType},
        proptest::prelude::*,
    };

    fn vote_set_bits(height: u64, round: i32, bits: usize) -> ConsensusNetMessage {
        ConsensusNetMessage::VoteSetBits {
            height,
            round,
            vote_type: VoteType::Precommit,
            block_id: make_block_id(7),
            votes: BitArray::new(bits),
        }
    }

    fn bit_counts() -> impl Strategy<Value = usize> {
        prop_oneof![
            0usize..=64,
            (MAX_VOTES_COUNT - 16)..=(MAX_VOTES_COUNT + 64),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn vote_set_bits_size_limit(
            bits in bit_counts(),
            height in 1u64..=1_000,
            round in 0i32..=10,
        ) {
            let msg = vote_set_bits(height, round, bits);
            let result = msg.validate_basic();
            if bits <= MAX_VOTES_COUNT {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(matches!(result, Err(ConsensusNetError::InvalidMessage(_))));
            }
        }

        #[test]
        fn new_round_step_validation(
            height in 0u64..=4,
            round in -2i32..=3,
            last_commit_round in -3i32..=3,
        ) {
            let msg = ConsensusNetMessage::NewRoundStep {
                height,
                round,
                step: RoundStep::Propose,
                seconds_since_start_time: 0,
                last_commit_round,
            };
            let consistent_lcr = if height == 1 {
                last_commit_round == -1
            } else {
                last_commit_round >= 0
            };
            let valid = height > 0 && round >= 0 && consistent_lcr;
            prop_assert_eq!(msg.validate_basic().is_ok(), valid);
        }

        #[test]
        fn size_limit_is_exact(bits in 0usize..=2_048, payload_slack in 1usize..=32) {
            let msg = vote_set_bits(3, 1, bits);
            let encoded = msg.encode(usize::MAX).unwrap();
            let len = encoded.len();

            prop_assert_eq!(&msg.encode(len).unwrap(), &encoded);
            prop_assert_eq!(&ConsensusNetMessage::decode(&encoded, len).unwrap(), &msg);

            let too_small = len.saturating_sub(payload_slack);
            let encode_rejected = matches!(
                msg.encode(too_small),
                Err(ConsensusNetError::MessageTooLarge { size, max })
                    if size == len && max == too_small
            );
            prop_assert!(encode_rejected);
            let decode_rejected = matches!(
                ConsensusNetMessage::decode(&encoded, too_small),
                Err(ConsensusNetError::MessageTooLarge { .. })
            );
            prop_assert!(decode_rejected);
        }
    }
}
