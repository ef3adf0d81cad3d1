//! Property-based tests for vote counting.
//!
//! Properties tested:
//! 1. Majority threshold: a block has +2/3 iff `3 * voted > 2 * total`.
//! 2. Uniqueness: a vote set never holds two blocks with +2/3.
//! 3. Conflicts: a second, different vote from a validator is rejected and
//!    the first one is kept.
//! 4. Catch-up rounds: a peer opens at most `max_catchup_rounds` unknown
//!    rounds.

#[cfg(test)]
mod tests {
    use {
        crate::fixtures::{make_block_id, make_validators, power_of, signed_vote, CHAIN_ID},
        kestrel_consensus_bft::{HeightVoteSet, VoteSet, VoteSetError},
        kestrel_types::{exceeds_two_thirds, BlockId, PeerId, VoteSetReader, VoteType},
        proptest::{collection::vec, prelude::*},
    };

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 1. Majority threshold
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn majority_iff_more_than_two_thirds(
            powers in vec(1u64..=100, 1..=7),
            voters in vec(any::<bool>(), 7),
        ) {
            let (vals, keys) = make_validators(&powers);
            let block = make_block_id(1);
            let mut set = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Prevote, vals.clone());

            let mut voted = Vec::new();
            for (index, key) in keys.iter().enumerate() {
                if !voters[index] {
                    continue;
                }
                let vote = signed_vote(key, index as u32, 1, 0, VoteType::Prevote, block);
                prop_assert!(set.add_vote(vote).unwrap());
                voted.push(index);
            }

            let voted_power = power_of(&vals, &voted);
            let expected = voted_power * 3 > vals.total_voting_power() * 2;
            prop_assert_eq!(set.sum(), voted_power);
            prop_assert_eq!(set.has_two_thirds_majority(), expected);
            prop_assert_eq!(set.two_thirds_majority(), expected.then_some(block));
        }

        /// Exactly two thirds is not enough; one more unit of power is.
        #[test]
        fn exactly_two_thirds_is_not_a_majority(m in 1usize..=5) {
            let (vals, keys) = make_validators(&vec![1; m * 3]);
            let block = make_block_id(2);
            let mut set = VoteSet::new(CHAIN_ID, 1, 0, VoteType::Precommit, vals);

            for (index, key) in keys.iter().enumerate().take(m * 2) {
                set.add_vote(signed_vote(key, index as u32, 1, 0, VoteType::Precommit, block))
                    .unwrap();
            }
            prop_assert!(!set.has_two_thirds_majority());
            prop_assert!(!set.has_two_thirds_any());

            let next = m * 2;
            set.add_vote(signed_vote(&keys[next], next as u32, 1, 0, VoteType::Precommit, block))
                .unwrap();
            prop_assert_eq!(set.two_thirds_majority(), Some(block));
            prop_assert!(set.is_commit());
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 2. At most one majority block per vote set
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn order_and_choices() -> impl Strategy<Value = (Vec<u64>, Vec<usize>, Vec<u8>)> {
        vec(1u64..=50, 1..=7).prop_flat_map(|powers| {
            let n = powers.len();
            (
                Just(powers),
                Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
                vec(0u8..3, n),
            )
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn at_most_one_majority((powers, order, choices) in order_and_choices()) {
            let (vals, keys) = make_validators(&powers);
            let candidates = [make_block_id(1), make_block_id(2), BlockId::default()];
            let mut set = VoteSet::new(CHAIN_ID, 3, 1, VoteType::Prevote, vals.clone());
            let total = vals.total_voting_power();

            for index in order {
                let block_id = candidates[choices[index] as usize];
                let vote =
                    signed_vote(&keys[index], index as u32, 3, 1, VoteType::Prevote, block_id);
                prop_assert!(set.add_vote(vote).unwrap());

                let with_majority: Vec<BlockId> = candidates
                    .iter()
                    .filter(|id| {
                        let voters = set
                            .bit_array_by_block_id(id)
                            .map(|bits| bits.true_indices())
                            .unwrap_or_default();
                        exceeds_two_thirds(power_of(&vals, &voters), total)
                    })
                    .copied()
                    .collect();
                prop_assert!(with_majority.len() <= 1);
                prop_assert_eq!(set.two_thirds_majority(), with_majority.first().copied());
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 3. Conflicting votes are rejected
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn conflicting_vote_is_rejected(
            powers in vec(1u64..=100, 1..=7),
            pick in any::<prop::sample::Index>(),
            first_nil in any::<bool>(),
            precommit in any::<bool>(),
        ) {
            let (vals, keys) = make_validators(&powers);
            let index = pick.index(keys.len());
            let vote_type = if precommit { VoteType::Precommit } else { VoteType::Prevote };
            let (first_id, second_id) = if first_nil {
                (BlockId::default(), make_block_id(1))
            } else {
                (make_block_id(1), make_block_id(2))
            };
            let first = signed_vote(&keys[index], index as u32, 5, 2, vote_type, first_id);
            let second = signed_vote(&keys[index], index as u32, 5, 2, vote_type, second_id);

            let mut set = VoteSet::new(CHAIN_ID, 5, 2, vote_type, vals.clone());
            prop_assert!(set.add_vote(first.clone()).unwrap());
            let sum = set.sum();

            let rejected = matches!(
                set.add_vote(second),
                Err(VoteSetError::ConflictingVote { .. })
            );
            prop_assert!(rejected);
            prop_assert_eq!(set.get_by_index(index as u32), Some(&first));
            prop_assert_eq!(set.sum(), sum);
            // The original vote is still a no-op duplicate.
            prop_assert!(!set.add_vote(first).unwrap());
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 4. Bounded catch-up rounds
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn peer_catchup_rounds_are_bounded(
            rounds in prop::collection::btree_set(1i32..=50, 1..=8),
            max_catchup in 0usize..=3,
        ) {
            let (vals, keys) = make_validators(&[1, 1, 1, 1]);
            let mut hvs = HeightVoteSet::new(CHAIN_ID, 1, vals, max_catchup);
            let peer = PeerId::new("peer");

            let mut accepted = 0usize;
            for round in &rounds {
                let vote = signed_vote(&keys[0], 0, 1, *round, VoteType::Prevote, make_block_id(1));
                match hvs.add_vote(vote, &peer) {
                    Ok(added) => {
                        prop_assert!(added);
                        accepted += 1;
                    }
                    Err(VoteSetError::UnwantedRound { round: r, .. }) => {
                        prop_assert_eq!(r, *round);
                        prop_assert!(hvs.prevotes(*round).is_none());
                    }
                    Err(err) => prop_assert!(false, "unexpected error {}", err),
                }
            }
            prop_assert_eq!(accepted, rounds.len().min(max_catchup));

            // Rounds a peer already opened stay open to it.
            if let Some(round) = rounds.iter().next().filter(|_| max_catchup > 0) {
                let vote =
                    signed_vote(&keys[1], 1, 1, *round, VoteType::Precommit, make_block_id(1));
                prop_assert!(hvs.add_vote(vote, &peer).unwrap());
            }
            // Another peer has its own budget.
            let other = PeerId::new("other");
            let vote = signed_vote(&keys[2], 2, 1, 99, VoteType::Prevote, make_block_id(1));
            prop_assert_eq!(hvs.add_vote(vote, &other).is_ok(), max_catchup > 0);
        }
    }
}
