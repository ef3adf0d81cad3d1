//! Property-based tests for the consensus state machine.
//!
//! Properties tested:
//! 1. Round-step monotonicity: timeouts and votes for a height, round or
//!    step the state machine already left change nothing.
//! 2. Proposer rotation is deterministic and stays inside the validator
//!    set.

#[cfg(test)]
mod tests {
    use {
        crate::fixtures::{make_validators, signed_vote, CHAIN_ID},
        kestrel_chain_store::{BlockOperations, HashChainExecutor, MemoryStore, MemoryTxPool},
        kestrel_consensus_bft::{
            ConsensusConfig, ConsensusMessage, ConsensusState, MsgInfo, RoundStep, TimeoutInfo,
        },
        kestrel_monitoring::ConsensusMetrics,
        kestrel_types::{
            BlockId, ChainState, GenesisDoc, GenesisValidator, KeypairValidator, PeerId,
            ValidatorSet, VoteType,
        },
        proptest::{collection::vec, prelude::*},
        solana_hash::Hash,
        solana_keypair::Keypair,
        solana_signer::Signer,
        std::{sync::Arc, time::Duration},
    };

    const STEPS: [RoundStep; 8] = [
        RoundStep::NewHeight,
        RoundStep::NewRound,
        RoundStep::Propose,
        RoundStep::Prevote,
        RoundStep::PrevoteWait,
        RoundStep::Precommit,
        RoundStep::PrecommitWait,
        RoundStep::Commit,
    ];

    /// Four equal validators at height 1, with us holding `keys[0]`'s seat
    /// and the others returned with their indices.
    fn make_state_machine() -> (ConsensusState, Vec<(u32, Keypair)>) {
        let mut keys: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let state = ChainState::from_genesis(&GenesisDoc {
            chain_id: CHAIN_ID.to_string(),
            genesis_time_ms: 0,
            validators: keys
                .iter()
                .map(|k| GenesisValidator {
                    address: k.pubkey(),
                    power: 10,
                })
                .collect(),
            initial_state_root: Hash::default(),
        })
        .unwrap();
        let ours = keys.remove(0);
        let others = keys
            .into_iter()
            .map(|k| (state.validators.get_by_address(&k.pubkey()).unwrap().0, k))
            .collect();

        let config = ConsensusConfig::dev_default();
        let block_ops = Arc::new(
            BlockOperations::new(
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryTxPool::new(10, false)),
                Arc::new(HashChainExecutor::default()),
                config.block_limits(),
            )
            .unwrap(),
        );
        let cs = ConsensusState::new(
            config,
            state,
            block_ops,
            Some(Box::new(KeypairValidator::new(ours))),
            Arc::new(ConsensusMetrics::new()),
        )
        .unwrap();
        (cs, others)
    }

    fn deliver_prevotes(cs: &mut ConsensusState, others: &[(u32, Keypair)], round: i32) {
        for (index, key) in others {
            let vote = signed_vote(key, *index, 1, round, VoteType::Prevote, BlockId::default());
            cs.handle_msg(MsgInfo::from_peer(
                ConsensusMessage::Vote(vote),
                PeerId::new("peer"),
            ))
            .unwrap();
            cs.drain_internal_queue().unwrap();
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 1. Round-step monotonicity
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn stale_timeouts_are_noops(
            skip_to in 1i32..=4,
            stale in vec((0u64..=3, 0i32..=4, 0usize..8), 1..=10),
        ) {
            let (mut cs, others) = make_state_machine();
            cs.start_round0().unwrap();
            cs.drain_internal_queue().unwrap();
            deliver_prevotes(&mut cs, &others, skip_to);
            prop_assert_eq!(cs.round_state().round, skip_to);
            let before = cs.round_state().summary();

            for (height, round, step) in stale {
                let step = STEPS[step];
                let is_stale = height != 1
                    || round < before.round
                    || (round == before.round && step < before.step);
                if !is_stale {
                    continue;
                }
                cs.handle_timeout(TimeoutInfo {
                    duration: Duration::ZERO,
                    height,
                    round,
                    step,
                })
                .unwrap();
                cs.drain_internal_queue().unwrap();
                prop_assert_eq!(&cs.round_state().summary(), &before);
            }
        }

        #[test]
        fn old_round_votes_do_not_move_round(skip_to in 2i32..=4, old in 0i32..=1) {
            let (mut cs, others) = make_state_machine();
            cs.start_round0().unwrap();
            cs.drain_internal_queue().unwrap();
            deliver_prevotes(&mut cs, &others, skip_to);
            let (round, step) = (cs.round_state().round, cs.round_state().step);

            deliver_prevotes(&mut cs, &others, old);
            prop_assert_eq!(cs.round_state().round, round);
            prop_assert!(cs.round_state().step >= step);
            prop_assert_eq!(cs.round_state().height, 1);
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 2. Proposer rotation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn proposer_rotation_is_deterministic(
            powers in vec(1u64..=1_000, 1..=8),
            times in 0u32..=50,
        ) {
            let (vals, _keys) = make_validators(&powers);
            let a: ValidatorSet = vals.copy_advance(times);
            let b: ValidatorSet = vals.copy_advance(times);
            let pa = a.get_proposer().map(|v| v.address);
            let pb = b.get_proposer().map(|v| v.address);
            prop_assert_eq!(pa, pb);
            let proposer = pa.unwrap();
            prop_assert!(vals.has_address(&proposer));
            prop_assert_eq!(a.hash(), vals.hash());
        }

        /// With equal power every validator proposes once per `n` rounds.
        #[test]
        fn equal_power_rotates_through_everyone(n in 1usize..=8) {
            let (vals, _keys) = make_validators(&vec![5; n]);
            let mut set = (*vals).clone();
            let mut seen = std::collections::HashSet::new();
            for _ in 0..n {
                seen.insert(set.get_proposer().unwrap().address);
                set.advance_proposer(1);
            }
            prop_assert_eq!(seen.len(), n);
        }
    }
}
