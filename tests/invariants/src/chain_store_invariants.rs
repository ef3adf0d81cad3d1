//! Property-based tests for block storage.
//!
//! Properties tested:
//! 1. Contiguity: saving a block at any height other than `height() + 1`
//!    is a fatal error and leaves the store untouched; saving at
//!    `height() + 1` advances `height()` to it.
//! 2. Stored parts reassemble the saved block.

#[cfg(test)]
mod tests {
    use {
        crate::fixtures::CHAIN_ID,
        kestrel_chain_store::{
            BlockLimits, BlockOperations, HashChainExecutor, MemoryStore, MemoryTxPool,
            StoreError,
        },
        kestrel_types::{
            Block, ChainState, Commit, FatalError, GenesisDoc, GenesisValidator, PartSet,
        },
        proptest::prelude::*,
        solana_hash::Hash,
        solana_keypair::Keypair,
        solana_signer::Signer,
        std::sync::Arc,
    };

    fn make_state() -> ChainState {
        ChainState::from_genesis(&GenesisDoc {
            chain_id: CHAIN_ID.to_string(),
            genesis_time_ms: 0,
            validators: vec![GenesisValidator {
                address: Keypair::new().pubkey(),
                power: 10,
            }],
            initial_state_root: Hash::default(),
        })
        .unwrap()
    }

    fn make_block_ops(part_size: usize) -> BlockOperations {
        BlockOperations::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryTxPool::new(10, false)),
            Arc::new(HashChainExecutor::default()),
            BlockLimits {
                block_part_size: part_size,
                ..BlockLimits::default()
            },
        )
        .unwrap()
    }

    fn make_block(
        block_ops: &BlockOperations,
        state: &ChainState,
        height: u64,
    ) -> (Block, PartSet) {
        let proposer = state.validators.get_proposer().unwrap().address;
        block_ops
            .create_proposal_block(height, state, proposer, Commit::empty())
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn save_block_is_contiguous(saved in 0u64..=5, attempt in 0u64..=10) {
            let state = make_state();
            let block_ops = make_block_ops(64);
            for height in 1..=saved {
                let (block, parts) = make_block(&block_ops, &state, height);
                block_ops.save_block(&block, &parts, &Commit::empty()).unwrap();
                prop_assert_eq!(block_ops.height(), height);
            }

            let (block, parts) = make_block(&block_ops, &state, attempt);
            let result = block_ops.save_block(&block, &parts, &Commit::empty());
            if attempt == saved + 1 {
                prop_assert!(result.is_ok());
                prop_assert_eq!(block_ops.height(), attempt);
                let meta = block_ops.load_block_meta(attempt).unwrap().unwrap();
                prop_assert_eq!(meta.block_id.hash, block.hash());
            } else {
                let non_contiguous = matches!(
                    result,
                    Err(StoreError::Fatal(FatalError::NonContiguousHeight {
                        store_height,
                        block_height,
                    })) if store_height == saved && block_height == attempt
                );
                prop_assert!(non_contiguous);
                prop_assert_eq!(block_ops.height(), saved);
                let stored = block_ops.load_block_meta(attempt).unwrap();
                prop_assert!(stored.is_none() || attempt <= saved);
            }
        }

        #[test]
        fn stored_parts_reassemble_block(part_size in 16usize..=256) {
            let state = make_state();
            let block_ops = make_block_ops(part_size);
            let (block, parts) = make_block(&block_ops, &state, 1);
            block_ops.save_block(&block, &parts, &Commit::empty()).unwrap();

            let meta = block_ops.load_block_meta(1).unwrap().unwrap();
            prop_assert_eq!(meta.block_id.parts_header, parts.header());
            for index in 0..parts.total() {
                let stored = block_ops.load_block_part(1, index).unwrap().unwrap();
                prop_assert_eq!(Some(&stored), parts.get_part(index));
            }
            prop_assert!(block_ops.load_block_part(1, parts.total()).unwrap().is_none());
            prop_assert_eq!(block_ops.load_block(1).unwrap(), Some(block));
        }
    }
}
