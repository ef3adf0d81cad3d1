//! Block validation and execution against chain state.

use {
    crate::error::{Result, StoreError},
    kestrel_types::{Block, BlockId, ChainState, Transaction, VoteSetReader},
    solana_hash::Hash,
    solana_sha256_hasher::hashv,
};

pub trait StateExecutor: Send + Sync {
    /// Full validation of a proposed block on top of `state`.
    fn validate_block(&self, state: &ChainState, block: &Block) -> Result<()>;

    /// State root after executing `txs` on top of `state`.
    fn execute_txs(&self, state: &ChainState, txs: &[Transaction]) -> Hash;

    /// Applies a committed block and returns the state for the next height,
    /// with proposer priorities advanced once.
    fn apply_block(
        &self,
        state: &ChainState,
        block_id: &BlockId,
        block: &Block,
    ) -> Result<ChainState>;
}

/// Folds every transaction hash into the previous state root. Stands in for
/// a real execution layer while keeping roots deterministic.
pub struct HashChainExecutor {
    max_txs_per_block: usize,
}

impl HashChainExecutor {
    pub fn new(max_txs_per_block: usize) -> Self {
        Self { max_txs_per_block }
    }
}

impl Default for HashChainExecutor {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl StateExecutor for HashChainExecutor {
    fn validate_block(&self, state: &ChainState, block: &Block) -> Result<()> {
        block.validate_basic()?;
        let header = &block.header;
        if header.chain_id != state.chain_id {
            return Err(StoreError::WrongChainId {
                expected: state.chain_id.clone(),
                got: header.chain_id.clone(),
            });
        }
        if header.height != state.next_height() {
            return Err(StoreError::HeightMismatch {
                expected: state.next_height(),
                got: header.height,
            });
        }
        if header.last_block_id != state.last_block_id {
            return Err(StoreError::LastBlockIdMismatch {
                expected: state.last_block_id.to_string(),
                got: header.last_block_id.to_string(),
            });
        }
        let validators_hash = state.validators.hash();
        if header.validators_hash != validators_hash {
            return Err(StoreError::ValidatorsHashMismatch {
                expected: validators_hash,
                got: header.validators_hash,
            });
        }
        if !state.validators.has_address(&header.proposer_address) {
            return Err(StoreError::UnknownProposer(header.proposer_address));
        }
        if header.time_ms <= state.last_block_time_ms && state.last_block_height > 0 {
            return Err(StoreError::NonMonotonicTime {
                time_ms: header.time_ms,
                last_ms: state.last_block_time_ms,
            });
        }
        if block.txs.len() > self.max_txs_per_block {
            return Err(StoreError::TooManyTransactions {
                count: block.txs.len(),
                max: self.max_txs_per_block,
            });
        }
        let expected_total = state.last_block_total_txs.saturating_add(header.num_txs);
        if header.total_txs != expected_total {
            return Err(StoreError::Types(kestrel_types::TypesError::TxCountMismatch {
                declared: header.total_txs,
                actual: expected_total,
            }));
        }

        if state.last_block_height == 0 {
            if !block.last_commit.is_empty() {
                return Err(StoreError::Types(kestrel_types::TypesError::InvalidCommit(
                    "first block must carry an empty last commit".into(),
                )));
            }
        } else {
            if block.last_commit.height() != state.last_block_height {
                return Err(StoreError::HeightMismatch {
                    expected: state.last_block_height,
                    got: block.last_commit.height(),
                });
            }
            state.last_validators.verify_commit(
                &state.chain_id,
                &state.last_block_id,
                state.last_block_height,
                &block.last_commit,
            )?;
        }

        let state_root = self.execute_txs(state, &block.txs);
        if header.state_root != state_root {
            return Err(StoreError::StateRootMismatch {
                expected: state_root,
                got: header.state_root,
            });
        }
        Ok(())
    }

    fn execute_txs(&self, state: &ChainState, txs: &[Transaction]) -> Hash {
        txs.iter().fold(state.state_root, |root, tx| {
            hashv(&[root.as_ref(), tx.hash().as_ref()])
        })
    }

    fn apply_block(
        &self,
        state: &ChainState,
        block_id: &BlockId,
        block: &Block,
    ) -> Result<ChainState> {
        self.validate_block(state, block)?;
        Ok(ChainState {
            chain_id: state.chain_id.clone(),
            last_block_height: block.height(),
            last_block_id: *block_id,
            last_block_time_ms: block.header.time_ms,
            last_block_total_txs: block.header.total_txs,
            validators: state.validators.copy_advance(1),
            last_validators: state.validators.clone(),
            state_root: block.header.state_root,
        })
    }
}
