//! Bridges consensus decisions to chain storage.
//!
//! `BlockOperations` builds proposal blocks from the pending transaction
//! source and persists committed blocks together with the commit that
//! justifies them. Its cached height is guarded by its own lock, separate from
//! any consensus lock: callers sequence `save_block` and their own height
//! transition themselves.

use {
    crate::{
        codec::{decode, encode},
        error::{Result, StoreError},
        executor::StateExecutor,
        keys::{
            block_commit_key, block_meta_key, block_part_key, seen_commit_key, CHAIN_STATE_KEY,
            STORE_HEIGHT_KEY,
        },
        kv::KeyValueStore,
        tx_pool::TransactionSource,
    },
    kestrel_types::{
        now_ms, Block, BlockId, BlockMeta, ChainState, Commit, FatalError, Header, Part, PartSet,
        Transaction, BLOCK_PART_SIZE_BYTES,
    },
    log::*,
    parking_lot::Mutex,
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    std::sync::Arc,
};

/// Limits applied when assembling a proposal block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockLimits {
    pub block_part_size: usize,
    pub max_txs_per_block: usize,
    pub max_block_size_bytes: usize,
}

impl Default for BlockLimits {
    fn default() -> Self {
        Self {
            block_part_size: BLOCK_PART_SIZE_BYTES,
            max_txs_per_block: 10_000,
            max_block_size_bytes: 21 * 1024 * 1024,
        }
    }
}

pub struct BlockOperations {
    store: Arc<dyn KeyValueStore>,
    tx_source: Arc<dyn TransactionSource>,
    executor: Arc<dyn StateExecutor>,
    limits: BlockLimits,
    height: Mutex<u64>,
}

impl BlockOperations {
    /// Opens the block store, resuming from the height recorded in `store`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        tx_source: Arc<dyn TransactionSource>,
        executor: Arc<dyn StateExecutor>,
        limits: BlockLimits,
    ) -> Result<Self> {
        let height = match store.get(STORE_HEIGHT_KEY)? {
            Some(bytes) => decode::<u64>(&bytes)?,
            None => 0,
        };
        if height > 0 {
            info!("block store resumed at height {height}");
        }
        Ok(Self {
            store,
            tx_source,
            executor,
            limits,
            height: Mutex::new(height),
        })
    }

    /// Height of the last saved block, 0 when empty.
    pub fn height(&self) -> u64 {
        *self.height.lock()
    }

    pub fn limits(&self) -> &BlockLimits {
        &self.limits
    }

    /// Builds the block for `height` on top of `state` from pending
    /// transactions, and splits it into gossip parts.
    pub fn create_proposal_block(
        &self,
        height: u64,
        state: &ChainState,
        proposer: Pubkey,
        last_commit: Commit,
    ) -> Result<(Block, PartSet)> {
        let txs = self.collect_txs();
        let time_ms = now_ms().max(state.last_block_time_ms.saturating_add(1));
        let header = Header {
            chain_id: state.chain_id.clone(),
            height,
            time_ms,
            num_txs: 0,
            total_txs: state.last_block_total_txs.saturating_add(txs.len() as u64),
            last_block_id: state.last_block_id,
            last_commit_hash: Hash::default(),
            data_hash: Hash::default(),
            validators_hash: state.validators.hash(),
            proposer_address: proposer,
            state_root: self.executor.execute_txs(state, &txs),
        };
        let block = Block::new(header, txs, last_commit);
        let parts = block.make_part_set(self.limits.block_part_size)?;
        debug!(
            "created proposal block h={height} txs={} parts={} hash={}",
            block.txs.len(),
            parts.total(),
            block.hash()
        );
        Ok((block, parts))
    }

    /// Takes each sender's transactions in nonce order. A sender whose next
    /// transaction does not fit is skipped entirely so no nonce gap is
    /// introduced.
    fn collect_txs(&self) -> Vec<Transaction> {
        let mut txs = Vec::new();
        let mut bytes = 0usize;
        'senders: for (_, pending) in self.tx_source.pending() {
            for tx in pending {
                if txs.len() >= self.limits.max_txs_per_block {
                    break 'senders;
                }
                let size = tx.size();
                if bytes.saturating_add(size) > self.limits.max_block_size_bytes {
                    continue 'senders;
                }
                bytes = bytes.saturating_add(size);
                txs.push(tx);
            }
        }
        txs
    }

    pub fn validate_block(&self, state: &ChainState, block: &Block) -> Result<()> {
        self.executor.validate_block(state, block)
    }

    pub fn apply_block(
        &self,
        state: &ChainState,
        block_id: &BlockId,
        block: &Block,
    ) -> Result<ChainState> {
        self.executor.apply_block(state, block_id, block)
    }

    /// Persists a committed block.
    ///
    /// `block` must be exactly one above the stored height; anything else is a
    /// broken caller and yields [`FatalError::NonContiguousHeight`]. Writes the
    /// block meta and parts, the block's last commit under `height - 1`, and
    /// `seen_commit` under `height`, in one batch.
    pub fn save_block(&self, block: &Block, parts: &PartSet, seen_commit: &Commit) -> Result<()> {
        let mut stored = self.height.lock();
        let height = block.height();
        if height != stored.saturating_add(1) {
            return Err(FatalError::NonContiguousHeight {
                store_height: *stored,
                block_height: height,
            }
            .into());
        }
        if !parts.is_complete() {
            return Err(FatalError::Invariant(format!(
                "saving block {height} with an incomplete part set ({}/{})",
                parts.count(),
                parts.total()
            ))
            .into());
        }

        let meta = BlockMeta {
            block_id: BlockId::new(block.hash(), parts.header()),
            header: block.header.clone(),
        };
        let mut batch = self.store.new_batch();
        batch.put(&block_meta_key(height), encode(&meta)?);
        for index in 0..parts.total() {
            let part = parts.get_part(index).ok_or_else(|| {
                StoreError::Fatal(FatalError::Invariant(format!(
                    "part {index} of block {height} missing from a complete set"
                )))
            })?;
            batch.put(&block_part_key(height, index), encode(part)?);
        }
        if height > 1 {
            batch.put(&block_commit_key(height.saturating_sub(1)), encode(&block.last_commit)?);
        }
        batch.put(&seen_commit_key(height), encode(seen_commit)?);
        batch.put(STORE_HEIGHT_KEY, encode(&height)?);
        batch.write()?;

        for tx in &block.txs {
            self.tx_source.remove_tx(&tx.hash());
        }
        *stored = height;
        info!(
            "saved block h={height} hash={} txs={}",
            meta.block_id.hash,
            block.txs.len()
        );
        Ok(())
    }

    pub fn load_block_meta(&self, height: u64) -> Result<Option<BlockMeta>> {
        self.load(&block_meta_key(height))
    }

    pub fn load_block_part(&self, height: u64, index: u32) -> Result<Option<Part>> {
        self.load(&block_part_key(height, index))
    }

    /// Reassembles a stored block from its parts.
    pub fn load_block(&self, height: u64) -> Result<Option<Block>> {
        let Some(meta) = self.load_block_meta(height)? else {
            return Ok(None);
        };
        let mut bytes = Vec::new();
        for index in 0..meta.block_id.parts_header.total {
            let Some(part) = self.load_block_part(height, index)? else {
                return Ok(None);
            };
            bytes.extend_from_slice(&part.bytes);
        }
        Ok(Some(Block::from_bytes(&bytes)?))
    }

    /// The commit for `height` as carried by block `height + 1`.
    pub fn load_block_commit(&self, height: u64) -> Result<Option<Commit>> {
        self.load(&block_commit_key(height))
    }

    /// The +2/3 precommits this node observed when committing `height`.
    pub fn load_seen_commit(&self, height: u64) -> Result<Option<Commit>> {
        self.load(&seen_commit_key(height))
    }

    pub fn save_state(&self, state: &ChainState) -> Result<()> {
        self.store.put(CHAIN_STATE_KEY, &encode(state)?)
    }

    pub fn load_state(&self) -> Result<Option<ChainState>> {
        let state: Option<ChainState> = self.load(CHAIN_STATE_KEY)?;
        Ok(state.map(|mut state| {
            state.rebuild_indices();
            state
        }))
    }

    fn load<T: serde::de::DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.store.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}
