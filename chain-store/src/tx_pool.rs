//! Source of pending transactions for block proposals.

use {
    crate::error::TxPoolError,
    kestrel_types::Transaction,
    log::*,
    parking_lot::Mutex,
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    std::collections::{BTreeMap, HashMap},
};

pub trait TransactionSource: Send + Sync {
    /// Pending transactions grouped by sender, each group ordered by nonce.
    fn pending(&self) -> BTreeMap<Pubkey, Vec<Transaction>>;
    /// Returns false if the transaction was not pending.
    fn remove_tx(&self, hash: &Hash) -> bool;
}

#[derive(Default)]
struct PoolInner {
    txs: HashMap<Hash, (u64, Transaction)>,
    arrival: BTreeMap<u64, Hash>,
    next_seq: u64,
}

/// Bounded in-memory pool. When full it either rejects new transactions or,
/// with `evict_on_full`, drops the oldest pending one.
pub struct MemoryTxPool {
    capacity: usize,
    evict_on_full: bool,
    inner: Mutex<PoolInner>,
}

impl MemoryTxPool {
    pub fn new(capacity: usize, evict_on_full: bool) -> Self {
        Self {
            capacity,
            evict_on_full,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn add_tx(&self, tx: Transaction) -> Result<(), TxPoolError> {
        let hash = tx.hash();
        let mut inner = self.inner.lock();
        if inner.txs.contains_key(&hash) {
            return Err(TxPoolError::Duplicate(hash));
        }
        while inner.txs.len() >= self.capacity {
            if !self.evict_on_full {
                return Err(TxPoolError::PoolFull {
                    capacity: self.capacity,
                });
            }
            let Some((_, oldest)) = inner.arrival.pop_first() else {
                return Err(TxPoolError::PoolFull {
                    capacity: self.capacity,
                });
            };
            inner.txs.remove(&oldest);
            warn!("tx pool full, evicted {oldest}");
        }
        let seq = inner.next_seq;
        inner.next_seq = seq.saturating_add(1);
        inner.arrival.insert(seq, hash);
        inner.txs.insert(hash, (seq, tx));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransactionSource for MemoryTxPool {
    fn pending(&self) -> BTreeMap<Pubkey, Vec<Transaction>> {
        let inner = self.inner.lock();
        let mut by_sender: BTreeMap<Pubkey, Vec<Transaction>> = BTreeMap::new();
        for (_, tx) in inner.txs.values() {
            by_sender.entry(tx.sender).or_default().push(tx.clone());
        }
        for txs in by_sender.values_mut() {
            txs.sort_by_key(|tx| tx.nonce);
        }
        by_sender
    }

    fn remove_tx(&self, hash: &Hash) -> bool {
        let mut inner = self.inner.lock();
        match inner.txs.remove(hash) {
            Some((seq, _)) => {
                inner.arrival.remove(&seq);
                true
            }
            None => false,
        }
    }
}
