//! # Kestrel Chain Store
//!
//! Persistence layer driven by consensus: a byte-level key-value store, the
//! pending transaction source, the state executor, and [`BlockOperations`],
//! which turns consensus decisions into stored blocks and commits.

pub mod block_operations;
pub mod codec;
pub mod error;
pub mod executor;
pub mod keys;
pub mod kv;
pub mod tx_pool;

pub use {
    block_operations::{BlockLimits, BlockOperations},
    error::{Result, StoreError, TxPoolError},
    executor::{HashChainExecutor, StateExecutor},
    kv::{Batch, KeyValueStore, MemoryStore},
    tx_pool::{MemoryTxPool, TransactionSource},
};
