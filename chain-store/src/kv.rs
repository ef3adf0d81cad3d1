//! Byte-level key-value storage consumed by the block store.

use {
    crate::error::Result,
    parking_lot::RwLock,
    std::{collections::BTreeMap, sync::Arc},
};

pub trait KeyValueStore: Send + Sync {
    fn has(&self, key: &[u8]) -> Result<bool>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    fn new_batch(&self) -> Box<dyn Batch + '_>;
}

/// A group of writes applied atomically by `write`.
pub trait Batch {
    fn put(&mut self, key: &[u8], value: Vec<u8>);
    fn delete(&mut self, key: &[u8]);
    fn write(self: Box<Self>) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.inner.read().contains_key(key))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    fn new_batch(&self) -> Box<dyn Batch + '_> {
        Box::new(MemoryBatch {
            store: self,
            ops: Vec::new(),
        })
    }
}

enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

struct MemoryBatch<'a> {
    store: &'a MemoryStore,
    ops: Vec<BatchOp>,
}

impl Batch for MemoryBatch<'_> {
    fn put(&mut self, key: &[u8], value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key.to_vec(), value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.ops.push(BatchOp::Delete(key.to_vec()));
    }

    fn write(self: Box<Self>) -> Result<()> {
        let MemoryBatch { store, ops } = *self;
        let mut map = store.inner.write();
        for op in ops {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }
}
