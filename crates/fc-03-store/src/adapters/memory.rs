//! In-memory key-value store.

use crate::ports::{Batch, BatchOperation, KeyValueStore, KvError};
use parking_lot::RwLock;
use std::collections::HashMap;

/// HashMap-backed store. Batches apply under one write lock, so readers see
/// either none or all of a batch.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), KvError> {
        self.data.write().remove(key);
        Ok(())
    }

    fn write_batch(&self, batch: Batch) -> Result<(), KvError> {
        let mut data = self.data.write();
        for operation in batch.into_operations() {
            match operation {
                BatchOperation::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOperation::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = MemoryStore::new();

        store.put(b"key1", b"value1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert!(store.exists(b"key1").unwrap());

        store.delete(b"key1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), None);
        assert!(!store.exists(b"key1").unwrap());
    }

    #[test]
    fn batch_applies_all_operations() {
        let store = MemoryStore::new();
        store.put(b"stale", b"x").unwrap();

        let mut batch = Batch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        batch.delete(b"stale".to_vec());
        store.write_batch(batch).unwrap();

        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get(b"stale").unwrap(), None);
    }
}
