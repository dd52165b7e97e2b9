//! Outbound storage port.

use thiserror::Error;

/// Errors surfaced by key-value adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    /// The backend rejected or failed the operation.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// One mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOperation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered set of mutations applied atomically.
#[derive(Debug, Default)]
pub struct Batch {
    operations: Vec<BatchOperation>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.operations.push(BatchOperation::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.operations
            .push(BatchOperation::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn into_operations(self) -> Vec<BatchOperation> {
        self.operations
    }
}

/// Minimal key-value engine contract. Implementations are internally
/// synchronized; `write_batch` is atomic with respect to readers.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError>;

    fn delete(&self, key: &[u8]) -> Result<(), KvError>;

    fn exists(&self, key: &[u8]) -> Result<bool, KvError> {
        Ok(self.get(key)?.is_some())
    }

    fn write_batch(&self, batch: Batch) -> Result<(), KvError>;
}
