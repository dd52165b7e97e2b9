//! # Blockchain Store
//!
//! Persistent headers, bodies, receipts, per-hash total difficulty, the HEAD
//! pointer, and the canonical height → hash index, all behind a pluggable
//! [`ports::KeyValueStore`]. Block writes are made crash-atomic by the
//! [`recovery::RecoveryPoint`] write-ahead record.
//!
//! The only storage adapter shipped here is the in-memory one; disk engines
//! plug in behind the same trait.

pub mod adapters;
pub mod ports;
pub mod recovery;
pub mod store;

pub use adapters::MemoryStore;
pub use ports::{Batch, BatchOperation, KeyValueStore, KvError};
pub use recovery::RecoveryPoint;
pub use store::{keys, BlockchainStore, DebtIndex, StoreError, TxIndex};
