//! Pool admission errors.

use fc_03_store::StoreError;
use shared_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    /// The object is already in the pool.
    #[error("object already exists in pool")]
    HashExists,

    /// The pending tier is full and the candidate does not beat the worst
    /// resident's price.
    #[error("pool is full, capacity {capacity}")]
    PoolFull { capacity: usize },

    /// The to-be-confirmed debt tier is full.
    #[error("debt pool is full, capacity {capacity}")]
    DebtFull { capacity: usize },

    /// Nonce at or below the sender's committed state nonce.
    #[error("nonce {nonce} already confirmed, next usable nonce is {expected}")]
    NonceTooLow { nonce: u64, expected: u64 },

    /// Same (sender, nonce) already pooled at an equal or better price.
    #[error("nonce {nonce} already pooled; replacement requires a strictly higher price")]
    NonceUsed { nonce: u64 },

    /// Object belongs to a different shard than this node serves.
    #[error("shard {shard} does not match local shard {local}")]
    ShardMismatch { shard: u8, local: u8 },

    /// Reward pseudo-transactions are minted by the miner, never pooled.
    #[error("reward transaction not allowed in pool")]
    RewardNotAllowed,

    #[error("invalid signature")]
    InvalidSignature(#[from] CryptoError),

    #[error("store access failed")]
    Store(#[from] StoreError),
}
