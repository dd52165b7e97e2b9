//! Chain-level errors.

use crate::executor::ExecutorError;
use fc_02_state::StateError;
use fc_03_store::StoreError;
use shared_crypto::CryptoError;
use shared_types::consensus::ConsensusError;
use shared_types::Hash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block validation failed")]
    Consensus(#[from] ConsensusError),

    #[error("store access failed")]
    Store(#[from] StoreError),

    #[error("state access failed")]
    State(#[from] StateError),

    #[error("transaction execution failed")]
    Executor(#[from] ExecutorError),

    #[error("invalid transaction signature")]
    Signature(#[from] CryptoError),

    #[error("block {0} already exists")]
    AlreadyExists(Hash),

    #[error("transaction root mismatch, have {have}, want {want}")]
    InvalidTxRoot { have: Hash, want: Hash },

    #[error("debt root mismatch, have {have}, want {want}")]
    InvalidDebtRoot { have: Hash, want: Hash },

    #[error("receipt root mismatch, have {have}, want {want}")]
    InvalidReceiptRoot { have: Hash, want: Hash },

    #[error("state root mismatch, have {have}, want {want}")]
    InvalidStateRoot { have: Hash, want: Hash },

    #[error("block is missing the leading reward transaction")]
    MissingRewardTx,

    #[error("reward transaction appears past the first position")]
    MisplacedRewardTx,

    #[error("invalid reward amount")]
    InvalidReward,

    #[error("transaction sender is in shard {shard}, chain serves shard {local}")]
    ShardMismatch { shard: u8, local: u8 },

    #[error("debt targets shard {shard}, chain serves shard {local}")]
    DebtShardMismatch { shard: u8, local: u8 },

    #[error("stored genesis {stored} does not match the configured genesis {built}")]
    GenesisMismatch { stored: Hash, built: Hash },

    #[error("HEAD block hash not found")]
    HeadNotFound,
}
