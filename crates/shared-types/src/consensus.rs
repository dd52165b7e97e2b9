//! Consensus-engine seam.
//!
//! Engines see the chain only through [`ChainReader`], a read-only header
//! capability, never the full blockchain. The engine surface itself is three
//! calls: prepare a header for sealing, verify a sealed header, and seal.

use crate::entities::{Block, BlockHeader, Hash};
use primitive_types::U256;
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};
use thiserror::Error;

/// Height interval after which the base mining reward halves.
pub const BLOCKS_PER_ERA: u64 = 10_000_000;

/// Base reward of era zero, in the smallest unit (24 whole coins).
pub fn era_base_reward() -> U256 {
    U256::from(24u64) * U256::exp10(18)
}

/// Mining reward at the given height: era-halving schedule, deterministic in
/// height alone.
pub fn block_reward(height: u64) -> U256 {
    let era = height / BLOCKS_PER_ERA;
    if era >= 128 {
        return U256::zero();
    }
    era_base_reward() >> era
}

/// Validation failures for blocks and headers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    /// The referenced parent block is unknown.
    #[error("invalid parent hash {0}")]
    InvalidParent(Hash),

    /// Height is not parent height + 1.
    #[error("invalid height {have}, want {want}")]
    InvalidHeight { have: u64, want: u64 },

    /// Timestamp does not advance past the parent's.
    #[error("timestamp must be greater than parent's")]
    TimestampRegression,

    /// Difficulty does not match the adjustment rule.
    #[error("invalid difficulty {have}, want {want}")]
    InvalidDifficulty { have: U256, want: U256 },

    /// The witness does not satisfy the mining target.
    #[error("block nonce does not satisfy the mining target")]
    NonceInvalid,

    /// A BFT seal failed validation.
    #[error("invalid seal: {0}")]
    InvalidSeal(String),

    /// The engine was asked to operate while stopped.
    #[error("engine stopped")]
    EngineStopped,
}

/// Read-only view of the header chain handed to engines.
pub trait ChainReader: Send + Sync {
    /// Header at the canonical tip.
    fn current_header(&self) -> BlockHeader;

    /// Header by hash, canonical or not.
    fn header_by_hash(&self, hash: &Hash) -> Option<BlockHeader>;

    /// Header at a canonical height.
    fn header_by_height(&self, height: u64) -> Option<BlockHeader>;
}

/// A consensus engine: fills in the sealing fields, searches for a seal, and
/// verifies sealed headers.
pub trait Engine: Send + Sync {
    /// Fill the consensus fields (difficulty, ...) of a header under
    /// construction.
    fn prepare(&self, chain: &dyn ChainReader, header: &mut BlockHeader)
        -> Result<(), ConsensusError>;

    /// Validate a sealed header against its parent and the engine's rules.
    fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &BlockHeader,
    ) -> Result<(), ConsensusError>;

    /// Search for a seal. Workers stop when `stop` becomes true; exactly one
    /// `Some(block)` is sent on success, one `None` if the search space is
    /// exhausted.
    fn seal(
        &self,
        chain: &dyn ChainReader,
        block: Block,
        stop: Arc<AtomicBool>,
        results: mpsc::Sender<Option<Block>>,
    ) -> Result<(), ConsensusError>;
}

/// Header rules shared by every engine: parent linkage, height, timestamp.
pub fn verify_header_common(
    header: &BlockHeader,
    parent: &BlockHeader,
) -> Result<(), ConsensusError> {
    if header.height != parent.height + 1 {
        return Err(ConsensusError::InvalidHeight {
            have: header.height,
            want: parent.height + 1,
        });
    }
    if header.timestamp <= parent.timestamp {
        return Err(ConsensusError::TimestampRegression);
    }
    Ok(())
}
