//! # Core Domain Types
//!
//! The shared data model for the sharded chain: blocks, transactions,
//! cross-shard debts, receipts, the canonical byte codec their hashes are
//! computed over, and the consensus-engine traits every engine implements.
//!
//! ## Clusters
//!
//! - **Chain**: [`Block`], [`BlockHeader`], [`Transaction`], [`Receipt`]
//! - **Cross-shard**: [`Debt`]
//! - **Consensus seam**: [`consensus::Engine`], [`consensus::ChainReader`]
//! - **Canonical form**: [`codec`], [`merkle`]

pub mod codec;
pub mod consensus;
pub mod entities;
pub mod merkle;
pub mod verifier;

pub use codec::{ByteReader, ByteWriter, CanonicalDecode, CanonicalEncode, CodecError};
pub use entities::{
    Address, Block, BlockHeader, ConsensusType, Debt, Hash, Log, Receipt, Transaction, DEBT_SIZE,
    SHARD_COUNT, UNDEFINED_SHARD, WITNESS_SIZE,
};
pub use merkle::{empty_merkle_root, merkle_root};
pub use verifier::{DebtStatus, DebtVerifier, DebtVerifyError, StaticVerifier};

// Re-export U256 so downstream crates share one big-integer type.
pub use primitive_types::U256;
