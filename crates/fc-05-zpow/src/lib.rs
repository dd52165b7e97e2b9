//! # ZPOW Engine
//!
//! Proof of work over matrix determinants: the header hash seeds a
//! deterministic 30×30 matrix with entries in {0, 1, 2}; a nonce wins when
//! the magnitude of the matrix determinant reaches the mining target derived
//! from the header difficulty.
//!
//! Sealing partitions the 64-bit nonce space across worker threads; the first
//! winner publishes the sealed block exactly once, everyone else observes the
//! shared found flag and exits.

pub mod difficulty;
pub mod engine;
pub mod matrix;

pub use difficulty::{next_difficulty, MINIMUM_DIFFICULTY};
pub use engine::ZpowEngine;
pub use matrix::{determinant, generate_matrix, mining_target, EMERY_FORK_HEIGHT, MATRIX_DIM};
