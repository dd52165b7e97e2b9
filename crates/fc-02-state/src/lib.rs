//! # Account State
//!
//! Versioned account state over a copy-on-write trie. Every committed root
//! hash is a complete, immutable version of the state; two roots share the
//! trie nodes their paths have in common, so keeping an old version around is
//! cheap.
//!
//! [`Statedb`] layers an in-memory mutation journal on top: cheap
//! [`Statedb::snapshot`] / [`Statedb::revert_to_snapshot`] markers during
//! transaction execution, and [`Statedb::commit`] to flush a new version into
//! a storage batch.

pub mod domain;
mod statedb;

pub use domain::account::AccountData;
pub use domain::errors::StateError;
pub use domain::trie::Trie;
pub use statedb::Statedb;
