//! # Transaction and Debt Pools
//!
//! Two admission queues feeding block assembly:
//!
//! - [`TxPool`]: per-sender nonce-ordered collections ranked across senders
//!   by head price, with price-based whole-sender eviction when full.
//! - [`DebtPool`]: cross-shard debts in two tiers, "to be confirmed" (source
//!   block not deep enough yet) and "confirmed" (promotable into a block).
//!
//! Both track a processing tier of items selected into an in-flight block so
//! they are not proposed twice, and both re-admit items that a chain
//! reorganization dropped from the canonical chain.

pub mod debt_pool;
pub mod domain;
pub mod errors;
pub mod reorg;
pub mod tx_pool;

pub use debt_pool::{DebtPool, DebtPoolConfig};
pub use errors::PoolError;
pub use tx_pool::{TxPool, TxPoolConfig};

/// Default capacity of the pending transaction tier.
pub const TX_POOL_CAPACITY: usize = 10_000;

/// Default capacity of the confirmed debt tier.
pub const DEBT_POOL_CAPACITY: usize = 10_000;

/// Default capacity of the to-be-confirmed debt tier.
pub const TO_CONFIRMED_DEBT_CAPACITY: usize = 10_000;
