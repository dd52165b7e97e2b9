//! # Block Assembly
//!
//! A mining [`Task`] drains the pools into a candidate block: the reward
//! pseudo-transaction first, then settled cross-shard debts under the size
//! budget, then the best-priced transactions under the gas cap, everything
//! executed against a state snapshot so the derived roots are final. The
//! sealed result goes back through the chain writer.

pub mod task;

pub use task::{MinerBackend, MinerConfig, MinerError, Task};
