//! Engine configuration.

use serde::{Deserialize, Serialize};

/// How the proposer rotates across rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProposerPolicy {
    /// `validator[(height + round) mod N]`.
    #[default]
    RoundRobin,
    /// One proposer per height, regardless of round.
    Sticky,
}

#[derive(Debug, Clone)]
pub struct IbftConfig {
    /// Base round timeout in milliseconds; doubles per round.
    pub request_timeout_ms: u64,
    /// Minimum seconds between blocks.
    pub block_period: u64,
    /// Heights between vote-reset checkpoints.
    pub epoch: u64,
    pub proposer_policy: ProposerPolicy,
}

impl Default for IbftConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            block_period: 1,
            epoch: 30_000,
            proposer_policy: ProposerPolicy::RoundRobin,
        }
    }
}
