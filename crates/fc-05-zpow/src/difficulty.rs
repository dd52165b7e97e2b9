//! Difficulty adjustment.
//!
//! The next difficulty moves by `parent/2048` per step of the adjustment
//! factor `clamp(1 − Δt/10, −99, 1)`: blocks arriving faster than the
//! 10-second bracket raise difficulty, slower blocks lower it, bounded so a
//! single slow block cannot crater the chain.

use shared_types::{BlockHeader, U256};

/// Difficulty floor.
pub const MINIMUM_DIFFICULTY: u64 = 10_000;

const BOUND_DIVISOR: u64 = 2048;
const TIME_BRACKET_SECONDS: u64 = 10;
const MAX_DOWNWARD_STEPS: u64 = 99;

/// Difficulty for a block created at `timestamp` on top of `parent`.
/// Monotone non-increasing in the timespan to the parent.
pub fn next_difficulty(timestamp: U256, parent: &BlockHeader) -> U256 {
    let parent_difficulty = parent.difficulty;
    let quotient = parent_difficulty / U256::from(BOUND_DIVISOR);

    let elapsed = timestamp.saturating_sub(parent.timestamp);
    // Δt beyond a u64 only happens with a nonsense timestamp; treat it as
    // maximally slow.
    let brackets = if elapsed > U256::from(u64::MAX) {
        MAX_DOWNWARD_STEPS + 1
    } else {
        elapsed.low_u64() / TIME_BRACKET_SECONDS
    };

    let next = if brackets == 0 {
        parent_difficulty.saturating_add(quotient)
    } else {
        let steps = (brackets - 1).min(MAX_DOWNWARD_STEPS);
        parent_difficulty.saturating_sub(quotient.saturating_mul(U256::from(steps)))
    };

    next.max(U256::from(MINIMUM_DIFFICULTY))
}
