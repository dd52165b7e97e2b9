//! The validator set.

use crate::config::ProposerPolicy;
use serde::{Deserialize, Serialize};
use shared_types::Address;

/// An ordered set of validator addresses. Kept sorted so every node derives
/// the same proposer from the same inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Address>,
    policy: ProposerPolicy,
}

impl ValidatorSet {
    pub fn new(mut validators: Vec<Address>, policy: ProposerPolicy) -> Self {
        validators.sort();
        validators.dedup();
        Self { validators, policy }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Maximum tolerable faulty validators: ⌊(N−1)/3⌋.
    pub fn f(&self) -> usize {
        self.validators.len().saturating_sub(1) / 3
    }

    /// Messages required for agreement: 2F+1.
    pub fn quorum(&self) -> usize {
        2 * self.f() + 1
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.validators.binary_search(address).is_ok()
    }

    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.validators.binary_search(address).ok()
    }

    /// Proposer for `(height, round)` under the configured policy.
    pub fn proposer(&self, height: u64, round: u64) -> Option<Address> {
        if self.validators.is_empty() {
            return None;
        }
        let n = self.validators.len() as u64;
        let slot = match self.policy {
            ProposerPolicy::RoundRobin => (height + round) % n,
            ProposerPolicy::Sticky => height % n,
        };
        Some(self.validators[slot as usize])
    }

    pub fn is_proposer(&self, address: &Address, height: u64, round: u64) -> bool {
        self.proposer(height, round) == Some(*address)
    }

    /// Add a validator; no-op when present.
    pub fn add(&mut self, address: Address) {
        if let Err(slot) = self.validators.binary_search(&address) {
            self.validators.insert(slot, address);
        }
    }

    /// Remove a validator; no-op when absent.
    pub fn remove(&mut self, address: &Address) {
        if let Ok(slot) = self.validators.binary_search(address) {
            self.validators.remove(slot);
        }
    }

    pub fn addresses(&self) -> &[Address] {
        &self.validators
    }

    pub fn policy(&self) -> ProposerPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tail: u8) -> Address {
        Address([tail; 20])
    }

    #[test]
    fn sorted_and_deduplicated() {
        let set = ValidatorSet::new(
            vec![addr(3), addr(1), addr(3), addr(2)],
            ProposerPolicy::RoundRobin,
        );
        assert_eq!(set.addresses(), &[addr(1), addr(2), addr(3)]);
    }

    #[test]
    fn quorum_thresholds() {
        for (n, f, quorum) in [(1, 0, 1), (3, 0, 1), (4, 1, 3), (7, 2, 5), (10, 3, 7)] {
            let set = ValidatorSet::new(
                (0..n).map(|i| addr(i as u8)).collect(),
                ProposerPolicy::RoundRobin,
            );
            assert_eq!(set.f(), f, "N={n}");
            assert_eq!(set.quorum(), quorum, "N={n}");
        }
    }

    #[test]
    fn round_robin_rotates_with_height_and_round() {
        let set = ValidatorSet::new(
            vec![addr(1), addr(2), addr(3), addr(4)],
            ProposerPolicy::RoundRobin,
        );
        assert_eq!(set.proposer(1, 0), Some(addr(2)));
        assert_eq!(set.proposer(1, 1), Some(addr(3)));
        assert_eq!(set.proposer(2, 0), Some(addr(3)));
        assert_eq!(set.proposer(4, 1), Some(addr(2)));
    }

    #[test]
    fn sticky_ignores_round() {
        let set = ValidatorSet::new(vec![addr(1), addr(2)], ProposerPolicy::Sticky);
        assert_eq!(set.proposer(3, 0), set.proposer(3, 7));
    }

    #[test]
    fn add_and_remove_keep_order() {
        let mut set = ValidatorSet::new(vec![addr(1), addr(3)], ProposerPolicy::RoundRobin);
        set.add(addr(2));
        assert_eq!(set.addresses(), &[addr(1), addr(2), addr(3)]);
        set.remove(&addr(1));
        assert_eq!(set.addresses(), &[addr(2), addr(3)]);
        set.remove(&addr(9));
        assert_eq!(set.len(), 2);
    }
}
