//! The cross-shard debt pool.
//!
//! Debts arrive "to be confirmed": their source block exists but is not yet
//! deep enough. [`DebtPool::do_checking_debt`] consults the verifier and
//! promotes settled debts into the confirmed tier, where they are ranked by
//! price and handed to block assembly under a fixed size budget.

use crate::errors::PoolError;
use crate::reorg::fork_diff;
use crate::{DEBT_POOL_CAPACITY, TO_CONFIRMED_DEBT_CAPACITY};
use fc_03_store::BlockchainStore;
use parking_lot::Mutex;
use shared_types::{Debt, DebtVerifier, Hash, U256, DEBT_SIZE};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct DebtPoolConfig {
    /// Capacity of the confirmed tier.
    pub capacity: usize,
    /// Capacity of the to-be-confirmed tier.
    pub to_confirmed_capacity: usize,
    /// Shard this node serves; debt targets must live here.
    pub local_shard: u8,
}

impl DebtPoolConfig {
    pub fn new(local_shard: u8) -> Self {
        Self {
            capacity: DEBT_POOL_CAPACITY,
            to_confirmed_capacity: TO_CONFIRMED_DEBT_CAPACITY,
            local_shard,
        }
    }
}

/// Price ranking for confirmed debts: higher price first, earlier admission
/// breaks ties.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DebtRank {
    price: U256,
    seq: u64,
    hash: Hash,
}

impl Ord for DebtRank {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .price
            .cmp(&self.price)
            .then(self.seq.cmp(&other.seq))
            .then(self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for DebtRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    to_confirm: HashMap<Hash, Debt>,
    confirmed: HashMap<Hash, Debt>,
    ranks: BTreeSet<DebtRank>,
    seqs: HashMap<Hash, u64>,
    processing: HashMap<Hash, Debt>,
    next_seq: u64,
}

impl Inner {
    fn contains(&self, hash: &Hash) -> bool {
        self.to_confirm.contains_key(hash)
            || self.confirmed.contains_key(hash)
            || self.processing.contains_key(hash)
    }

    fn rank_of(&self, debt: &Debt) -> DebtRank {
        let hash = debt.hash();
        DebtRank {
            price: debt.price,
            seq: self.seqs.get(&hash).copied().unwrap_or(u64::MAX),
            hash,
        }
    }
}

/// Two-tier debt admission queue.
pub struct DebtPool {
    config: DebtPoolConfig,
    store: Arc<BlockchainStore>,
    verifier: Option<Arc<dyn DebtVerifier>>,
    inner: Mutex<Inner>,
}

impl DebtPool {
    pub fn new(
        config: DebtPoolConfig,
        store: Arc<BlockchainStore>,
        verifier: Option<Arc<dyn DebtVerifier>>,
    ) -> Self {
        Self {
            config,
            store,
            verifier,
            inner: Mutex::new(Inner {
                to_confirm: HashMap::new(),
                confirmed: HashMap::new(),
                ranks: BTreeSet::new(),
                seqs: HashMap::new(),
                processing: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Admit a debt into the to-be-confirmed tier.
    pub fn add_debt(&self, debt: Debt) -> Result<(), PoolError> {
        if debt.target_shard() != self.config.local_shard {
            return Err(PoolError::ShardMismatch {
                shard: debt.target_shard(),
                local: self.config.local_shard,
            });
        }

        let mut inner = self.inner.lock();
        let hash = debt.hash();
        if inner.contains(&hash) {
            return Err(PoolError::HashExists);
        }
        if inner.to_confirm.len() >= self.config.to_confirmed_capacity {
            return Err(PoolError::DebtFull {
                capacity: self.config.to_confirmed_capacity,
            });
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.seqs.insert(hash, seq);
        inner.to_confirm.insert(hash, debt);
        Ok(())
    }

    /// Admit many debts; failures are logged and skipped.
    pub fn add_debts(&self, debts: impl IntoIterator<Item = Debt>) {
        for debt in debts {
            if let Err(err) = self.add_debt(debt) {
                debug!(%err, "debt not admitted");
            }
        }
    }

    /// Insert directly into the confirmed tier.
    pub fn add_to_pool(&self, debt: Debt) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        self.confirm_locked(&mut inner, debt)
    }

    fn confirm_locked(&self, inner: &mut Inner, debt: Debt) -> Result<(), PoolError> {
        let hash = debt.hash();
        if inner.confirmed.contains_key(&hash) || inner.processing.contains_key(&hash) {
            return Err(PoolError::HashExists);
        }
        if inner.confirmed.len() >= self.config.capacity {
            return Err(PoolError::PoolFull {
                capacity: self.config.capacity,
            });
        }
        if !inner.seqs.contains_key(&hash) {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.seqs.insert(hash, seq);
        }
        let rank = inner.rank_of(&debt);
        inner.ranks.insert(rank);
        inner.confirmed.insert(hash, debt);
        Ok(())
    }

    /// Re-check every to-be-confirmed debt and promote the settled ones.
    /// Without a verifier, everything promotes.
    pub fn do_checking_debt(&self) {
        let mut inner = self.inner.lock();
        let candidates: Vec<Debt> = inner.to_confirm.values().cloned().collect();

        for debt in candidates {
            let hash = debt.hash();
            let promote = match &self.verifier {
                None => true,
                Some(verifier) => match verifier.validate_debt(&debt) {
                    Ok(status) => status.packed && status.confirmed,
                    Err(err) => {
                        warn!(%err, debt = %hash, "dropping unverifiable debt");
                        inner.to_confirm.remove(&hash);
                        inner.seqs.remove(&hash);
                        continue;
                    }
                },
            };

            if promote {
                inner.to_confirm.remove(&hash);
                if let Err(err) = self.confirm_locked(&mut inner, debt) {
                    debug!(%err, debt = %hash, "confirmed tier rejected debt");
                }
            }
        }
    }

    /// Pop confirmed debts by descending price until the size budget is
    /// spent; popped debts move to the processing tier.
    pub fn get_processable_debts(&self, size_limit: usize) -> (Vec<Debt>, usize) {
        let mut inner = self.inner.lock();
        let mut selected = Vec::new();
        let mut used = 0usize;

        while used + DEBT_SIZE <= size_limit {
            let Some(rank) = inner.ranks.iter().next().cloned() else {
                break;
            };
            inner.ranks.remove(&rank);
            let Some(debt) = inner.confirmed.remove(&rank.hash) else {
                continue;
            };
            inner.processing.insert(rank.hash, debt.clone());
            used += DEBT_SIZE;
            selected.push(debt);
        }

        (selected, used)
    }

    /// Look up a debt in any tier.
    pub fn get_debt_by_hash(&self, hash: &Hash) -> Option<Debt> {
        let inner = self.inner.lock();
        inner
            .to_confirm
            .get(hash)
            .or_else(|| inner.confirmed.get(hash))
            .or_else(|| inner.processing.get(hash))
            .cloned()
    }

    pub fn to_confirm_count(&self) -> usize {
        self.inner.lock().to_confirm.len()
    }

    pub fn confirmed_count(&self) -> usize {
        self.inner.lock().confirmed.len()
    }

    pub fn processing_count(&self) -> usize {
        self.inner.lock().processing.len()
    }

    /// React to a canonical head move: requeue in-flight debts, reinject the
    /// abandoned branch's debts, drop debts now packed in canonical blocks.
    pub fn on_head_changed(&self, new_head: Hash, old_head: Hash) {
        let mut inner = self.inner.lock();

        let parked: Vec<Debt> = inner.processing.drain().map(|(_, debt)| debt).collect();
        for debt in parked {
            let _ = self.confirm_locked(&mut inner, debt);
        }

        match fork_diff(&self.store, new_head, old_head) {
            Ok(diff) if !diff.detached.is_empty() => {
                let attached: std::collections::HashSet<Hash> = diff
                    .attached
                    .iter()
                    .flat_map(|block| block.debts.iter().map(Debt::hash))
                    .collect();
                for block in &diff.detached {
                    for debt in &block.debts {
                        let hash = debt.hash();
                        if debt.target_shard() != self.config.local_shard
                            || attached.contains(&hash)
                            || inner.contains(&hash)
                        {
                            continue;
                        }
                        if inner.to_confirm.len() < self.config.to_confirmed_capacity {
                            let seq = inner.next_seq;
                            inner.next_seq += 1;
                            inner.seqs.insert(hash, seq);
                            inner.to_confirm.insert(hash, debt.clone());
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "failed to diff branches for debt reinjection"),
        }

        self.remove_confirmed_in_chain(&mut inner);
    }

    /// Drop pooled debts that the canonical chain already contains.
    fn remove_confirmed_in_chain(&self, inner: &mut Inner) {
        let hashes: Vec<Hash> = inner
            .confirmed
            .keys()
            .chain(inner.to_confirm.keys())
            .copied()
            .collect();
        for hash in hashes {
            match self.store.get_debt_index(&hash) {
                Ok(Some(_)) => {
                    if let Some(debt) = inner.confirmed.remove(&hash) {
                        let rank = inner.rank_of(&debt);
                        inner.ranks.remove(&rank);
                    }
                    inner.to_confirm.remove(&hash);
                    inner.seqs.remove(&hash);
                }
                Ok(None) => {}
                Err(err) => warn!(%err, "debt index lookup failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_03_store::MemoryStore;
    use shared_types::{Address, StaticVerifier};

    fn addr(shard: u8, tail: u8) -> Address {
        let mut bytes = [tail; 20];
        bytes[0] = shard << 4;
        Address(bytes)
    }

    fn debt(seed: u64, price: u64) -> Debt {
        Debt {
            tx_hash: Hash::of(&seed.to_be_bytes()),
            from: addr(1, 1),
            account: addr(2, 2),
            amount: U256::from(seed),
            price: U256::from(price),
            code: vec![],
        }
    }

    fn pool_with(
        config: DebtPoolConfig,
        verifier: Option<Arc<dyn DebtVerifier>>,
    ) -> DebtPool {
        let store = Arc::new(BlockchainStore::new(Arc::new(MemoryStore::new())));
        DebtPool::new(config, store, verifier)
    }

    fn local_pool() -> DebtPool {
        pool_with(DebtPoolConfig::new(2), None)
    }

    #[test]
    fn add_and_promote_without_verifier() {
        let pool = local_pool();
        pool.add_debt(debt(1, 10)).unwrap();
        pool.add_debt(debt(2, 11)).unwrap();
        assert_eq!(pool.to_confirm_count(), 2);
        assert_eq!(pool.confirmed_count(), 0);

        pool.do_checking_debt();
        assert_eq!(pool.to_confirm_count(), 0);
        assert_eq!(pool.confirmed_count(), 2);
    }

    #[test]
    fn rejects_wrong_target_shard() {
        let pool = pool_with(DebtPoolConfig::new(1), None);
        assert!(matches!(
            pool.add_debt(debt(1, 10)),
            Err(PoolError::ShardMismatch { shard: 2, local: 1 })
        ));
    }

    #[test]
    fn rejects_duplicates() {
        let pool = local_pool();
        pool.add_debt(debt(1, 10)).unwrap();
        assert!(matches!(
            pool.add_debt(debt(1, 10)),
            Err(PoolError::HashExists)
        ));
    }

    #[test]
    fn processable_debts_come_out_by_price() {
        let pool = local_pool();
        pool.add_debt(debt(1, 10)).unwrap();
        pool.add_debt(debt(2, 11)).unwrap();
        pool.do_checking_debt();

        let (debts, used) = pool.get_processable_debts(10_000);
        assert_eq!(debts.len(), 2);
        assert_eq!(used, 2 * DEBT_SIZE);
        assert!(debts[0].price > debts[1].price);
        assert_eq!(pool.processing_count(), 2);
    }

    #[test]
    fn size_budget_limits_selection() {
        let pool = local_pool();
        for seed in 0..5 {
            pool.add_debt(debt(seed, 10 + seed)).unwrap();
        }
        pool.do_checking_debt();

        let (debts, used) = pool.get_processable_debts(2 * DEBT_SIZE + 1);
        assert_eq!(debts.len(), 2);
        assert_eq!(used, 2 * DEBT_SIZE);
        assert_eq!(pool.confirmed_count(), 3);
    }

    #[test]
    fn unconfirmed_tier_rejects_when_full() {
        let mut config = DebtPoolConfig::new(2);
        config.to_confirmed_capacity = 3;
        let pool = pool_with(config, None);

        for seed in 0..3 {
            pool.add_debt(debt(seed, 10)).unwrap();
        }
        assert!(matches!(
            pool.add_debt(debt(99, 10)),
            Err(PoolError::DebtFull { capacity: 3 })
        ));
    }

    #[test]
    fn confirmed_tier_rejects_when_full() {
        let mut config = DebtPoolConfig::new(2);
        config.capacity = 3;
        let pool = pool_with(config, None);

        for seed in 0..3 {
            pool.add_to_pool(debt(seed, 10)).unwrap();
        }
        assert!(matches!(
            pool.add_to_pool(debt(99, 10)),
            Err(PoolError::PoolFull { capacity: 3 })
        ));

        // Draining two into processing frees confirmed capacity again.
        let (drained, _) = pool.get_processable_debts(2 * DEBT_SIZE);
        assert_eq!(drained.len(), 2);
        pool.add_to_pool(debt(100, 10)).unwrap();
        pool.add_to_pool(debt(101, 10)).unwrap();
    }

    #[test]
    fn verifier_gates_promotion() {
        let packed_only: Arc<dyn DebtVerifier> = Arc::new(StaticVerifier::new(true, false));
        let pool = pool_with(DebtPoolConfig::new(2), Some(packed_only));
        pool.add_debt(debt(1, 10)).unwrap();
        pool.do_checking_debt();
        assert_eq!(pool.to_confirm_count(), 1);
        assert_eq!(pool.confirmed_count(), 0);

        let settled: Arc<dyn DebtVerifier> = Arc::new(StaticVerifier::new(true, true));
        let pool = pool_with(DebtPoolConfig::new(2), Some(settled));
        pool.add_debt(debt(1, 10)).unwrap();
        pool.do_checking_debt();
        assert_eq!(pool.confirmed_count(), 1);
    }

    #[test]
    fn failing_verifier_drops_debt() {
        let failing: Arc<dyn DebtVerifier> = Arc::new(StaticVerifier::failing("source shard offline"));
        let pool = pool_with(DebtPoolConfig::new(2), Some(failing));
        pool.add_debt(debt(1, 10)).unwrap();
        pool.do_checking_debt();
        assert_eq!(pool.to_confirm_count(), 0);
        assert_eq!(pool.confirmed_count(), 0);
    }
}
