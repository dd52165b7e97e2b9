//! The transaction pool.

use crate::domain::{PendingQueue, PoolItem};
use crate::errors::PoolError;
use crate::reorg::fork_diff;
use crate::TX_POOL_CAPACITY;
use fc_03_store::BlockchainStore;
use parking_lot::Mutex;
use shared_types::{Address, Hash, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Committed account nonces, as of the canonical head.
pub trait NonceReader: Send + Sync {
    fn account_nonce(&self, account: &Address) -> u64;
}

#[derive(Debug, Clone)]
pub struct TxPoolConfig {
    /// Maximum pending transactions.
    pub capacity: usize,
    /// Shard this node serves; senders must live here.
    pub local_shard: u8,
}

impl TxPoolConfig {
    pub fn new(local_shard: u8) -> Self {
        Self {
            capacity: TX_POOL_CAPACITY,
            local_shard,
        }
    }
}

struct Inner {
    pending: PendingQueue,
    /// hash → (sender, nonce) for every pending item.
    index: HashMap<Hash, (Address, u64)>,
    /// Items selected into an in-flight block, keyed by hash.
    processing: HashMap<Hash, PoolItem>,
    next_seq: u64,
}

/// Nonce-ordered, price-ranked transaction admission queue.
pub struct TxPool {
    config: TxPoolConfig,
    store: Arc<BlockchainStore>,
    nonces: Arc<dyn NonceReader>,
    inner: Mutex<Inner>,
}

impl TxPool {
    pub fn new(
        config: TxPoolConfig,
        store: Arc<BlockchainStore>,
        nonces: Arc<dyn NonceReader>,
    ) -> Self {
        Self {
            config,
            store,
            nonces,
            inner: Mutex::new(Inner {
                pending: PendingQueue::new(),
                index: HashMap::new(),
                processing: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Admit a transaction.
    ///
    /// Rejections: invalid signature, sender shard mismatch, already-pooled
    /// hash, nonce at or below the committed nonce, nonce gaps, same-nonce
    /// replacement without a strictly higher price, and a full pool when the
    /// candidate does not outbid the worst resident sender.
    pub fn add_transaction(&self, tx: Transaction) -> Result<(), PoolError> {
        if tx.is_reward() {
            return Err(PoolError::RewardNotAllowed);
        }
        if tx.from.shard() != self.config.local_shard {
            return Err(PoolError::ShardMismatch {
                shard: tx.from.shard(),
                local: self.config.local_shard,
            });
        }
        tx.verify_signature()?;

        let mut inner = self.inner.lock();
        self.admit(&mut inner, tx, true)
    }

    fn admit(&self, inner: &mut Inner, tx: Transaction, strict: bool) -> Result<(), PoolError> {
        let hash = tx.hash();
        if inner.index.contains_key(&hash) || inner.processing.contains_key(&hash) {
            return Err(PoolError::HashExists);
        }

        let state_nonce = self.nonces.account_nonce(&tx.from);
        if tx.nonce <= state_nonce {
            return Err(PoolError::NonceTooLow {
                nonce: tx.nonce,
                expected: state_nonce + 1,
            });
        }

        let pooled = inner.pending.nonces_of(&tx.from);
        let replacing = pooled.contains(&tx.nonce);

        if replacing {
            let existing = inner
                .pending
                .get(&tx.from, tx.nonce)
                .expect("nonce listed as pooled");
            if tx.price <= existing.tx.price {
                return Err(PoolError::NonceUsed { nonce: tx.nonce });
            }
        } else if strict {
            // Pooled nonces stay a contiguous run above the committed nonce.
            let expected = pooled.last().copied().unwrap_or(state_nonce) + 1;
            if tx.nonce != expected {
                return Err(PoolError::NonceTooLow {
                    nonce: tx.nonce,
                    expected,
                });
            }
        }

        if !replacing && inner.pending.len() >= self.config.capacity {
            match inner.pending.discard_worst_below(&tx.price) {
                None => {
                    return Err(PoolError::PoolFull {
                        capacity: self.config.capacity,
                    })
                }
                Some(evicted) => {
                    for item in &evicted {
                        inner.index.remove(&item.tx.hash());
                    }
                    debug!(count = evicted.len(), "evicted worst sender to admit a better-priced transaction");
                }
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.index.insert(hash, (tx.from, tx.nonce));
        if let Some(displaced) = inner.pending.add(PoolItem { tx, seq }) {
            inner.index.remove(&displaced.tx.hash());
        }
        Ok(())
    }

    /// Pop the best proposable transaction and park it in the processing
    /// tier so it is not selected twice.
    pub fn pop_best_transaction(&self) -> Option<Transaction> {
        let mut inner = self.inner.lock();
        let item = inner.pending.pop_best()?;
        let hash = item.tx.hash();
        inner.index.remove(&hash);
        let tx = item.tx.clone();
        inner.processing.insert(hash, item);
        Some(tx)
    }

    /// Look up a transaction in either tier.
    pub fn get_transaction(&self, hash: &Hash) -> Option<Transaction> {
        let inner = self.inner.lock();
        if let Some((account, nonce)) = inner.index.get(hash) {
            return inner
                .pending
                .get(account, *nonce)
                .map(|item| item.tx.clone());
        }
        inner.processing.get(hash).map(|item| item.tx.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn processing_count(&self) -> usize {
        self.inner.lock().processing.len()
    }

    /// Pooled nonces of a sender, ascending (pending tier only).
    pub fn pooled_nonces(&self, account: &Address) -> Vec<u64> {
        self.inner.lock().pending.nonces_of(account)
    }

    /// React to a canonical head move.
    ///
    /// Processing items return to pending, transactions from the abandoned
    /// branch are re-admitted, and anything now confirmed in the canonical
    /// chain is dropped.
    pub fn on_head_changed(&self, new_head: Hash, old_head: Hash) {
        let mut inner = self.inner.lock();

        // Everything selected for an in-flight block is up for grabs again.
        let parked: Vec<PoolItem> = inner.processing.drain().map(|(_, item)| item).collect();
        for item in parked {
            let _ = self.admit(&mut inner, item.tx, false);
        }

        // Reinject the transactions a reorganization dropped.
        match fork_diff(&self.store, new_head, old_head) {
            Ok(diff) if !diff.detached.is_empty() => {
                let attached: std::collections::HashSet<Hash> = diff
                    .attached
                    .iter()
                    .flat_map(|block| block.transactions.iter().map(Transaction::hash))
                    .collect();
                let mut reinjected = 0usize;
                for block in &diff.detached {
                    for tx in &block.transactions {
                        if tx.is_reward() || attached.contains(&tx.hash()) {
                            continue;
                        }
                        if self.admit(&mut inner, tx.clone(), false).is_ok() {
                            reinjected += 1;
                        }
                    }
                }
                if reinjected > 0 {
                    debug!(reinjected, "re-admitted transactions from abandoned branch");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "failed to diff branches for reinjection"),
        }

        // Drop whatever the canonical chain now contains.
        self.remove_confirmed(&mut inner);
    }

    fn remove_confirmed(&self, inner: &mut Inner) {
        let pending: Vec<(Hash, Address, u64)> = inner
            .index
            .iter()
            .map(|(hash, (account, nonce))| (*hash, *account, *nonce))
            .collect();
        for (hash, account, nonce) in pending {
            match self.store.get_tx_index(&hash) {
                Ok(Some(_)) => {
                    inner.pending.remove(account, nonce);
                    inner.index.remove(&hash);
                }
                Ok(None) => {}
                Err(err) => warn!(%err, "tx index lookup failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_03_store::MemoryStore;
    use parking_lot::RwLock;
    use shared_crypto::KeyPair;
    use shared_types::{Block, BlockHeader, U256};

    #[derive(Default)]
    struct FixedNonces(RwLock<HashMap<Address, u64>>);

    impl FixedNonces {
        fn set(&self, account: Address, nonce: u64) {
            self.0.write().insert(account, nonce);
        }
    }

    impl NonceReader for FixedNonces {
        fn account_nonce(&self, account: &Address) -> u64 {
            self.0.read().get(account).copied().unwrap_or(0)
        }
    }

    struct Fixture {
        pool: TxPool,
        store: Arc<BlockchainStore>,
        nonces: Arc<FixedNonces>,
    }

    fn fixture_with_capacity(capacity: usize) -> Fixture {
        let store = Arc::new(BlockchainStore::new(Arc::new(MemoryStore::new())));
        let nonces = Arc::new(FixedNonces::default());
        let pool = TxPool::new(
            TxPoolConfig {
                capacity,
                local_shard: 1,
            },
            store.clone(),
            nonces.clone(),
        );
        Fixture {
            pool,
            store,
            nonces,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_capacity(TX_POOL_CAPACITY)
    }

    struct Sender {
        keypair: KeyPair,
        address: Address,
    }

    fn sender(shard: u8) -> Sender {
        let keypair = KeyPair::generate();
        let address = Address::from_public_key(&keypair.public_key_bytes(), shard);
        Sender { keypair, address }
    }

    fn signed_tx(sender: &Sender, nonce: u64, price: u64) -> Transaction {
        let mut to = [9u8; 20];
        to[0] = 1 << 4;
        let mut tx = Transaction {
            from: sender.address,
            to: Address(to),
            amount: U256::from(10u64),
            price: U256::from(price),
            gas_limit: 21_000,
            nonce,
            timestamp: nonce,
            ..Default::default()
        };
        tx.sign(&sender.keypair).unwrap();
        tx
    }

    // =========================================================================
    // ADMISSION
    // =========================================================================

    #[test]
    fn accepts_and_orders_by_price() {
        let f = fixture();
        let cheap = sender(1);
        let rich = sender(1);

        f.pool.add_transaction(signed_tx(&cheap, 1, 10)).unwrap();
        f.pool.add_transaction(signed_tx(&rich, 1, 90)).unwrap();

        assert_eq!(f.pool.pending_count(), 2);
        assert_eq!(
            f.pool.pop_best_transaction().unwrap().from,
            rich.address
        );
        assert_eq!(f.pool.processing_count(), 1);
    }

    #[test]
    fn rejects_duplicate_hash() {
        let f = fixture();
        let s = sender(1);
        let tx = signed_tx(&s, 1, 10);

        f.pool.add_transaction(tx.clone()).unwrap();
        assert!(matches!(
            f.pool.add_transaction(tx),
            Err(PoolError::HashExists)
        ));
    }

    #[test]
    fn rejects_wrong_shard_sender() {
        let f = fixture();
        let foreign = sender(2);
        assert!(matches!(
            f.pool.add_transaction(signed_tx(&foreign, 1, 10)),
            Err(PoolError::ShardMismatch { shard: 2, local: 1 })
        ));
    }

    #[test]
    fn rejects_reward_transaction() {
        let f = fixture();
        let reward = Transaction::default();
        assert!(matches!(
            f.pool.add_transaction(reward),
            Err(PoolError::RewardNotAllowed)
        ));
    }

    #[test]
    fn rejects_tampered_signature() {
        let f = fixture();
        let s = sender(1);
        let mut tx = signed_tx(&s, 1, 10);
        tx.amount = U256::from(999u64);
        assert!(matches!(
            f.pool.add_transaction(tx),
            Err(PoolError::InvalidSignature(_))
        ));
    }

    #[test]
    fn rejects_confirmed_nonce() {
        let f = fixture();
        let s = sender(1);
        f.nonces.set(s.address, 5);

        assert!(matches!(
            f.pool.add_transaction(signed_tx(&s, 5, 10)),
            Err(PoolError::NonceTooLow {
                nonce: 5,
                expected: 6
            })
        ));
        f.pool.add_transaction(signed_tx(&s, 6, 10)).unwrap();
    }

    #[test]
    fn rejects_nonce_gap() {
        let f = fixture();
        let s = sender(1);
        f.pool.add_transaction(signed_tx(&s, 1, 10)).unwrap();
        assert!(f.pool.add_transaction(signed_tx(&s, 3, 10)).is_err());
        f.pool.add_transaction(signed_tx(&s, 2, 10)).unwrap();
        assert_eq!(f.pool.pooled_nonces(&s.address), vec![1, 2]);
    }

    // =========================================================================
    // REPLACEMENT
    // =========================================================================

    #[test]
    fn same_nonce_requires_strictly_higher_price() {
        let f = fixture();
        let s = sender(1);
        f.pool.add_transaction(signed_tx(&s, 1, 10)).unwrap();

        assert!(matches!(
            f.pool.add_transaction(signed_tx(&s, 1, 10)),
            Err(PoolError::NonceUsed { nonce: 1 })
        ));
        assert!(matches!(
            f.pool.add_transaction(signed_tx(&s, 1, 9)),
            Err(PoolError::NonceUsed { nonce: 1 })
        ));

        let better = signed_tx(&s, 1, 11);
        let better_hash = better.hash();
        f.pool.add_transaction(better).unwrap();
        assert_eq!(f.pool.pending_count(), 1);
        assert!(f.pool.get_transaction(&better_hash).is_some());
    }

    // =========================================================================
    // CAPACITY / EVICTION
    // =========================================================================

    #[test]
    fn full_pool_evicts_worst_sender_for_better_price() {
        let f = fixture_with_capacity(2);
        let cheap = sender(1);
        let mid = sender(1);
        let rich = sender(1);

        f.pool.add_transaction(signed_tx(&cheap, 1, 5)).unwrap();
        f.pool.add_transaction(signed_tx(&mid, 1, 20)).unwrap();

        // Not better than the worst head price: rejected.
        assert!(matches!(
            f.pool.add_transaction(signed_tx(&rich, 1, 5)),
            Err(PoolError::PoolFull { capacity: 2 })
        ));

        // Better price: the cheap sender's whole collection is evicted.
        f.pool.add_transaction(signed_tx(&rich, 1, 50)).unwrap();
        assert_eq!(f.pool.pending_count(), 2);
        assert!(f.pool.pooled_nonces(&cheap.address).is_empty());
    }

    #[test]
    fn capacity_never_exceeded() {
        let f = fixture_with_capacity(3);
        for price in 1..=6u64 {
            let s = sender(1);
            let _ = f.pool.add_transaction(signed_tx(&s, 1, price * 10));
            assert!(f.pool.pending_count() <= 3);
        }
    }

    // =========================================================================
    // HEAD CHANGES
    // =========================================================================

    fn store_chain(f: &Fixture, blocks: &[(u64, Hash, Vec<Transaction>)]) -> Vec<Hash> {
        let mut hashes = Vec::new();
        for (height, parent, txs) in blocks {
            let block = Block::new(
                BlockHeader {
                    previous_hash: *parent,
                    height: *height,
                    difficulty: U256::one(),
                    timestamp: U256::from(height * 7 + txs.len() as u64 + 1),
                    ..Default::default()
                },
                txs.clone(),
                vec![],
            );
            f.store
                .put_block(&block, U256::from(*height + 1), false)
                .unwrap();
            hashes.push(block.hash());
        }
        hashes
    }

    #[test]
    fn processing_items_requeue_on_head_change() {
        let f = fixture();
        let s = sender(1);
        f.pool.add_transaction(signed_tx(&s, 1, 10)).unwrap();

        let popped = f.pool.pop_best_transaction().unwrap();
        assert_eq!(f.pool.processing_count(), 1);

        let genesis = store_chain(&f, &[(0, Hash::EMPTY, vec![])])[0];
        f.pool.on_head_changed(genesis, genesis);

        assert_eq!(f.pool.processing_count(), 0);
        assert_eq!(f.pool.pending_count(), 1);
        assert_eq!(
            f.pool.pop_best_transaction().unwrap().hash(),
            popped.hash()
        );
    }

    #[test]
    fn reorg_reinjects_dropped_branch_transactions() {
        let f = fixture();
        let s = sender(1);
        let tx_shared = signed_tx(&s, 1, 10);
        let tx_dropped = signed_tx(&s, 2, 10);

        let genesis = store_chain(&f, &[(0, Hash::EMPTY, vec![])])[0];
        // Old branch packs both transactions; new branch only the first.
        let old = store_chain(
            &f,
            &[(1, genesis, vec![tx_shared.clone(), tx_dropped.clone()])],
        )[0];
        let new_blocks = store_chain(&f, &[(1, genesis, vec![tx_shared.clone()])]);
        let new_mid = new_blocks[0];
        let new_head = store_chain(&f, &[(2, new_mid, vec![])])[0];

        // The state nonce already covers the shared tx on the new branch.
        f.nonces.set(s.address, 1);
        f.pool.on_head_changed(new_head, old);

        assert_eq!(f.pool.pooled_nonces(&s.address), vec![2]);
        assert_eq!(
            f.pool.pop_best_transaction().unwrap().hash(),
            tx_dropped.hash()
        );
    }

    #[test]
    fn confirmed_transactions_are_dropped() {
        let f = fixture();
        let s = sender(1);
        let tx = signed_tx(&s, 1, 10);
        f.pool.add_transaction(tx.clone()).unwrap();

        let genesis = store_chain(&f, &[(0, Hash::EMPTY, vec![])])[0];
        let head_block = Block::new(
            BlockHeader {
                previous_hash: genesis,
                height: 1,
                difficulty: U256::one(),
                timestamp: U256::from(50u64),
                ..Default::default()
            },
            vec![tx],
            vec![],
        );
        // Written as head: the tx index becomes visible.
        f.store
            .put_block(&head_block, U256::from(2u64), true)
            .unwrap();

        f.pool.on_head_changed(head_block.hash(), genesis);
        assert_eq!(f.pool.pending_count(), 0);
    }
}
