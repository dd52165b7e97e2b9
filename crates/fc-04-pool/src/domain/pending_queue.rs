//! Sender collections ranked by head price.
//!
//! One ordered set serves both ends: the front is the best candidate to
//! propose, the back is the first candidate to evict.

use super::collection::{PoolItem, TxCollection};
use shared_types::{Address, U256};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// Ranking key of a sender's collection. Orders best-first: higher head
/// price, then earlier admission, then address as the final disambiguator.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AccountRank {
    price: U256,
    seq: u64,
    account: Address,
}

impl Ord for AccountRank {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .price
            .cmp(&self.price)
            .then(self.seq.cmp(&other.seq))
            .then(self.account.cmp(&other.account))
    }
}

impl PartialOrd for AccountRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The pending tier: every sender's nonce-ordered collection plus the
/// cross-sender ranking.
#[derive(Debug, Default)]
pub struct PendingQueue {
    accounts: HashMap<Address, TxCollection>,
    ranks: BTreeSet<AccountRank>,
    len: usize,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    fn rank_of(account: Address, collection: &TxCollection) -> AccountRank {
        AccountRank {
            price: collection.head_price(),
            seq: collection.head_seq(),
            account,
        }
    }

    fn unrank(&mut self, account: Address) {
        if let Some(collection) = self.accounts.get(&account) {
            self.ranks.remove(&Self::rank_of(account, collection));
        }
    }

    fn rerank(&mut self, account: Address) {
        if let Some(collection) = self.accounts.get(&account) {
            if collection.is_empty() {
                self.accounts.remove(&account);
            } else {
                self.ranks.insert(Self::rank_of(account, collection));
            }
        }
    }

    /// Insert an item, displacing a same-nonce item of the same sender if
    /// present (the caller decides whether the displacement is allowed).
    pub fn add(&mut self, item: PoolItem) -> Option<PoolItem> {
        let account = item.tx.from;
        self.unrank(account);
        let displaced = self.accounts.entry(account).or_default().add(item);
        self.rerank(account);
        if displaced.is_none() {
            self.len += 1;
        }
        displaced
    }

    pub fn get(&self, account: &Address, nonce: u64) -> Option<&PoolItem> {
        self.accounts.get(account)?.get(nonce)
    }

    pub fn remove(&mut self, account: Address, nonce: u64) -> Option<PoolItem> {
        self.unrank(account);
        let removed = self
            .accounts
            .get_mut(&account)
            .and_then(|collection| collection.remove(nonce));
        self.rerank(account);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Head item of the best-ranked sender.
    pub fn peek_best(&self) -> Option<&PoolItem> {
        let rank = self.ranks.iter().next()?;
        self.accounts.get(&rank.account)?.peek()
    }

    /// Pop the head item of the best-ranked sender; the sender is re-ranked
    /// by its next nonce.
    pub fn pop_best(&mut self) -> Option<PoolItem> {
        let account = self.ranks.iter().next()?.account;
        self.unrank(account);
        let item = self
            .accounts
            .get_mut(&account)
            .and_then(|collection| collection.pop());
        self.rerank(account);
        if item.is_some() {
            self.len -= 1;
        }
        item
    }

    /// Head price of the worst-ranked sender.
    pub fn worst_price(&self) -> Option<U256> {
        self.ranks.iter().next_back().map(|rank| rank.price)
    }

    /// Evict the worst sender's entire collection when its head price is
    /// strictly below `price`. Returns the evicted items.
    pub fn discard_worst_below(&mut self, price: &U256) -> Option<Vec<PoolItem>> {
        let worst = self.ranks.iter().next_back()?.clone();
        if worst.price >= *price {
            return None;
        }
        self.ranks.remove(&worst);
        let collection = self.accounts.remove(&worst.account)?;
        self.len -= collection.len();
        Some(collection.into_items())
    }

    /// Every pooled item, unordered.
    pub fn list(&self) -> Vec<PoolItem> {
        self.accounts
            .values()
            .flat_map(|collection| collection.items().cloned())
            .collect()
    }

    /// Pooled nonces of one sender, ascending.
    pub fn nonces_of(&self, account: &Address) -> Vec<u64> {
        self.accounts
            .get(account)
            .map(|collection| collection.nonces())
            .unwrap_or_default()
    }
}
