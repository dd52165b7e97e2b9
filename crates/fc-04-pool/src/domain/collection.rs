//! Per-sender transaction collections.

use shared_types::{Transaction, U256};
use std::collections::BTreeMap;

/// A pooled transaction plus its admission sequence number. The sequence
/// number breaks price ties deterministically: earlier admission wins.
#[derive(Debug, Clone)]
pub struct PoolItem {
    pub tx: Transaction,
    pub seq: u64,
}

/// Nonce-ordered transactions of a single sender. The head (lowest nonce) is
/// the only proposable item; its price ranks the sender across the pool.
#[derive(Debug, Default)]
pub struct TxCollection {
    items: BTreeMap<u64, PoolItem>,
}

impl TxCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, returning the displaced item when the nonce was occupied.
    pub fn add(&mut self, item: PoolItem) -> Option<PoolItem> {
        self.items.insert(item.tx.nonce, item)
    }

    pub fn get(&self, nonce: u64) -> Option<&PoolItem> {
        self.items.get(&nonce)
    }

    pub fn remove(&mut self, nonce: u64) -> Option<PoolItem> {
        self.items.remove(&nonce)
    }

    /// Lowest-nonce item.
    pub fn peek(&self) -> Option<&PoolItem> {
        self.items.values().next()
    }

    pub fn pop(&mut self) -> Option<PoolItem> {
        let nonce = *self.items.keys().next()?;
        self.items.remove(&nonce)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Price of the head item; zero for an empty collection.
    pub fn head_price(&self) -> U256 {
        self.peek().map(|item| item.tx.price).unwrap_or_default()
    }

    /// Admission sequence of the head item.
    pub fn head_seq(&self) -> u64 {
        self.peek().map(|item| item.seq).unwrap_or(u64::MAX)
    }

    pub fn items(&self) -> impl Iterator<Item = &PoolItem> {
        self.items.values()
    }

    pub fn into_items(self) -> Vec<PoolItem> {
        self.items.into_values().collect()
    }

    /// Pooled nonces in ascending order.
    pub fn nonces(&self) -> Vec<u64> {
        self.items.keys().copied().collect()
    }
}
