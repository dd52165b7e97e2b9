//! Journaled account state over a [`Trie`] version.

use crate::domain::account::AccountData;
use crate::domain::errors::StateError;
use crate::domain::trie::Trie;
use fc_03_store::{Batch, KeyValueStore};
use shared_types::{Address, CanonicalDecode, CanonicalEncode, Hash, U256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Storage key prefix for contract code blobs.
const CODE_PREFIX: &[u8] = b"code-";

fn code_key(hash: &Hash) -> Vec<u8> {
    let mut key = CODE_PREFIX.to_vec();
    key.extend_from_slice(hash.as_bytes());
    key
}

enum JournalEntry {
    /// Previous cached value of an account; `None` means the account was not
    /// cached before this mutation.
    Account(Address, Option<AccountData>),
}

/// Mutable account state anchored at one trie version.
///
/// Mutations are journaled; [`Statedb::snapshot`] returns a marker and
/// [`Statedb::revert_to_snapshot`] unwinds back to it. [`Statedb::hash`] and
/// [`Statedb::commit`] flush the cache into the trie and clear the journal,
/// invalidating earlier snapshot markers.
pub struct Statedb {
    trie: Trie,
    db: Arc<dyn KeyValueStore>,
    cache: HashMap<Address, AccountData>,
    journal: Vec<JournalEntry>,
    /// Code blobs pending commit, keyed by code hash.
    pending_code: HashMap<Hash, Vec<u8>>,
}

impl Statedb {
    /// Open the state at `root`. The empty root is the empty state.
    pub fn new(root: Hash, db: Arc<dyn KeyValueStore>) -> Result<Self, StateError> {
        Ok(Statedb {
            trie: Trie::open(root, db.clone())?,
            db,
            cache: HashMap::new(),
            journal: Vec::new(),
            pending_code: HashMap::new(),
        })
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Current account record; zero-valued default when absent.
    pub fn get_account(&self, address: &Address) -> Result<AccountData, StateError> {
        if let Some(account) = self.cache.get(address) {
            return Ok(account.clone());
        }
        self.load_account(address)
    }

    pub fn get_balance(&self, address: &Address) -> Result<U256, StateError> {
        Ok(self.get_account(address)?.balance)
    }

    pub fn get_nonce(&self, address: &Address) -> Result<u64, StateError> {
        Ok(self.get_account(address)?.nonce)
    }

    pub fn get_code(&self, address: &Address) -> Result<Option<Vec<u8>>, StateError> {
        let code_hash = self.get_account(address)?.code_hash;
        if code_hash.is_empty() {
            return Ok(None);
        }
        if let Some(code) = self.pending_code.get(&code_hash) {
            return Ok(Some(code.clone()));
        }
        Ok(self.db.get(&code_key(&code_hash))?)
    }

    fn load_account(&self, address: &Address) -> Result<AccountData, StateError> {
        match self.trie.get(address.as_bytes())? {
            None => Ok(AccountData::default()),
            Some(bytes) => {
                AccountData::from_canonical_bytes(&bytes).map_err(StateError::CorruptAccount)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Materialize an account in the cache (zero-valued if new).
    pub fn create_account(&mut self, address: Address) -> Result<(), StateError> {
        self.account_mut(&address)?;
        Ok(())
    }

    pub fn set_balance(&mut self, address: &Address, balance: U256) -> Result<(), StateError> {
        self.account_mut(address)?.balance = balance;
        Ok(())
    }

    pub fn add_balance(&mut self, address: &Address, amount: U256) -> Result<(), StateError> {
        let account = self.account_mut(address)?;
        account.balance = account.balance.saturating_add(amount);
        Ok(())
    }

    /// Deduct without underflow. Balance sufficiency is the executor's check,
    /// not the state's.
    pub fn sub_balance(&mut self, address: &Address, amount: U256) -> Result<(), StateError> {
        let account = self.account_mut(address)?;
        account.balance = account.balance.saturating_sub(amount);
        Ok(())
    }

    pub fn set_nonce(&mut self, address: &Address, nonce: u64) -> Result<(), StateError> {
        self.account_mut(address)?.nonce = nonce;
        Ok(())
    }

    pub fn set_code(&mut self, address: &Address, code: Vec<u8>) -> Result<(), StateError> {
        let code_hash = Hash::of(&code);
        self.pending_code.insert(code_hash, code);
        self.account_mut(address)?.code_hash = code_hash;
        Ok(())
    }

    fn account_mut(&mut self, address: &Address) -> Result<&mut AccountData, StateError> {
        if !self.cache.contains_key(address) {
            let loaded = self.load_account(address)?;
            self.journal.push(JournalEntry::Account(*address, None));
            self.cache.insert(*address, loaded);
        } else {
            let previous = self.cache.get(address).cloned();
            self.journal.push(JournalEntry::Account(*address, previous));
        }
        Ok(self.cache.get_mut(address).expect("account cached above"))
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Cheap revert marker: the current journal length.
    pub fn snapshot(&self) -> usize {
        self.journal.len()
    }

    /// Unwind every mutation made after `id` was taken.
    pub fn revert_to_snapshot(&mut self, id: usize) -> Result<(), StateError> {
        if id > self.journal.len() {
            return Err(StateError::InvalidSnapshot(id));
        }
        while self.journal.len() > id {
            match self.journal.pop().expect("length checked") {
                JournalEntry::Account(address, previous) => match previous {
                    Some(account) => {
                        self.cache.insert(address, account);
                    }
                    None => {
                        self.cache.remove(&address);
                    }
                },
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Hashing and commit
    // -------------------------------------------------------------------------

    /// Fold pending mutations into the trie and return the resulting root.
    /// Clears the journal: snapshot markers taken before this call are dead.
    pub fn hash(&mut self) -> Result<Hash, StateError> {
        self.flush()?;
        Ok(self.trie.root_hash())
    }

    /// Flush mutations and write the new trie nodes plus pending code blobs
    /// into `batch`. Returns the committed root.
    pub fn commit(&mut self, batch: &mut Batch) -> Result<Hash, StateError> {
        self.flush()?;
        for (code_hash, code) in self.pending_code.drain() {
            batch.put(code_key(&code_hash), code);
        }
        let root = self.trie.commit(batch);
        trace!(%root, "committed state");
        Ok(root)
    }

    fn flush(&mut self) -> Result<(), StateError> {
        for (address, account) in &self.cache {
            self.trie
                .insert(address.as_bytes(), account.to_canonical_bytes())?;
        }
        self.journal.clear();
        Ok(())
    }
}
