//! Header-only canonical chain.

use fc_02_state::Statedb;
use fc_03_store::{BlockchainStore, KeyValueStore};
use fc_07_chain::{validate_block_header, ChainError, EventManager, HeadChanged};
use parking_lot::RwLock;
use shared_types::consensus::{ChainReader, Engine};
use shared_types::{BlockHeader, Hash, U256};
use std::sync::Arc;
use tracing::{debug, info};

struct LightHead {
    current_header: BlockHeader,
    canonical_td: U256,
}

/// A chain of headers sharing the full chain's head rule and canonical
/// rewrite.
pub struct LightChain {
    store: Arc<BlockchainStore>,
    account_db: Arc<dyn KeyValueStore>,
    engine: Arc<dyn Engine>,
    head: RwLock<LightHead>,
    header_changed: EventManager<HeadChanged>,
}

impl LightChain {
    /// Open over a store that already holds at least the genesis header.
    pub fn open(
        store: Arc<BlockchainStore>,
        account_db: Arc<dyn KeyValueStore>,
        engine: Arc<dyn Engine>,
    ) -> Result<Self, ChainError> {
        let head_hash = store.get_head_block_hash()?.ok_or(ChainError::HeadNotFound)?;
        let current_header = store
            .get_block_header(&head_hash)?
            .ok_or(ChainError::HeadNotFound)?;
        let canonical_td = store
            .get_block_total_difficulty(&head_hash)?
            .ok_or(ChainError::HeadNotFound)?;

        info!(head = %head_hash, height = current_header.height, "opened light chain");

        Ok(LightChain {
            store,
            account_db,
            engine,
            head: RwLock::new(LightHead {
                current_header,
                canonical_td,
            }),
            header_changed: EventManager::new(),
        })
    }

    pub fn store(&self) -> Arc<BlockchainStore> {
        Arc::clone(&self.store)
    }

    pub fn canonical_total_difficulty(&self) -> U256 {
        self.head.read().canonical_td
    }

    pub fn subscribe_head_changed(&self, listener: impl Fn(&HeadChanged) + Send + Sync + 'static) {
        self.header_changed.subscribe(listener);
    }

    /// State anchored at `root`. The empty root yields the empty state; data
    /// beyond locally cached nodes is a retrieval concern, not a chain one.
    pub fn get_state(&self, root: Hash) -> Result<Statedb, ChainError> {
        Ok(Statedb::new(root, Arc::clone(&self.account_db))?)
    }

    /// State at the current head's root.
    pub fn current_state(&self) -> Result<Statedb, ChainError> {
        let root = self.head.read().current_header.state_root;
        self.get_state(root)
    }

    /// Validate and persist a header; applies the canonical rewrite when its
    /// branch total difficulty beats the current head's.
    pub fn write_header(&self, header: &BlockHeader) -> Result<(), ChainError> {
        let mut head = self.head.write();

        validate_block_header(
            &self.store,
            self.engine.as_ref(),
            head.current_header.clone(),
            header,
        )?;

        let previous_td = self
            .store
            .get_block_total_difficulty(&header.previous_hash)?
            .ok_or(shared_types::consensus::ConsensusError::InvalidParent(
                header.previous_hash,
            ))?;
        let total_difficulty = previous_td + header.difficulty;
        let is_head = total_difficulty > head.canonical_td;

        let hash = header.hash();
        self.store
            .put_block_header(hash, header, total_difficulty, is_head)?;
        debug!(%hash, height = header.height, is_head, "wrote header");

        if !is_head {
            return Ok(());
        }

        self.store
            .delete_larger_height_blocks(header.height + 1, None)?;
        self.store
            .overwrite_stale_blocks(header.previous_hash, None)?;

        let old_head = head.current_header.hash();
        head.current_header = header.clone();
        head.canonical_td = total_difficulty;

        self.header_changed.fire(&HeadChanged {
            new_head: hash,
            old_head,
            height: header.height,
        });
        Ok(())
    }
}

impl ChainReader for LightChain {
    fn current_header(&self) -> BlockHeader {
        self.head.read().current_header.clone()
    }

    fn header_by_hash(&self, hash: &Hash) -> Option<BlockHeader> {
        self.store.get_block_header(hash).ok().flatten()
    }

    fn header_by_height(&self, height: u64) -> Option<BlockHeader> {
        let hash = self.store.get_block_hash(height).ok().flatten()?;
        self.header_by_hash(&hash)
    }
}
