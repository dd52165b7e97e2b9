//! The canonical chain.
//!
//! `write_block` is the single entry point for new blocks, local or remote:
//! validate against the parent, execute against the parent's state, then
//! persist under the recovery point so a crash at any step leaves either the
//! pre-write or the post-write chain.

use crate::errors::ChainError;
use crate::events::{EventManager, HeadChanged};
use crate::executor::Executor;
use crate::genesis::{Genesis, GenesisInfo};
use fc_02_state::Statedb;
use fc_03_store::{Batch, BlockchainStore, KeyValueStore, RecoveryPoint};
use fc_04_pool::tx_pool::NonceReader;
use parking_lot::{Mutex, RwLock};
use shared_types::consensus::{block_reward, ChainReader, ConsensusError, Engine};
use shared_types::{merkle_root, Address, Block, BlockHeader, Hash, Receipt, U256};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Read-only chain view pinned to a known current header. Engines receive
/// this instead of the blockchain itself, so validation never re-enters the
/// chain lock.
pub struct ChainView {
    store: Arc<BlockchainStore>,
    current: BlockHeader,
}

impl ChainView {
    pub fn new(store: Arc<BlockchainStore>, current: BlockHeader) -> Self {
        Self { store, current }
    }
}

impl ChainReader for ChainView {
    fn current_header(&self) -> BlockHeader {
        self.current.clone()
    }

    fn header_by_hash(&self, hash: &Hash) -> Option<BlockHeader> {
        self.store.get_block_header(hash).ok().flatten()
    }

    fn header_by_height(&self, height: u64) -> Option<BlockHeader> {
        let hash = self.store.get_block_hash(height).ok().flatten()?;
        self.header_by_hash(&hash)
    }
}

/// Validate a header the way the chain writer does, without a body. Used by
/// the header-only chain as well.
pub fn validate_block_header(
    store: &Arc<BlockchainStore>,
    engine: &dyn Engine,
    current: BlockHeader,
    header: &BlockHeader,
) -> Result<(), ChainError> {
    if store.has_block_header(&header.hash())? {
        return Err(ChainError::AlreadyExists(header.hash()));
    }
    let view = ChainView::new(Arc::clone(store), current);
    engine.verify_header(&view, header)?;
    Ok(())
}

struct ChainHead {
    current_header: BlockHeader,
    canonical_td: U256,
}

/// The full chain of one shard.
pub struct Blockchain {
    store: Arc<BlockchainStore>,
    account_db: Arc<dyn KeyValueStore>,
    engine: Arc<dyn Engine>,
    executor: Arc<dyn Executor>,
    genesis: Block,
    local_shard: u8,
    head: RwLock<ChainHead>,
    recovery: Mutex<RecoveryPoint>,
    header_changed: EventManager<HeadChanged>,
    head_rollback: EventManager<HeadChanged>,
}

impl Blockchain {
    /// Initialize (or validate) genesis, replay any crash-recovery state and
    /// open the chain at its stored HEAD.
    pub fn open(
        info: GenesisInfo,
        store: Arc<BlockchainStore>,
        account_db: Arc<dyn KeyValueStore>,
        engine: Arc<dyn Engine>,
        executor: Arc<dyn Executor>,
        recovery_file: impl AsRef<Path>,
    ) -> Result<Self, ChainError> {
        let local_shard = info.shard;
        let genesis = Genesis::new(info).initialize_and_validate(&store, &account_db)?;

        let mut recovery = RecoveryPoint::load(recovery_file)?;
        recovery.recover(&store)?;

        let head_hash = store.get_head_block_hash()?.ok_or(ChainError::HeadNotFound)?;
        let current_header = store
            .get_block_header(&head_hash)?
            .ok_or(ChainError::HeadNotFound)?;
        let canonical_td = store
            .get_block_total_difficulty(&head_hash)?
            .ok_or(ChainError::HeadNotFound)?;

        info!(
            head = %head_hash,
            height = current_header.height,
            td = %canonical_td,
            "opened blockchain"
        );

        Ok(Blockchain {
            store,
            account_db,
            engine,
            executor,
            genesis,
            local_shard,
            head: RwLock::new(ChainHead {
                current_header,
                canonical_td,
            }),
            recovery: Mutex::new(recovery),
            header_changed: EventManager::new(),
            head_rollback: EventManager::new(),
        })
    }

    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    pub fn store(&self) -> Arc<BlockchainStore> {
        Arc::clone(&self.store)
    }

    pub fn account_db(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.account_db)
    }

    pub fn engine(&self) -> Arc<dyn Engine> {
        Arc::clone(&self.engine)
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor)
    }

    pub fn local_shard(&self) -> u8 {
        self.local_shard
    }

    pub fn canonical_total_difficulty(&self) -> U256 {
        self.head.read().canonical_td
    }

    /// State at the current head.
    pub fn current_state(&self) -> Result<Statedb, ChainError> {
        let root = self.head.read().current_header.state_root;
        Ok(Statedb::new(root, Arc::clone(&self.account_db))?)
    }

    /// State at an arbitrary committed root.
    pub fn state_at(&self, root: Hash) -> Result<Statedb, ChainError> {
        Ok(Statedb::new(root, Arc::clone(&self.account_db))?)
    }

    /// Listeners run inline under the chain write lock, in write completion
    /// order; they must not call back into chain write paths.
    pub fn subscribe_head_changed(&self, listener: impl Fn(&HeadChanged) + Send + Sync + 'static) {
        self.header_changed.subscribe(listener);
    }

    /// Fired before `head_changed` when the head jumped across branches.
    pub fn subscribe_head_rollback(&self, listener: impl Fn(&HeadChanged) + Send + Sync + 'static) {
        self.head_rollback.subscribe(listener);
    }

    /// Validate, execute and persist a block; moves HEAD when the block's
    /// total difficulty beats the canonical chain's.
    pub fn write_block(&self, block: &Block) -> Result<(), ChainError> {
        let mut head = self.head.write();

        let hash = block.hash();
        let height = block.header.height;
        let previous = block.header.previous_hash;

        if self.store.has_block_header(&hash)? {
            return Err(ChainError::AlreadyExists(hash));
        }
        let parent = self
            .store
            .get_block_header(&previous)?
            .ok_or(ConsensusError::InvalidParent(previous))?;

        let view = ChainView::new(Arc::clone(&self.store), head.current_header.clone());
        self.engine.verify_header(&view, &block.header)?;
        self.validate_body(block)?;

        let receipts = self.execute_block(block, &parent)?;

        let parent_td = self
            .store
            .get_block_total_difficulty(&previous)?
            .ok_or(ConsensusError::InvalidParent(previous))?;
        let total_difficulty = parent_td + block.header.difficulty;
        let is_head = total_difficulty > head.canonical_td;

        {
            let mut recovery = self.recovery.lock();
            recovery.on_put_block_start(hash, height, previous, is_head, &self.store)?;

            self.store.put_block(block, total_difficulty, is_head)?;
            self.store.put_receipts(hash, &receipts)?;

            if is_head {
                self.store
                    .delete_larger_height_blocks(height + 1, Some(&mut recovery))?;
                self.store
                    .overwrite_stale_blocks(previous, Some(&mut recovery))?;
            }

            recovery.on_put_block_end();
        }

        debug!(%hash, height, td = %total_difficulty, is_head, "wrote block");

        if is_head {
            let old_head = head.current_header.hash();
            head.current_header = block.header.clone();
            head.canonical_td = total_difficulty;

            let event = HeadChanged {
                new_head: hash,
                old_head,
                height,
            };
            if previous != old_head {
                info!(from = %old_head, to = %hash, "chain reorganization");
                self.head_rollback.fire(&event);
            }
            self.header_changed.fire(&event);
        }

        Ok(())
    }

    /// Body checks: roots, the leading reward transaction, signatures and
    /// shard membership.
    fn validate_body(&self, block: &Block) -> Result<(), ChainError> {
        let tx_root = merkle_root(&block.transactions);
        if tx_root != block.header.tx_root {
            return Err(ChainError::InvalidTxRoot {
                have: block.header.tx_root,
                want: tx_root,
            });
        }
        let debt_root = merkle_root(&block.debts);
        if debt_root != block.header.debt_root {
            return Err(ChainError::InvalidDebtRoot {
                have: block.header.debt_root,
                want: debt_root,
            });
        }

        let Some(reward) = block.transactions.first() else {
            return Err(ChainError::MissingRewardTx);
        };
        if !reward.is_reward() {
            return Err(ChainError::MissingRewardTx);
        }
        if reward.amount != block_reward(block.header.height) {
            return Err(ChainError::InvalidReward);
        }

        for tx in &block.transactions[1..] {
            if tx.is_reward() {
                return Err(ChainError::MisplacedRewardTx);
            }
            if tx.from.shard() != self.local_shard {
                return Err(ChainError::ShardMismatch {
                    shard: tx.from.shard(),
                    local: self.local_shard,
                });
            }
            tx.verify_signature()?;
        }

        for debt in &block.debts {
            if debt.target_shard() != self.local_shard {
                return Err(ChainError::DebtShardMismatch {
                    shard: debt.target_shard(),
                    local: self.local_shard,
                });
            }
        }

        Ok(())
    }

    /// Execute the block against its parent's state; commits the resulting
    /// state version only when every root matches.
    fn execute_block(
        &self,
        block: &Block,
        parent: &BlockHeader,
    ) -> Result<Vec<Receipt>, ChainError> {
        let mut state = Statedb::new(parent.state_root, Arc::clone(&self.account_db))?;

        // Incoming cross-shard debts settle before any transaction runs;
        // receipts' post-state roots depend on this order.
        for debt in &block.debts {
            state.add_balance(&debt.account, debt.amount)?;
        }

        let mut receipts = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            receipts.push(self.executor.apply(tx, &mut state)?);
        }

        let receipt_root = merkle_root(&receipts);
        if receipt_root != block.header.receipt_root {
            return Err(ChainError::InvalidReceiptRoot {
                have: block.header.receipt_root,
                want: receipt_root,
            });
        }

        let mut batch = Batch::new();
        let state_root = state.commit(&mut batch)?;
        if state_root != block.header.state_root {
            return Err(ChainError::InvalidStateRoot {
                have: block.header.state_root,
                want: state_root,
            });
        }
        self.account_db
            .write_batch(batch)
            .map_err(fc_03_store::StoreError::from)?;

        Ok(receipts)
    }
}

impl ChainReader for Blockchain {
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

// Committed nonces for pool admission. Reads go through the stored HEAD, not
// the chain lock, so pool listeners may run under the write lock.
impl NonceReader for Blockchain {
    fn account_nonce(&self, account: &Address) -> u64 {
        let nonce = || -> Result<u64, ChainError> {
            let head = self
                .store
                .get_head_block_hash()?
                .ok_or(ChainError::HeadNotFound)?;
            let header = self
                .store
                .get_block_header(&head)?
                .ok_or(ChainError::HeadNotFound)?;
            let state = Statedb::new(header.state_root, Arc::clone(&self.account_db))?;
            Ok(state.get_nonce(account)?)
        };
        nonce().unwrap_or(0)
    }
}
