//! Genesis construction and validation.

use crate::errors::ChainError;
use fc_02_state::Statedb;
use fc_03_store::{Batch, BlockchainStore, KeyValueStore};
use shared_types::{
    empty_merkle_root, Address, Block, BlockHeader, ConsensusType, Hash, U256, WITNESS_SIZE,
};
use std::sync::Arc;
use tracing::info;

/// Everything needed to derive the genesis block of one shard.
#[derive(Debug, Clone)]
pub struct GenesisInfo {
    /// Pre-funded accounts.
    pub accounts: Vec<(Address, U256)>,
    /// Genesis difficulty (also the chain's starting total difficulty).
    pub difficulty: U256,
    pub shard: u8,
    pub timestamp: u64,
    pub consensus: ConsensusType,
    /// Raw extra payload (Istanbul chains put their validator extra here).
    pub extra: Vec<u8>,
}

impl GenesisInfo {
    pub fn new(shard: u8) -> Self {
        Self {
            accounts: Vec::new(),
            difficulty: U256::one(),
            shard,
            timestamp: 0,
            consensus: ConsensusType::Pow,
            extra: Vec::new(),
        }
    }
}

/// The derived genesis block.
pub struct Genesis {
    info: GenesisInfo,
}

impl Genesis {
    pub fn new(info: GenesisInfo) -> Self {
        Self { info }
    }

    /// Build the genesis block, committing its state into `account_db`'s
    /// batch. The same info always yields the same block hash.
    fn build(&self, account_db: &Arc<dyn KeyValueStore>) -> Result<(Block, Batch), ChainError> {
        let mut state = Statedb::new(Hash::EMPTY, Arc::clone(account_db))?;
        for (account, balance) in &self.info.accounts {
            state.set_balance(account, *balance)?;
        }
        let mut batch = Batch::new();
        let state_root = state.commit(&mut batch)?;

        let header = BlockHeader {
            previous_hash: Hash::EMPTY,
            creator: Address::EMPTY,
            state_root,
            tx_root: empty_merkle_root(),
            receipt_root: empty_merkle_root(),
            debt_root: empty_merkle_root(),
            difficulty: self.info.difficulty,
            height: 0,
            timestamp: U256::from(self.info.timestamp),
            witness: vec![0u8; WITNESS_SIZE],
            extra: self.info.extra.clone(),
            consensus: self.info.consensus,
        };

        Ok((Block::new(header, vec![], vec![]), batch))
    }

    /// Write the genesis into an empty store, or verify that a non-empty
    /// store starts from this same genesis.
    pub fn initialize_and_validate(
        &self,
        store: &BlockchainStore,
        account_db: &Arc<dyn KeyValueStore>,
    ) -> Result<Block, ChainError> {
        let (block, batch) = self.build(account_db)?;

        match store.get_block_hash(0)? {
            Some(stored) if stored == block.hash() => Ok(block),
            Some(stored) => Err(ChainError::GenesisMismatch {
                stored,
                built: block.hash(),
            }),
            None => {
                account_db.write_batch(batch).map_err(fc_03_store::StoreError::from)?;
                store.put_block(&block, self.info.difficulty, true)?;
                info!(hash = %block.hash(), shard = self.info.shard, "initialized genesis");
                Ok(block)
            }
        }
    }
}
