//! Block, header, receipt and index persistence.
//!
//! All reads return `Ok(None)` for missing records; corruption (present but
//! undecodable) is an error. Writes that must be visible together go through
//! one [`Batch`].

use crate::ports::{Batch, KeyValueStore, KvError};
use crate::recovery::RecoveryPoint;
use shared_types::codec::{decode_seq, encode_seq, ByteReader, ByteWriter, CodecError};
use shared_types::{Block, BlockHeader, CanonicalDecode, CanonicalEncode, Debt, Hash, Receipt, Transaction, U256};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Storage key schema.
pub mod keys {
    use shared_types::Hash;

    /// HEAD pointer: hash of the canonical tip.
    pub const HEAD: &[u8] = b"HEAD";
    /// Current committed state root.
    pub const STATE_ROOT: &[u8] = b"STATE_ROOT_HASH";
    /// Address of the global system contract.
    pub const GLOBAL_CONTRACT_ADDRESS: &[u8] = b"GLOBAL_CONTRACT_ADDRESS";
    /// Prefix for stored contract compile outputs (`FH-` || address).
    pub const CONTRACT_OUTPUT_PREFIX: &[u8] = b"FH-";

    pub fn header(hash: &Hash) -> Vec<u8> {
        prefixed(b"H-", hash)
    }

    pub fn body(hash: &Hash) -> Vec<u8> {
        prefixed(b"B-", hash)
    }

    pub fn receipts(hash: &Hash) -> Vec<u8> {
        prefixed(b"R-", hash)
    }

    pub fn total_difficulty(hash: &Hash) -> Vec<u8> {
        prefixed(b"T-", hash)
    }

    pub fn canonical(height: u64) -> Vec<u8> {
        let mut key = b"h-".to_vec();
        key.extend_from_slice(&height.to_be_bytes());
        key
    }

    pub fn tx_index(hash: &Hash) -> Vec<u8> {
        prefixed(b"t-", hash)
    }

    pub fn debt_index(hash: &Hash) -> Vec<u8> {
        prefixed(b"d-", hash)
    }

    fn prefixed(prefix: &[u8], hash: &Hash) -> Vec<u8> {
        let mut key = prefix.to_vec();
        key.extend_from_slice(hash.as_bytes());
        key
    }
}

/// Errors surfaced by the blockchain store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key-value backend failure")]
    Kv(#[from] KvError),

    #[error("corrupt {context} record")]
    Corrupt {
        context: &'static str,
        #[source]
        source: CodecError,
    },

    #[error("HEAD block hash not found")]
    HeadNotFound,

    #[error("block header not found, hash = {0}")]
    HeaderNotFound(Hash),

    #[error("failed to {context} recovery point file")]
    RecoveryIo {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode recovery point")]
    RecoveryEncode(#[from] serde_json::Error),
}

/// Location of a transaction (or debt) inside a canonical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxIndex {
    pub block_hash: Hash,
    pub index: u32,
}

impl TxIndex {
    fn to_bytes(self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(36);
        self.block_hash.encode(&mut writer);
        writer.write_u32(self.index);
        writer.finish()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let block_hash = Hash::decode(&mut reader)?;
        let index = reader.read_u32()?;
        Ok(TxIndex { block_hash, index })
    }
}

/// Debts are indexed the same way transactions are.
pub type DebtIndex = TxIndex;

struct Body {
    transactions: Vec<Transaction>,
    debts: Vec<Debt>,
}

impl Body {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        encode_seq(&self.transactions, &mut writer);
        encode_seq(&self.debts, &mut writer);
        writer.finish()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(bytes);
        Ok(Body {
            transactions: decode_seq(&mut reader)?,
            debts: decode_seq(&mut reader)?,
        })
    }
}

/// The persistent chain store.
pub struct BlockchainStore {
    db: Arc<dyn KeyValueStore>,
}

impl BlockchainStore {
    pub fn new(db: Arc<dyn KeyValueStore>) -> Self {
        Self { db }
    }

    // -------------------------------------------------------------------------
    // HEAD and canonical index
    // -------------------------------------------------------------------------

    pub fn get_head_block_hash(&self) -> Result<Option<Hash>, StoreError> {
        Ok(self
            .db
            .get(keys::HEAD)?
            .and_then(|bytes| Hash::from_slice(&bytes)))
    }

    pub fn put_head_block_hash(&self, hash: Hash) -> Result<(), StoreError> {
        self.db.put(keys::HEAD, hash.as_bytes())?;
        Ok(())
    }

    pub fn get_block_hash(&self, height: u64) -> Result<Option<Hash>, StoreError> {
        Ok(self
            .db
            .get(&keys::canonical(height))?
            .and_then(|bytes| Hash::from_slice(&bytes)))
    }

    pub fn put_block_hash(&self, height: u64, hash: Hash) -> Result<(), StoreError> {
        self.db.put(&keys::canonical(height), hash.as_bytes())?;
        Ok(())
    }

    /// Remove the canonical pointer at `height`. Returns whether it existed.
    pub fn delete_block_hash(&self, height: u64) -> Result<bool, StoreError> {
        let key = keys::canonical(height);
        let existed = self.db.exists(&key)?;
        if existed {
            self.db.delete(&key)?;
        }
        Ok(existed)
    }

    // -------------------------------------------------------------------------
    // Headers, bodies, receipts
    // -------------------------------------------------------------------------

    pub fn get_block_header(&self, hash: &Hash) -> Result<Option<BlockHeader>, StoreError> {
        match self.db.get(&keys::header(hash))? {
            None => Ok(None),
            Some(bytes) => BlockHeader::from_canonical_bytes(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    context: "block header",
                    source,
                }),
        }
    }

    pub fn has_block_header(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self.db.exists(&keys::header(hash))?)
    }

    pub fn get_block_total_difficulty(&self, hash: &Hash) -> Result<Option<U256>, StoreError> {
        Ok(self
            .db
            .get(&keys::total_difficulty(hash))?
            .map(|bytes| U256::from_big_endian(&bytes)))
    }

    /// Persist a header with its total difficulty; when `is_head`, the HEAD
    /// pointer and the canonical pointer at the header's height move to it in
    /// the same batch.
    pub fn put_block_header(
        &self,
        hash: Hash,
        header: &BlockHeader,
        total_difficulty: U256,
        is_head: bool,
    ) -> Result<(), StoreError> {
        self.put_block_internal(hash, header, None, total_difficulty, is_head)
    }

    /// Persist a full block (header + body), updating HEAD as for
    /// [`Self::put_block_header`].
    pub fn put_block(
        &self,
        block: &Block,
        total_difficulty: U256,
        is_head: bool,
    ) -> Result<(), StoreError> {
        self.put_block_internal(
            block.hash(),
            &block.header,
            Some(block),
            total_difficulty,
            is_head,
        )
    }

    fn put_block_internal(
        &self,
        hash: Hash,
        header: &BlockHeader,
        block: Option<&Block>,
        total_difficulty: U256,
        is_head: bool,
    ) -> Result<(), StoreError> {
        let mut batch = Batch::new();

        batch.put(keys::header(&hash), header.to_canonical_bytes());

        let mut td_bytes = [0u8; 32];
        total_difficulty.to_big_endian(&mut td_bytes);
        batch.put(keys::total_difficulty(&hash), td_bytes.to_vec());

        if let Some(block) = block {
            let body = Body {
                transactions: block.transactions.clone(),
                debts: block.debts.clone(),
            };
            batch.put(keys::body(&hash), body.to_bytes());
        }

        if is_head {
            batch.put(keys::canonical(header.height).to_vec(), hash.as_bytes().to_vec());
            batch.put(keys::HEAD.to_vec(), hash.as_bytes().to_vec());
            if let Some(block) = block {
                add_index_ops(&mut batch, block);
            }
        }

        self.db.write_batch(batch)?;
        debug!(height = header.height, %hash, is_head, "stored block");
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Option<Block>, StoreError> {
        let Some(header) = self.get_block_header(hash)? else {
            return Ok(None);
        };

        let (transactions, debts) = match self.db.get(&keys::body(hash))? {
            None => (Vec::new(), Vec::new()),
            Some(bytes) => {
                let body = Body::from_bytes(&bytes).map_err(|source| StoreError::Corrupt {
                    context: "block body",
                    source,
                })?;
                (body.transactions, body.debts)
            }
        };

        Ok(Some(Block::new(header, transactions, debts)))
    }

    pub fn put_receipts(&self, hash: Hash, receipts: &[Receipt]) -> Result<(), StoreError> {
        let mut writer = ByteWriter::new();
        encode_seq(receipts, &mut writer);
        self.db.put(&keys::receipts(&hash), &writer.finish())?;
        Ok(())
    }

    pub fn get_receipts(&self, hash: &Hash) -> Result<Option<Vec<Receipt>>, StoreError> {
        match self.db.get(&keys::receipts(hash))? {
            None => Ok(None),
            Some(bytes) => {
                let mut reader = ByteReader::new(&bytes);
                decode_seq(&mut reader)
                    .map(Some)
                    .map_err(|source| StoreError::Corrupt {
                        context: "receipts",
                        source,
                    })
            }
        }
    }

    /// Remove every trace of a block stored by hash: header, body, receipts,
    /// total difficulty and the indices of its content. Canonical pointers
    /// are managed separately. Safe to call for a half-written block.
    pub fn delete_block(&self, hash: &Hash) -> Result<(), StoreError> {
        let mut batch = Batch::new();

        if let Some(block) = self.get_block(hash)? {
            delete_index_ops(&mut batch, &block);
        }

        batch.delete(keys::header(hash));
        batch.delete(keys::body(hash));
        batch.delete(keys::receipts(hash));
        batch.delete(keys::total_difficulty(hash));

        self.db.write_batch(batch)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Transaction / debt index
    // -------------------------------------------------------------------------

    pub fn get_tx_index(&self, tx_hash: &Hash) -> Result<Option<TxIndex>, StoreError> {
        match self.db.get(&keys::tx_index(tx_hash))? {
            None => Ok(None),
            Some(bytes) => TxIndex::from_bytes(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    context: "tx index",
                    source,
                }),
        }
    }

    pub fn get_debt_index(&self, debt_hash: &Hash) -> Result<Option<DebtIndex>, StoreError> {
        match self.db.get(&keys::debt_index(debt_hash))? {
            None => Ok(None),
            Some(bytes) => DebtIndex::from_bytes(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    context: "debt index",
                    source,
                }),
        }
    }

    // -------------------------------------------------------------------------
    // Canonical rewrite
    // -------------------------------------------------------------------------

    /// Remove canonical pointers (and content indices) for every height ≥
    /// `from` that still has one. Each removed height advances the recovery
    /// point so a crash resumes where deletion stopped.
    pub fn delete_larger_height_blocks(
        &self,
        from: u64,
        mut recovery: Option<&mut RecoveryPoint>,
    ) -> Result<(), StoreError> {
        let mut height = from;
        loop {
            let Some(stale_hash) = self.get_block_hash(height)? else {
                break;
            };

            if let Some(block) = self.get_block(&stale_hash)? {
                let mut batch = Batch::new();
                delete_index_ops(&mut batch, &block);
                self.db.write_batch(batch)?;
            }
            self.delete_block_hash(height)?;

            debug!(height, %stale_hash, "removed stale canonical pointer");
            height += 1;

            if let Some(rp) = recovery.as_deref_mut() {
                rp.on_delete_larger_height_blocks(height);
            }
        }
        Ok(())
    }

    /// Walk backwards from `hash` through parent links, pointing each height
    /// at the walked ancestor until the canonical pointer already matches
    /// (the fork point).
    pub fn overwrite_stale_blocks(
        &self,
        hash: Hash,
        mut recovery: Option<&mut RecoveryPoint>,
    ) -> Result<(), StoreError> {
        let mut current = hash;
        while !current.is_empty() {
            let header = self
                .get_block_header(&current)?
                .ok_or(StoreError::HeaderNotFound(current))?;

            if self.get_block_hash(header.height)? == Some(current) {
                break;
            }

            let mut batch = Batch::new();
            if let Some(old_hash) = self.get_block_hash(header.height)? {
                if let Some(old_block) = self.get_block(&old_hash)? {
                    delete_index_ops(&mut batch, &old_block);
                }
            }
            batch.put(keys::canonical(header.height), current.as_bytes().to_vec());
            if let Some(block) = self.get_block(&current)? {
                add_index_ops(&mut batch, &block);
            }
            self.db.write_batch(batch)?;

            debug!(height = header.height, hash = %current, "overwrote canonical pointer");
            current = header.previous_hash;

            if let Some(rp) = recovery.as_deref_mut() {
                rp.on_overwrite_stale_blocks(current);
            }
        }
        Ok(())
    }
}

fn add_index_ops(batch: &mut Batch, block: &Block) {
    let block_hash = block.hash();
    for (index, tx) in block.transactions.iter().enumerate() {
        let entry = TxIndex {
            block_hash,
            index: index as u32,
        };
        batch.put(keys::tx_index(&tx.hash()), entry.to_bytes());
    }
    for (index, debt) in block.debts.iter().enumerate() {
        let entry = DebtIndex {
            block_hash,
            index: index as u32,
        };
        batch.put(keys::debt_index(&debt.hash()), entry.to_bytes());
    }
}

fn delete_index_ops(batch: &mut Batch, block: &Block) {
    for tx in &block.transactions {
        batch.delete(keys::tx_index(&tx.hash()));
    }
    for debt in &block.debts {
        batch.delete(keys::debt_index(&debt.hash()));
    }
}

impl std::fmt::Debug for BlockchainStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStore").finish_non_exhaustive()
    }
}
