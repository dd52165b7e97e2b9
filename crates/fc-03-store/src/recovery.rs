//! Crash recovery for block writes.
//!
//! Before a block write starts, the recovery point records everything needed
//! to either roll the write back or finish the canonical rewrite it was part
//! of. Empty-valued fields encode "nothing to undo". Every step of
//! [`RecoveryPoint::recover`] clears its field and re-persists, so replaying
//! recovery after a crash mid-recovery is safe.

use crate::store::{BlockchainStore, StoreError};
use serde::{Deserialize, Serialize};
use shared_types::Hash;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Persisted write-ahead record for one block write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryPoint {
    /// Hash of the block being written.
    pub writing_block_hash: Hash,
    /// Height of the block being written.
    pub writing_block_height: u64,
    /// Canonical hash previously stored at that height, if any.
    pub previous_canonical_block_hash: Hash,
    /// HEAD hash before the write started.
    pub previous_head_block_hash: Hash,
    /// First height whose canonical pointer still needs deleting.
    pub larger_height: u64,
    /// Next stale branch hash whose canonical pointer still needs rewriting.
    pub stale_hash: Hash,

    #[serde(skip)]
    file: PathBuf,
}

impl RecoveryPoint {
    /// Load the recovery point from `file`, or start empty when the file does
    /// not exist. Unparseable content is discarded and overwritten: a torn
    /// write of the file itself means the guarded block write never started.
    ///
    /// An empty path disables persistence (used by tests).
    pub fn load(file: impl AsRef<Path>) -> Result<Self, StoreError> {
        let file = file.as_ref().to_path_buf();
        let mut rp = RecoveryPoint {
            file: file.clone(),
            ..Default::default()
        };

        if rp.file.as_os_str().is_empty() || !rp.file.exists() {
            return Ok(rp);
        }

        let bytes = std::fs::read(&rp.file).map_err(|source| StoreError::RecoveryIo {
            context: "read",
            source,
        })?;

        match serde_json::from_slice::<RecoveryPoint>(&bytes) {
            Ok(loaded) => {
                rp = RecoveryPoint { file, ..loaded };
            }
            Err(err) => {
                warn!(file = %rp.file.display(), %err, "discarding unparseable recovery point");
                rp.serialize();
            }
        }

        Ok(rp)
    }

    /// Replay whatever the last crash left behind.
    pub fn recover(&mut self, store: &BlockchainStore) -> Result<(), StoreError> {
        let mut write_completed = true;

        if !self.previous_head_block_hash.is_empty() {
            store.put_head_block_hash(self.previous_head_block_hash)?;
            self.previous_head_block_hash = Hash::EMPTY;
            info!("recovered HEAD block hash");
        }

        if self.writing_block_height > 0 && !self.previous_canonical_block_hash.is_empty() {
            store.put_block_hash(self.writing_block_height, self.previous_canonical_block_hash)?;
            self.previous_canonical_block_hash = Hash::EMPTY;
            info!(
                height = self.writing_block_height,
                "recovered canonical pointer"
            );
        }

        if !self.writing_block_hash.is_empty() {
            if let Err(err) = store.delete_block(&self.writing_block_hash) {
                warn!(hash = %self.writing_block_hash, %err, "failed to delete half-written block");
            } else {
                info!(hash = %self.writing_block_hash, "deleted half-written block");
            }
            self.writing_block_hash = Hash::EMPTY;
            write_completed = false;
        }

        // The reorganization tail only resumes when the block write itself
        // had completed; otherwise rolling the write back already restored a
        // consistent chain.
        if write_completed && self.larger_height > 0 {
            let larger_height = self.larger_height;
            if let Err(err) = store.delete_larger_height_blocks(larger_height, Some(self)) {
                warn!(height = larger_height, %err, "failed to finish deleting larger heights");
            }
        }
        self.larger_height = 0;

        if write_completed && !self.stale_hash.is_empty() {
            let stale_hash = self.stale_hash;
            if let Err(err) = store.overwrite_stale_blocks(stale_hash, Some(self)) {
                warn!(hash = %stale_hash, %err, "failed to finish overwriting stale blocks");
            }
        }
        self.stale_hash = Hash::EMPTY;

        Self::serialize(self);
        Ok(())
    }

    /// Record the pre-write chain state; must be called before any bytes of
    /// the block hit storage.
    pub fn on_put_block_start(
        &mut self,
        block_hash: Hash,
        height: u64,
        previous_hash: Hash,
        is_head: bool,
        store: &BlockchainStore,
    ) -> Result<(), StoreError> {
        self.writing_block_hash = block_hash;
        self.writing_block_height = height;

        // The written height may not exist in the canonical chain yet.
        self.previous_canonical_block_hash = store.get_block_hash(height)?.unwrap_or(Hash::EMPTY);

        self.previous_head_block_hash = store
            .get_head_block_hash()?
            .ok_or(StoreError::HeadNotFound)?;

        if is_head {
            self.larger_height = height + 1;
            self.stale_hash = previous_hash;
        } else {
            self.larger_height = 0;
            self.stale_hash = Hash::EMPTY;
        }

        Self::serialize(self);
        Ok(())
    }

    /// Clear the write-in-progress fields once the block write completed.
    pub fn on_put_block_end(&mut self) {
        self.writing_block_hash = Hash::EMPTY;
        self.writing_block_height = 0;
        self.previous_canonical_block_hash = Hash::EMPTY;
        self.previous_head_block_hash = Hash::EMPTY;
        Self::serialize(self);
    }

    /// Advance the resume height while deleting larger canonical heights.
    pub fn on_delete_larger_height_blocks(&mut self, height: u64) {
        self.larger_height = height;
        Self::serialize(self);
    }

    /// Advance the resume hash while overwriting stale canonical pointers.
    pub fn on_overwrite_stale_blocks(&mut self, hash: Hash) {
        self.stale_hash = hash;
        Self::serialize(self);
    }

    /// True when no write is in flight and no rewrite tail remains.
    pub fn is_clear(&self) -> bool {
        self.writing_block_hash.is_empty()
            && self.previous_canonical_block_hash.is_empty()
            && self.previous_head_block_hash.is_empty()
            && self.larger_height == 0
            && self.stale_hash.is_empty()
    }

    /// Persist to the configured file, atomically (write temp, rename).
    /// Failures are logged, not raised: an unwritable recovery point must not
    /// block chain initialization.
    pub fn serialize(&self) {
        if self.file.as_os_str().is_empty() {
            return;
        }

        let encoded = match serde_json::to_vec_pretty(self) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(%err, "failed to encode recovery point");
                return;
            }
        };

        let temp = self.file.with_extension("tmp");
        let result = std::fs::write(&temp, &encoded)
            .and_then(|_| std::fs::rename(&temp, &self.file));
        if let Err(err) = result {
            warn!(file = %self.file.display(), %err, "failed to write recovery point file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use shared_types::{Block, BlockHeader, U256};
    use std::sync::Arc;

    fn test_store() -> BlockchainStore {
        BlockchainStore::new(Arc::new(MemoryStore::new()))
    }

    fn block_at(height: u64, parent: Hash, seed: u8) -> Block {
        Block::new(
            BlockHeader {
                previous_hash: parent,
                height,
                difficulty: U256::from(2u64),
                timestamp: U256::from(height * 10 + seed as u64),
                ..Default::default()
            },
            vec![],
            vec![],
        )
    }

    #[test]
    fn load_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let rp = RecoveryPoint::load(dir.path().join("recoveryPoint.json")).unwrap();
        assert!(rp.is_clear());
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recoveryPoint.json");

        let mut rp = RecoveryPoint::load(&path).unwrap();
        rp.writing_block_hash = Hash::of(b"block");
        rp.writing_block_height = 9;
        rp.larger_height = 10;
        rp.serialize();

        let reloaded = RecoveryPoint::load(&path).unwrap();
        assert_eq!(reloaded.writing_block_hash, Hash::of(b"block"));
        assert_eq!(reloaded.writing_block_height, 9);
        assert_eq!(reloaded.larger_height, 10);
    }

    #[test]
    fn unparseable_file_is_discarded_and_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recoveryPoint.json");
        std::fs::write(&path, b"{not json").unwrap();

        let rp = RecoveryPoint::load(&path).unwrap();
        assert!(rp.is_clear());

        // The file was rewritten with valid content.
        let reloaded = RecoveryPoint::load(&path).unwrap();
        assert!(reloaded.is_clear());
    }

    #[test]
    fn recover_rolls_back_half_written_block() {
        let store = test_store();

        let genesis = block_at(0, Hash::EMPTY, 0);
        store.put_block(&genesis, U256::one(), true).unwrap();
        let a1 = block_at(1, genesis.hash(), 1);
        store.put_block(&a1, U256::from(3u64), true).unwrap();

        // Simulate: b1 write started (recovery point persisted), the block
        // record and the canonical pointer landed, but HEAD did not move.
        let b1 = block_at(1, genesis.hash(), 2);
        let mut rp = RecoveryPoint::default();
        rp.on_put_block_start(b1.hash(), 1, genesis.hash(), true, &store)
            .unwrap();
        store.put_block(&b1, U256::from(4u64), false).unwrap();
        store.put_block_hash(1, b1.hash()).unwrap();

        rp.recover(&store).unwrap();

        // Pre-write state is restored exactly.
        assert_eq!(store.get_head_block_hash().unwrap(), Some(a1.hash()));
        assert_eq!(store.get_block_hash(1).unwrap(), Some(a1.hash()));
        assert!(store.get_block_header(&b1.hash()).unwrap().is_none());
        assert!(rp.is_clear());
    }

    #[test]
    fn recover_is_idempotent() {
        let store = test_store();
        let genesis = block_at(0, Hash::EMPTY, 0);
        store.put_block(&genesis, U256::one(), true).unwrap();

        let b1 = block_at(1, genesis.hash(), 1);
        let mut rp = RecoveryPoint::default();
        rp.on_put_block_start(b1.hash(), 1, genesis.hash(), true, &store)
            .unwrap();
        store.put_block(&b1, U256::from(3u64), false).unwrap();

        rp.recover(&store).unwrap();
        let head_after_first = store.get_head_block_hash().unwrap();
        rp.recover(&store).unwrap();

        assert_eq!(store.get_head_block_hash().unwrap(), head_after_first);
        assert!(rp.is_clear());
    }

    #[test]
    fn recover_resumes_reorganization_tail_after_completed_write() {
        let store = test_store();

        // Canonical: g <- a1 <- a2, HEAD = a2.
        let genesis = block_at(0, Hash::EMPTY, 0);
        store.put_block(&genesis, U256::one(), true).unwrap();
        let a1 = block_at(1, genesis.hash(), 1);
        let a2 = block_at(2, a1.hash(), 2);
        store.put_block(&a1, U256::from(3u64), true).unwrap();
        store.put_block(&a2, U256::from(5u64), true).unwrap();

        // Fork b1 <- b2 with more total difficulty; the b2 head write fully
        // completed (recovery fields for the write cleared) but the crash hit
        // before the stale rewrite ran.
        let b1 = block_at(1, genesis.hash(), 11);
        let b2 = block_at(2, b1.hash(), 12);
        store.put_block(&b1, U256::from(4u64), false).unwrap();
        store.put_block(&b2, U256::from(7u64), true).unwrap();

        let mut rp = RecoveryPoint {
            larger_height: 3,
            stale_hash: b1.hash(),
            ..Default::default()
        };
        rp.recover(&store).unwrap();

        assert_eq!(store.get_head_block_hash().unwrap(), Some(b2.hash()));
        assert_eq!(store.get_block_hash(1).unwrap(), Some(b1.hash()));
        assert_eq!(store.get_block_hash(2).unwrap(), Some(b2.hash()));
        assert!(rp.is_clear());
    }
}
