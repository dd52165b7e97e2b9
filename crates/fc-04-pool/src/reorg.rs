//! Fork-point discovery for pool reinjection.

use fc_03_store::{BlockchainStore, StoreError};
use shared_types::{Block, Hash};

/// Blocks on either side of a head move: `detached` left the canonical chain
/// (old branch, tip first), `attached` joined it (new branch, tip first).
#[derive(Debug, Default)]
pub struct ForkDiff {
    pub detached: Vec<Block>,
    pub attached: Vec<Block>,
}

/// Walk both branches back to their common ancestor.
pub fn fork_diff(
    store: &BlockchainStore,
    new_head: Hash,
    old_head: Hash,
) -> Result<ForkDiff, StoreError> {
    let mut diff = ForkDiff::default();
    if new_head == old_head {
        return Ok(diff);
    }

    let mut old_cursor = old_head;
    let mut new_cursor = new_head;
    let mut old_header = load_header(store, old_cursor)?;
    let mut new_header = load_header(store, new_cursor)?;

    while old_header.height > new_header.height {
        push_block(store, &mut diff.detached, old_cursor)?;
        old_cursor = old_header.previous_hash;
        old_header = load_header(store, old_cursor)?;
    }
    while new_header.height > old_header.height {
        push_block(store, &mut diff.attached, new_cursor)?;
        new_cursor = new_header.previous_hash;
        new_header = load_header(store, new_cursor)?;
    }

    while old_cursor != new_cursor {
        push_block(store, &mut diff.detached, old_cursor)?;
        push_block(store, &mut diff.attached, new_cursor)?;
        old_cursor = old_header.previous_hash;
        new_cursor = new_header.previous_hash;
        if old_cursor.is_empty() || new_cursor.is_empty() {
            break;
        }
        old_header = load_header(store, old_cursor)?;
        new_header = load_header(store, new_cursor)?;
    }

    Ok(diff)
}

fn load_header(
    store: &BlockchainStore,
    hash: Hash,
) -> Result<shared_types::BlockHeader, StoreError> {
    store
        .get_block_header(&hash)?
        .ok_or(StoreError::HeaderNotFound(hash))
}

fn push_block(
    store: &BlockchainStore,
    out: &mut Vec<Block>,
    hash: Hash,
) -> Result<(), StoreError> {
    let block = store
        .get_block(&hash)?
        .ok_or(StoreError::HeaderNotFound(hash))?;
    out.push(block);
    Ok(())
}
