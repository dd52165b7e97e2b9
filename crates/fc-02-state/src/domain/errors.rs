//! State database errors.

use fc_03_store::KvError;
use shared_types::{CodecError, Hash};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("key-value backend failure")]
    Kv(#[from] KvError),

    /// A node referenced by the trie is not present in memory or storage.
    #[error("missing trie node {0}")]
    MissingNode(Hash),

    #[error("corrupt trie node {hash}")]
    CorruptNode {
        hash: Hash,
        #[source]
        source: CodecError,
    },

    #[error("corrupt account record for trie value")]
    CorruptAccount(#[source] CodecError),

    /// `revert_to_snapshot` with an id newer than the journal.
    #[error("invalid snapshot id {0}")]
    InvalidSnapshot(usize),
}
