//! Engine error kinds.

use shared_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IbftError {
    /// Message view is ahead of the current view; backlog it.
    #[error("future message")]
    FutureMessage,

    /// Message view is behind the current view; drop it.
    #[error("old message")]
    OldMessage,

    /// Structurally broken message.
    #[error("invalid message")]
    InvalidMessage,

    /// Signer is not in the validator set in effect.
    #[error("unauthorized address")]
    UnauthorizedAddress,

    /// The sender of a preprepare is not this round's proposer.
    #[error("message was not sent by the proposer")]
    NotFromProposer,

    /// Proposal digest does not match the locked/current proposal.
    #[error("subject digest does not match the current proposal")]
    InconsistentSubject,

    /// Engine asked to handle traffic while stopped.
    #[error("engine is stopped")]
    EngineStopped,

    #[error("signature failure")]
    Crypto(#[from] CryptoError),

    #[error("malformed payload")]
    Codec(#[from] shared_types::CodecError),

    /// The header's extra field is not a valid consensus extra.
    #[error("invalid istanbul extra data")]
    InvalidExtra,

    /// A vote witness carries neither sentinel.
    #[error("invalid vote witness")]
    InvalidVote,

    /// Snapshot persistence failed.
    #[error("snapshot store failure")]
    SnapshotStore(#[from] fc_03_store::StoreError),

    /// Snapshot json failure.
    #[error("snapshot encoding failure")]
    SnapshotEncoding(#[from] serde_json::Error),

    /// Missing ancestry while rebuilding a snapshot.
    #[error("unknown ancestor header at height {0}")]
    UnknownAncestor(u64),

    /// Proposal failed backend validation.
    #[error("proposal rejected: {0}")]
    ProposalRejected(String),
}
