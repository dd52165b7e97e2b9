//! # Istanbul BFT
//!
//! Proposer-based three-phase Byzantine agreement over blocks:
//! `AcceptRequest → Preprepared → Prepared → Committed`, with per-source
//! backlogs for future-view messages, exponential round-change timeouts, and
//! header-embedded validator voting replayed through [`Snapshot`]s.
//!
//! The [`core::Core`] state machine is strictly single-threaded; the
//! [`core::Controller`] wraps it in one event-loop thread fed by network
//! messages, chain-head notifications and the round timer.

pub mod backlog;
pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod extra;
pub mod message;
pub mod snapshot;
pub mod validator;

pub use config::{IbftConfig, ProposerPolicy};
pub use engine::IbftEngine;
pub use errors::IbftError;
pub use extra::{IstanbulExtra, NONCE_AUTH_VOTE, NONCE_DROP_VOTE, VANITY_SIZE};
pub use message::{Message, MsgCode, Payload, Preprepare, Subject, View};
pub use snapshot::{Snapshot, Tally, Vote};
pub use validator::ValidatorSet;
