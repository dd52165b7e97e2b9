//! # Shared Cryptography
//!
//! Keccak-256 hashing and recoverable secp256k1 ECDSA used across all
//! subsystems. Consensus code never touches curve internals directly; it goes
//! through the helpers here so the digest and recovery conventions stay in
//! one place.

pub mod ecdsa;
pub mod keccak;

pub use ecdsa::{recover_public_key, sign_recoverable, KeyPair, SIGNATURE_LEN};
pub use keccak::{keccak256, keccak256_many};

use thiserror::Error;

/// Errors produced by the cryptographic helpers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Private key bytes do not form a valid scalar.
    #[error("invalid private key")]
    InvalidPrivateKey,

    /// Signature bytes are malformed or off-curve.
    #[error("invalid signature")]
    InvalidSignature,

    /// Public key recovery failed for the given digest/signature pair.
    #[error("signature recovery failed")]
    RecoveryFailed,
}
