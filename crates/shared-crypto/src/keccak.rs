//! Keccak-256 (the pre-NIST padding variant used by the chain).

use sha3::{Digest, Keccak256};

/// Hash a single byte slice.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash the concatenation of several byte slices without materializing it.
pub fn keccak256_many(inputs: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for input in inputs {
        hasher.update(input);
    }
    hasher.finalize().into()
}
