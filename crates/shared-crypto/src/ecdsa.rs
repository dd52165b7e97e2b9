//! Recoverable ECDSA over secp256k1.
//!
//! Signatures are 65 bytes: `r || s || v` with `v` the recovery id. Signing
//! uses RFC 6979 deterministic nonces, so identical (key, digest) pairs
//! produce identical signatures.

use crate::CryptoError;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;

/// Length of a recoverable signature in bytes.
pub const SIGNATURE_LEN: usize = 65;

/// A secp256k1 keypair.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    /// Build a keypair from raw secret scalar bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let signing_key =
            SigningKey::from_bytes(bytes.into()).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self { signing_key })
    }

    /// Sign a 32-byte digest, returning the 65-byte recoverable signature.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<[u8; SIGNATURE_LEN], CryptoError> {
        sign_recoverable(&self.signing_key, digest)
    }

    /// Uncompressed public key bytes without the SEC1 tag (64 bytes).
    pub fn public_key_bytes(&self) -> [u8; 64] {
        encode_public_key(self.signing_key.verifying_key())
    }

    /// Raw secret scalar bytes.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }
}

/// Sign a prehashed digest with the given key.
pub fn sign_recoverable(
    key: &SigningKey,
    digest: &[u8; 32],
) -> Result<[u8; SIGNATURE_LEN], CryptoError> {
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(digest)
        .map_err(|_| CryptoError::InvalidPrivateKey)?;

    let mut out = [0u8; SIGNATURE_LEN];
    out[..64].copy_from_slice(&signature.to_bytes());
    out[64] = recovery_id.to_byte();
    Ok(out)
}

/// Recover the signer's uncompressed public key (64 bytes, tag stripped)
/// from a digest and a 65-byte recoverable signature.
pub fn recover_public_key(
    digest: &[u8; 32],
    signature: &[u8],
) -> Result<[u8; 64], CryptoError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignature);
    }

    let sig =
        Signature::from_slice(&signature[..64]).map_err(|_| CryptoError::InvalidSignature)?;
    let recovery_id =
        RecoveryId::from_byte(signature[64]).ok_or(CryptoError::InvalidSignature)?;

    let verifying_key = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id)
        .map_err(|_| CryptoError::RecoveryFailed)?;

    Ok(encode_public_key(&verifying_key))
}

fn encode_public_key(key: &VerifyingKey) -> [u8; 64] {
    let point = key.to_encoded_point(false);
    let mut out = [0u8; 64];
    // SEC1 uncompressed encoding is 0x04 || x || y.
    out.copy_from_slice(&point.as_bytes()[1..65]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keccak256;

    #[test]
    fn sign_and_recover() {
        let keypair = KeyPair::generate();
        let digest = keccak256(b"payload");

        let signature = keypair.sign_digest(&digest).unwrap();
        let recovered = recover_public_key(&digest, &signature).unwrap();

        assert_eq!(recovered, keypair.public_key_bytes());
    }

    #[test]
    fn deterministic_signatures() {
        let keypair = KeyPair::from_secret_bytes(&[0xAB; 32]).unwrap();
        let digest = keccak256(b"same input");

        let first = keypair.sign_digest(&digest).unwrap();
        let second = keypair.sign_digest(&digest).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn wrong_digest_recovers_different_key() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign_digest(&keccak256(b"one")).unwrap();

        let recovered = recover_public_key(&keccak256(b"two"), &signature);
        match recovered {
            Ok(key) => assert_ne!(key, keypair.public_key_bytes()),
            Err(CryptoError::RecoveryFailed) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_short_signature() {
        let err = recover_public_key(&[0u8; 32], &[0u8; 10]).unwrap_err();
        assert_eq!(err, CryptoError::InvalidSignature);
    }

    #[test]
    fn secret_roundtrip() {
        let original = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(&original.secret_bytes()).unwrap();
        assert_eq!(original.public_key_bytes(), restored.public_key_bytes());
    }
}
