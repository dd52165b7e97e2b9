//! The Istanbul header extra field and seal digests.
//!
//! Layout: 32 vanity bytes followed by the canonical encoding of
//! `{validators, seal, committed_seals}`. The proposer seal signs the header
//! with `seal` and `committed_seals` cleared; committed seals sign
//! `keccak(proposal_hash ‖ COMMIT_CODE)`.

use crate::errors::IbftError;
use crate::message::MsgCode;
use shared_crypto::{keccak256, keccak256_many, recover_public_key};
use shared_types::codec::{decode_seq, encode_seq, ByteReader, ByteWriter, CodecError};
use shared_types::{Address, BlockHeader, CanonicalDecode, CanonicalEncode, Hash, WITNESS_SIZE};

/// Zero-padding ahead of the structured extra payload.
pub const VANITY_SIZE: usize = 32;

/// Witness sentinel casting an authorization vote.
pub const NONCE_AUTH_VOTE: [u8; WITNESS_SIZE] = [0xFF; WITNESS_SIZE];

/// Witness sentinel casting a drop vote.
pub const NONCE_DROP_VOTE: [u8; WITNESS_SIZE] = [0x00; WITNESS_SIZE];

/// Structured consensus data carried in a header's extra field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IstanbulExtra {
    pub validators: Vec<Address>,
    pub seal: Vec<u8>,
    pub committed_seals: Vec<Vec<u8>>,
}

struct SealBytes<'a>(&'a [u8]);

impl CanonicalEncode for SealBytes<'_> {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_bytes(self.0);
    }
}

impl IstanbulExtra {
    pub fn encode_with_vanity(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write_raw(&[0u8; VANITY_SIZE]);
        encode_seq(&self.validators, &mut writer);
        writer.write_bytes(&self.seal);
        let seals: Vec<SealBytes<'_>> = self.committed_seals.iter().map(|s| SealBytes(s)).collect();
        encode_seq(&seals, &mut writer);
        writer.finish()
    }

    pub fn decode_from(extra: &[u8]) -> Result<Self, IbftError> {
        if extra.len() < VANITY_SIZE {
            return Err(IbftError::InvalidExtra);
        }
        let mut reader = ByteReader::new(&extra[VANITY_SIZE..]);
        let validators = decode_seq::<Address>(&mut reader)?;
        let seal = reader.read_bytes()?;
        let count = reader.read_u32()? as usize;
        let mut committed_seals = Vec::with_capacity(count.min(reader.remaining()));
        for _ in 0..count {
            committed_seals.push(reader.read_bytes()?);
        }
        if reader.remaining() != 0 {
            return Err(IbftError::Codec(CodecError::TrailingBytes(
                reader.remaining(),
            )));
        }
        Ok(IstanbulExtra {
            validators,
            seal,
            committed_seals,
        })
    }
}

/// Write the initial extra (validator list, no seals yet) into a header.
pub fn prepare_extra(header: &mut BlockHeader, validators: Vec<Address>) {
    header.extra = IstanbulExtra {
        validators,
        seal: Vec::new(),
        committed_seals: Vec::new(),
    }
    .encode_with_vanity();
}

/// Digest the proposer signs: the header with both seal fields cleared.
pub fn seal_digest(header: &BlockHeader) -> Result<[u8; 32], IbftError> {
    let mut cleared = header.clone();
    let mut extra = IstanbulExtra::decode_from(&header.extra)?;
    extra.seal = Vec::new();
    extra.committed_seals = Vec::new();
    cleared.extra = extra.encode_with_vanity();
    Ok(keccak256(&cleared.to_canonical_bytes()))
}

/// Store the proposer seal in the header extra.
pub fn write_seal(header: &mut BlockHeader, seal: Vec<u8>) -> Result<(), IbftError> {
    let mut extra = IstanbulExtra::decode_from(&header.extra)?;
    extra.seal = seal;
    header.extra = extra.encode_with_vanity();
    Ok(())
}

/// Store the committed seals gathered during the commit phase.
pub fn write_committed_seals(
    header: &mut BlockHeader,
    committed_seals: Vec<Vec<u8>>,
) -> Result<(), IbftError> {
    let mut extra = IstanbulExtra::decode_from(&header.extra)?;
    extra.committed_seals = committed_seals;
    header.extra = extra.encode_with_vanity();
    Ok(())
}

/// Recover the proposer address from the extra seal.
pub fn recover_sealer(header: &BlockHeader, shard: u8) -> Result<Address, IbftError> {
    let extra = IstanbulExtra::decode_from(&header.extra)?;
    let digest = seal_digest(header)?;
    let public_key = recover_public_key(&digest, &extra.seal)?;
    Ok(Address::from_public_key(&public_key, shard))
}

/// Digest a validator signs when committing to `proposal_hash`.
pub fn committed_seal_digest(proposal_hash: &Hash) -> [u8; 32] {
    keccak256_many(&[proposal_hash.as_bytes(), &[MsgCode::Commit as u8]])
}

/// Classify a vote witness; anything but the two sentinels is invalid.
pub fn vote_of_witness(witness: &[u8]) -> Result<bool, IbftError> {
    if witness == NONCE_AUTH_VOTE {
        Ok(true)
    } else if witness == NONCE_DROP_VOTE {
        Ok(false)
    } else {
        Err(IbftError::InvalidVote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_crypto::KeyPair;

    fn addr(tail: u8) -> Address {
        Address([tail; 20])
    }

    #[test]
    fn extra_round_trip() {
        let extra = IstanbulExtra {
            validators: vec![addr(1), addr(2)],
            seal: vec![7; 65],
            committed_seals: vec![vec![8; 65], vec![9; 65]],
        };
        let encoded = extra.encode_with_vanity();
        assert_eq!(&encoded[..VANITY_SIZE], &[0u8; VANITY_SIZE]);
        assert_eq!(IstanbulExtra::decode_from(&encoded).unwrap(), extra);
    }

    #[test]
    fn too_short_extra_is_invalid() {
        assert!(matches!(
            IstanbulExtra::decode_from(&[0u8; 10]),
            Err(IbftError::InvalidExtra)
        ));
    }

    #[test]
    fn seal_round_trip_recovers_signer() {
        let keypair = KeyPair::generate();
        let signer = Address::from_public_key(&keypair.public_key_bytes(), 1);

        let mut header = BlockHeader {
            height: 5,
            witness: NONCE_DROP_VOTE.to_vec(),
            ..Default::default()
        };
        prepare_extra(&mut header, vec![addr(1), addr(2)]);

        let digest = seal_digest(&header).unwrap();
        let seal = keypair.sign_digest(&digest).unwrap().to_vec();
        write_seal(&mut header, seal).unwrap();

        assert_eq!(recover_sealer(&header, 1).unwrap(), signer);
    }

    #[test]
    fn seal_digest_ignores_existing_seals() {
        let mut header = BlockHeader::default();
        prepare_extra(&mut header, vec![addr(1)]);
        let before = seal_digest(&header).unwrap();

        write_seal(&mut header, vec![1; 65]).unwrap();
        write_committed_seals(&mut header, vec![vec![2; 65]]).unwrap();
        assert_eq!(seal_digest(&header).unwrap(), before);
    }

    #[test]
    fn vote_sentinels() {
        assert_eq!(vote_of_witness(&NONCE_AUTH_VOTE).unwrap(), true);
        assert_eq!(vote_of_witness(&NONCE_DROP_VOTE).unwrap(), false);
        assert!(vote_of_witness(&[1, 2, 3]).is_err());
    }
}
