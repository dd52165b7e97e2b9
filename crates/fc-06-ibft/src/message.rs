//! Consensus messages.
//!
//! Payloads are decoded eagerly when a message is built or parsed, so the
//! rest of the engine works on typed values rather than raw bytes.

use crate::errors::IbftError;
use crate::validator::ValidatorSet;
use shared_crypto::{keccak256, recover_public_key, KeyPair};
use shared_types::codec::{ByteReader, ByteWriter, CanonicalDecode, CanonicalEncode, CodecError};
use shared_types::{Address, Block, Hash};
use std::cmp::Ordering;

/// Message codes, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgCode {
    Preprepare = 0,
    Prepare = 1,
    Commit = 2,
    RoundChange = 3,
}

impl MsgCode {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(MsgCode::Preprepare),
            1 => Ok(MsgCode::Prepare),
            2 => Ok(MsgCode::Commit),
            3 => Ok(MsgCode::RoundChange),
            tag => Err(CodecError::InvalidTag {
                tag,
                type_name: "MsgCode",
            }),
        }
    }
}

/// A consensus position: `(sequence, round)`, ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct View {
    pub sequence: u64,
    pub round: u64,
}

impl View {
    pub fn new(sequence: u64, round: u64) -> Self {
        Self { sequence, round }
    }
}

impl Ord for View {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then(self.round.cmp(&other.round))
    }
}

impl PartialOrd for View {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl CanonicalEncode for View {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_u64(self.sequence);
        writer.write_u64(self.round);
    }
}

impl CanonicalDecode for View {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(View {
            sequence: reader.read_u64()?,
            round: reader.read_u64()?,
        })
    }
}

/// The proposer's opening message: a full proposal for a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preprepare {
    pub view: View,
    pub proposal: Block,
}

impl CanonicalEncode for Preprepare {
    fn encode(&self, writer: &mut ByteWriter) {
        self.view.encode(writer);
        self.proposal.encode(writer);
    }
}

impl CanonicalDecode for Preprepare {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Preprepare {
            view: View::decode(reader)?,
            proposal: Block::decode(reader)?,
        })
    }
}

/// Agreement payload for prepare / commit / round-change: a view plus the
/// digest being agreed on (empty for round changes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subject {
    pub view: View,
    pub digest: Hash,
}

impl CanonicalEncode for Subject {
    fn encode(&self, writer: &mut ByteWriter) {
        self.view.encode(writer);
        self.digest.encode(writer);
    }
}

impl CanonicalDecode for Subject {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Subject {
            view: View::decode(reader)?,
            digest: Hash::decode(reader)?,
        })
    }
}

/// Typed message payload; which variant is legal follows from the code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Preprepare(Preprepare),
    Subject(Subject),
}

impl Payload {
    pub fn view(&self) -> View {
        match self {
            Payload::Preprepare(preprepare) => preprepare.view,
            Payload::Subject(subject) => subject.view,
        }
    }

    pub fn subject(&self) -> Option<&Subject> {
        match self {
            Payload::Subject(subject) => Some(subject),
            Payload::Preprepare(_) => None,
        }
    }
}

/// A signed consensus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: MsgCode,
    pub payload: Payload,
    pub address: Address,
    pub signature: Vec<u8>,
    /// Piggybacked committed seal; only on COMMIT messages.
    pub committed_seal: Vec<u8>,
}

impl Message {
    /// Build and sign a message with the sender's key.
    pub fn signed(
        code: MsgCode,
        payload: Payload,
        address: Address,
        keypair: &KeyPair,
        committed_seal: Vec<u8>,
    ) -> Result<Self, IbftError> {
        let mut message = Message {
            code,
            payload,
            address,
            signature: Vec::new(),
            committed_seal,
        };
        let digest = message.signing_digest();
        message.signature = keypair.sign_digest(&digest)?.to_vec();
        Ok(message)
    }

    /// Digest covered by the sender signature: everything but the signature.
    fn signing_digest(&self) -> [u8; 32] {
        let mut writer = ByteWriter::new();
        writer.write_u8(self.code as u8);
        match &self.payload {
            Payload::Preprepare(preprepare) => preprepare.encode(&mut writer),
            Payload::Subject(subject) => subject.encode(&mut writer),
        }
        self.address.encode(&mut writer);
        writer.write_bytes(&self.committed_seal);
        keccak256(&writer.finish())
    }

    /// Verify the signature and membership: the recovered signer must equal
    /// the claimed address and sit in `validators`.
    pub fn verify(&self, validators: &ValidatorSet) -> Result<Address, IbftError> {
        let digest = self.signing_digest();
        let public_key = recover_public_key(&digest, &self.signature)?;
        let signer = Address::from_public_key(&public_key, self.address.shard());
        if signer != self.address {
            return Err(IbftError::InvalidMessage);
        }
        if !validators.contains(&signer) {
            return Err(IbftError::UnauthorizedAddress);
        }
        Ok(signer)
    }

    pub fn view(&self) -> View {
        self.payload.view()
    }
}

impl CanonicalEncode for Message {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_u8(self.code as u8);
        match &self.payload {
            Payload::Preprepare(preprepare) => preprepare.encode(writer),
            Payload::Subject(subject) => subject.encode(writer),
        }
        self.address.encode(writer);
        writer.write_bytes(&self.signature);
        writer.write_bytes(&self.committed_seal);
    }
}

impl CanonicalDecode for Message {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let code = MsgCode::from_u8(reader.read_u8()?)?;
        let payload = match code {
            MsgCode::Preprepare => Payload::Preprepare(Preprepare::decode(reader)?),
            _ => Payload::Subject(Subject::decode(reader)?),
        };
        Ok(Message {
            code,
            payload,
            address: Address::decode(reader)?,
            signature: reader.read_bytes()?,
            committed_seal: reader.read_bytes()?,
        })
    }
}
