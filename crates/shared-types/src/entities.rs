//! Core chain entities and their canonical encodings.
//!
//! Header fields encode in a fixed order (see [`BlockHeader::encode`]) so
//! header hashes are reproducible across implementations.

use crate::codec::{
    decode_seq, encode_seq, ByteReader, ByteWriter, CanonicalDecode, CanonicalEncode, CodecError,
};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use shared_crypto::{keccak256, recover_public_key, CryptoError, KeyPair, SIGNATURE_LEN};
use std::fmt;
use thiserror::Error;

/// Number of shards the address space is partitioned into.
pub const SHARD_COUNT: u8 = 4;

/// Shard number reserved for "not assigned".
pub const UNDEFINED_SHARD: u8 = 0;

/// Size of the header witness field in bytes (PoW nonce text fits, IBFT vote
/// sentinels are exactly this wide).
pub const WITNESS_SIZE: usize = 8;

/// Fixed per-debt budget used when packing debts into a block.
pub const DEBT_SIZE: usize = 118;

/// A 32-byte Keccak-256 digest.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The all-zero sentinel meaning "no hash".
    pub const EMPTY: Hash = Hash([0u8; 32]);

    /// Hash arbitrary bytes.
    pub fn of(data: &[u8]) -> Self {
        Hash(keccak256(data))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = slice.try_into().ok()?;
        Some(Hash(bytes))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash(0x{})", hex::encode(&self.0[..8]))
    }
}

impl CanonicalEncode for Hash {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_raw(&self.0);
    }
}

impl CanonicalDecode for Hash {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let bytes = reader.read_raw(32)?;
        Ok(Hash(bytes.try_into().unwrap()))
    }
}

/// Errors from parsing the textual address form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    #[error("address text must be <shard>S<40 hex chars>, got {0} chars")]
    BadLength(usize),

    #[error("missing 'S' shard separator")]
    MissingSeparator,

    #[error("shard digit {0} out of range 1..={SHARD_COUNT}")]
    BadShard(char),

    #[error("invalid hex payload")]
    BadHex,

    #[error("shard digit {text} does not match encoded shard {encoded}")]
    ShardMismatch { text: u8, encoded: u8 },
}

/// A 20-byte account address. The upper nibble of the first byte carries the
/// shard index.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The all-zero sentinel, used as the reward-transaction sender.
    pub const EMPTY: Address = Address([0u8; 20]);

    /// Shard index encoded in the upper nibble.
    pub fn shard(&self) -> u8 {
        self.0[0] >> 4
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 20] = slice.try_into().ok()?;
        Some(Address(bytes))
    }

    /// Derive an address from an uncompressed public key (64 bytes, tag
    /// stripped) and pin it to the given shard.
    pub fn from_public_key(public_key: &[u8; 64], shard: u8) -> Self {
        let digest = keccak256(public_key);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[12..32]);
        bytes[0] = (shard << 4) | (bytes[0] & 0x0F);
        Address(bytes)
    }

    /// Render the `<shard>S<hex20>` text form.
    pub fn to_text(&self) -> String {
        format!("{}S{}", self.shard(), hex::encode(self.0))
    }

    /// Parse the `<shard>S<hex20>` text form, checking the shard digit
    /// against the encoded nibble.
    pub fn from_text(text: &str) -> Result<Self, AddressParseError> {
        let bytes = text.as_bytes();
        if bytes.len() != 42 {
            return Err(AddressParseError::BadLength(bytes.len()));
        }
        if bytes[1] != b'S' {
            return Err(AddressParseError::MissingSeparator);
        }

        let shard_char = bytes[0] as char;
        let shard = shard_char
            .to_digit(10)
            .filter(|d| (1..=SHARD_COUNT as u32).contains(d))
            .ok_or(AddressParseError::BadShard(shard_char))? as u8;

        let payload = hex::decode(&text[2..]).map_err(|_| AddressParseError::BadHex)?;
        let address = Address::from_slice(&payload).ok_or(AddressParseError::BadHex)?;

        if address.shard() != shard {
            return Err(AddressParseError::ShardMismatch {
                text: shard,
                encoded: address.shard(),
            });
        }

        Ok(address)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_text())
    }
}

impl CanonicalEncode for Address {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_raw(&self.0);
    }
}

impl CanonicalDecode for Address {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let bytes = reader.read_raw(20)?;
        Ok(Address(bytes.try_into().unwrap()))
    }
}

/// Which engine sealed a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConsensusType {
    /// Matrix-determinant proof of work.
    #[default]
    Pow,
    /// Istanbul BFT.
    Istanbul,
}

impl CanonicalEncode for ConsensusType {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_u8(match self {
            ConsensusType::Pow => 0,
            ConsensusType::Istanbul => 1,
        });
    }
}

impl CanonicalDecode for ConsensusType {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        match reader.read_u8()? {
            0 => Ok(ConsensusType::Pow),
            1 => Ok(ConsensusType::Istanbul),
            tag => Err(CodecError::InvalidTag {
                tag,
                type_name: "ConsensusType",
            }),
        }
    }
}

/// Block header. The canonical encoding order below is protocol: changing it
/// changes every header hash.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockHeader {
    pub previous_hash: Hash,
    pub creator: Address,
    pub state_root: Hash,
    pub tx_root: Hash,
    pub receipt_root: Hash,
    pub debt_root: Hash,
    pub difficulty: U256,
    pub height: u64,
    pub timestamp: U256,
    pub witness: Vec<u8>,
    pub extra: Vec<u8>,
    pub consensus: ConsensusType,
}

impl BlockHeader {
    /// Canonical header hash.
    pub fn hash(&self) -> Hash {
        Hash::of(&self.to_canonical_bytes())
    }
}

impl CanonicalEncode for BlockHeader {
    fn encode(&self, writer: &mut ByteWriter) {
        self.previous_hash.encode(writer);
        self.creator.encode(writer);
        self.state_root.encode(writer);
        self.tx_root.encode(writer);
        self.receipt_root.encode(writer);
        self.debt_root.encode(writer);
        writer.write_u256(&self.difficulty);
        writer.write_u64(self.height);
        writer.write_u256(&self.timestamp);
        writer.write_bytes(&self.witness);
        writer.write_bytes(&self.extra);
        self.consensus.encode(writer);
    }
}

impl CanonicalDecode for BlockHeader {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(BlockHeader {
            previous_hash: Hash::decode(reader)?,
            creator: Address::decode(reader)?,
            state_root: Hash::decode(reader)?,
            tx_root: Hash::decode(reader)?,
            receipt_root: Hash::decode(reader)?,
            debt_root: Hash::decode(reader)?,
            difficulty: reader.read_u256()?,
            height: reader.read_u64()?,
            timestamp: reader.read_u256()?,
            witness: reader.read_bytes()?,
            extra: reader.read_bytes()?,
            consensus: ConsensusType::decode(reader)?,
        })
    }
}

/// A value transfer, optionally crossing shards.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub price: U256,
    pub gas_limit: u64,
    pub nonce: u64,
    pub payload: Vec<u8>,
    pub timestamp: u64,
    #[serde_as(as = "Bytes")]
    pub signature: [u8; SIGNATURE_LEN],
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction {
            from: Address::EMPTY,
            to: Address::EMPTY,
            amount: U256::zero(),
            price: U256::zero(),
            gas_limit: 0,
            nonce: 0,
            payload: Vec::new(),
            timestamp: 0,
            signature: [0u8; SIGNATURE_LEN],
        }
    }
}

impl Transaction {
    /// Transaction identity: hash of the unsigned fields.
    pub fn hash(&self) -> Hash {
        Hash(keccak256(&self.unsigned_bytes()))
    }

    fn unsigned_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        self.from.encode(&mut writer);
        self.to.encode(&mut writer);
        writer.write_u256(&self.amount);
        writer.write_u256(&self.price);
        writer.write_u64(self.gas_limit);
        writer.write_u64(self.nonce);
        writer.write_bytes(&self.payload);
        writer.write_u64(self.timestamp);
        writer.finish()
    }

    /// Sign in place with the sender's key.
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<(), CryptoError> {
        let digest = self.hash();
        self.signature = keypair.sign_digest(digest.as_bytes())?;
        Ok(())
    }

    /// Recover the signer and require it to match `from` (in `from`'s shard).
    pub fn verify_signature(&self) -> Result<(), CryptoError> {
        let digest = self.hash();
        let public_key = recover_public_key(digest.as_bytes(), &self.signature)?;
        let signer = Address::from_public_key(&public_key, self.from.shard());
        if signer != self.from {
            return Err(CryptoError::RecoveryFailed);
        }
        Ok(())
    }

    /// Reward pseudo-transactions are the only unsigned transactions; they
    /// are marked by the empty sender.
    pub fn is_reward(&self) -> bool {
        self.from.is_empty()
    }

    /// True when the recipient lives in a different shard than the sender.
    pub fn is_cross_shard(&self) -> bool {
        !self.to.is_empty() && self.to.shard() != self.from.shard()
    }

    /// Upper bound on what executing this transaction may deduct.
    pub fn max_cost(&self) -> U256 {
        self.amount + self.price * U256::from(self.gas_limit)
    }
}

impl CanonicalEncode for Transaction {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_raw(&self.unsigned_bytes());
        writer.write_raw(&self.signature);
    }
}

impl CanonicalDecode for Transaction {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let from = Address::decode(reader)?;
        let to = Address::decode(reader)?;
        let amount = reader.read_u256()?;
        let price = reader.read_u256()?;
        let gas_limit = reader.read_u64()?;
        let nonce = reader.read_u64()?;
        let payload = reader.read_bytes()?;
        let timestamp = reader.read_u64()?;
        let signature: [u8; SIGNATURE_LEN] =
            reader.read_raw(SIGNATURE_LEN)?.try_into().unwrap();
        Ok(Transaction {
            from,
            to,
            amount,
            price,
            gas_limit,
            nonce,
            payload,
            timestamp,
            signature,
        })
    }
}

/// Cross-shard credit: value owed to `account` in its home shard, backed by a
/// transaction sealed in the source shard.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Debt {
    /// Hash of the transaction that produced this debt.
    pub tx_hash: Hash,
    /// Sender in the source shard.
    pub from: Address,
    /// Beneficiary in the target shard.
    pub account: Address,
    pub amount: U256,
    pub price: U256,
    pub code: Vec<u8>,
}

impl Debt {
    pub fn hash(&self) -> Hash {
        Hash::of(&self.to_canonical_bytes())
    }

    /// The shard this debt must be settled in.
    pub fn target_shard(&self) -> u8 {
        self.account.shard()
    }

    /// Derive the debt a cross-shard transaction emits, if any.
    pub fn from_transaction(tx: &Transaction) -> Option<Debt> {
        if !tx.is_cross_shard() {
            return None;
        }
        Some(Debt {
            tx_hash: tx.hash(),
            from: tx.from,
            account: tx.to,
            amount: tx.amount,
            price: tx.price,
            code: tx.payload.clone(),
        })
    }
}

impl CanonicalEncode for Debt {
    fn encode(&self, writer: &mut ByteWriter) {
        self.tx_hash.encode(writer);
        self.from.encode(writer);
        self.account.encode(writer);
        writer.write_u256(&self.amount);
        writer.write_u256(&self.price);
        writer.write_bytes(&self.code);
    }
}

impl CanonicalDecode for Debt {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Debt {
            tx_hash: Hash::decode(reader)?,
            from: Address::decode(reader)?,
            account: Address::decode(reader)?,
            amount: reader.read_u256()?,
            price: reader.read_u256()?,
            code: reader.read_bytes()?,
        })
    }
}

/// An execution log entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<Hash>,
    pub data: Vec<u8>,
}

impl CanonicalEncode for Log {
    fn encode(&self, writer: &mut ByteWriter) {
        self.address.encode(writer);
        encode_seq(&self.topics, writer);
        writer.write_bytes(&self.data);
    }
}

impl CanonicalDecode for Log {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Log {
            address: Address::decode(reader)?,
            topics: decode_seq(reader)?,
            data: reader.read_bytes()?,
        })
    }
}

/// Result of executing one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Receipt {
    pub result: Vec<u8>,
    pub post_state: Hash,
    pub logs: Vec<Log>,
    pub tx_hash: Hash,
    pub contract_address: Vec<u8>,
    pub failed: bool,
    pub used_gas: u64,
    pub total_fee: U256,
}

impl CanonicalEncode for Receipt {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_bytes(&self.result);
        self.post_state.encode(writer);
        encode_seq(&self.logs, writer);
        self.tx_hash.encode(writer);
        writer.write_bytes(&self.contract_address);
        writer.write_u8(self.failed as u8);
        writer.write_u64(self.used_gas);
        writer.write_u256(&self.total_fee);
    }
}

impl CanonicalDecode for Receipt {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Receipt {
            result: reader.read_bytes()?,
            post_state: Hash::decode(reader)?,
            logs: decode_seq(reader)?,
            tx_hash: Hash::decode(reader)?,
            contract_address: reader.read_bytes()?,
            failed: reader.read_u8()? != 0,
            used_gas: reader.read_u64()?,
            total_fee: reader.read_u256()?,
        })
    }
}

/// A full block: header plus transaction and debt bodies. The header hash is
/// cached at construction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub debts: Vec<Debt>,
    pub header_hash: Hash,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>, debts: Vec<Debt>) -> Self {
        let header_hash = header.hash();
        Block {
            header,
            transactions,
            debts,
            header_hash,
        }
    }

    /// Replace the header (after sealing mutated it) and refresh the cache.
    pub fn with_seal(mut self, header: BlockHeader) -> Self {
        self.header_hash = header.hash();
        self.header = header;
        self
    }

    pub fn hash(&self) -> Hash {
        self.header_hash
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }
}

impl CanonicalEncode for Block {
    fn encode(&self, writer: &mut ByteWriter) {
        self.header.encode(writer);
        encode_seq(&self.transactions, writer);
        encode_seq(&self.debts, writer);
    }
}

impl CanonicalDecode for Block {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let header = BlockHeader::decode(reader)?;
        let transactions = decode_seq(reader)?;
        let debts = decode_seq(reader)?;
        Ok(Block::new(header, transactions, debts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn shard_keypair(shard: u8) -> (KeyPair, Address) {
        let keypair = KeyPair::generate();
        let address = Address::from_public_key(&keypair.public_key_bytes(), shard);
        (keypair, address)
    }

    fn test_address(shard: u8, tail: u8) -> Address {
        let mut bytes = [tail; 20];
        bytes[0] = shard << 4;
        Address(bytes)
    }

    fn sample_header() -> BlockHeader {
        BlockHeader {
            previous_hash: Hash::of(b"parent"),
            creator: test_address(1, 7),
            state_root: Hash::of(b"state"),
            tx_root: Hash::of(b"txs"),
            receipt_root: Hash::of(b"receipts"),
            debt_root: Hash::of(b"debts"),
            difficulty: U256::from(10_000u64),
            height: 42,
            timestamp: U256::from(1_700_000_000u64),
            witness: b"12345678".to_vec(),
            extra: vec![],
            consensus: ConsensusType::Pow,
        }
    }

    // =========================================================================
    // ADDRESS TESTS
    // =========================================================================

    #[test]
    fn shard_is_read_from_upper_nibble() {
        assert_eq!(test_address(3, 0).shard(), 3);
        assert_eq!(Address::EMPTY.shard(), UNDEFINED_SHARD);
    }

    #[test]
    fn text_form_round_trips() {
        let address = test_address(2, 0xAB);
        let text = address.to_text();
        assert!(text.starts_with("2S"));
        assert_eq!(Address::from_text(&text).unwrap(), address);
    }

    #[test]
    fn text_form_rejects_mismatched_shard_digit() {
        let address = test_address(2, 0xAB);
        let mut text = address.to_text();
        text.replace_range(0..1, "3");
        assert!(matches!(
            Address::from_text(&text),
            Err(AddressParseError::ShardMismatch { .. })
        ));
    }

    #[test]
    fn derived_address_lands_in_requested_shard() {
        let (_, address) = shard_keypair(3);
        assert_eq!(address.shard(), 3);
    }

    // =========================================================================
    // HEADER / BLOCK CODEC TESTS
    // =========================================================================

    #[test]
    fn header_hash_is_stable_over_round_trip() {
        let header = sample_header();
        let bytes = header.to_canonical_bytes();
        let decoded = BlockHeader::from_canonical_bytes(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.hash(), header.hash());
    }

    #[test]
    fn header_hash_depends_on_witness() {
        let mut a = sample_header();
        let b = a.clone();
        a.witness = b"87654321".to_vec();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn block_round_trip_preserves_hash() {
        let (keypair, from) = shard_keypair(1);
        let mut tx = Transaction {
            from,
            to: test_address(2, 9),
            amount: U256::from(100u64),
            price: U256::from(2u64),
            gas_limit: 21_000,
            nonce: 1,
            timestamp: 99,
            ..Default::default()
        };
        tx.sign(&keypair).unwrap();
        let debt = Debt::from_transaction(&tx).unwrap();

        let block = Block::new(sample_header(), vec![tx], vec![debt]);
        let decoded = Block::from_canonical_bytes(&block.to_canonical_bytes()).unwrap();

        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn block_decode_rejects_trailing_bytes() {
        let block = Block::new(sample_header(), vec![], vec![]);
        let mut bytes = block.to_canonical_bytes();
        bytes.push(0xFF);
        assert!(matches!(
            Block::from_canonical_bytes(&bytes),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    // =========================================================================
    // TRANSACTION TESTS
    // =========================================================================

    #[test]
    fn signature_verifies_for_owner_only() {
        let (keypair, from) = shard_keypair(1);
        let mut tx = Transaction {
            from,
            to: test_address(1, 3),
            amount: U256::from(5u64),
            nonce: 1,
            ..Default::default()
        };
        tx.sign(&keypair).unwrap();
        assert!(tx.verify_signature().is_ok());

        // Tampering with the amount invalidates the signature.
        tx.amount = U256::from(6u64);
        assert!(tx.verify_signature().is_err());
    }

    #[test]
    fn cross_shard_detection() {
        let same = Transaction {
            from: test_address(1, 1),
            to: test_address(1, 2),
            ..Default::default()
        };
        let cross = Transaction {
            from: test_address(1, 1),
            to: test_address(2, 2),
            ..Default::default()
        };
        assert!(!same.is_cross_shard());
        assert!(cross.is_cross_shard());
    }

    #[test]
    fn debt_derivation_only_for_cross_shard() {
        let local = Transaction {
            from: test_address(1, 1),
            to: test_address(1, 2),
            ..Default::default()
        };
        assert!(Debt::from_transaction(&local).is_none());

        let cross = Transaction {
            from: test_address(1, 1),
            to: test_address(2, 2),
            amount: U256::from(77u64),
            ..Default::default()
        };
        let debt = Debt::from_transaction(&cross).unwrap();
        assert_eq!(debt.target_shard(), 2);
        assert_eq!(debt.amount, U256::from(77u64));
        assert_eq!(debt.tx_hash, cross.hash());
    }
}
