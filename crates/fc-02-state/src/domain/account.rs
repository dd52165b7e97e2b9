//! The per-account record stored as a trie value.

use shared_types::codec::{ByteReader, ByteWriter, CanonicalDecode, CanonicalEncode, CodecError};
use shared_types::{Hash, U256};

/// Balance, nonce and contract linkage of one account. Missing accounts read
/// as the zero-valued default.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccountData {
    pub balance: U256,
    pub nonce: u64,
    pub code_hash: Hash,
    pub storage_root: Hash,
}

impl CanonicalEncode for AccountData {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_u256(&self.balance);
        writer.write_u64(self.nonce);
        self.code_hash.encode(writer);
        self.storage_root.encode(writer);
    }
}

impl CanonicalDecode for AccountData {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(AccountData {
            balance: reader.read_u256()?,
            nonce: reader.read_u64()?,
            code_hash: Hash::decode(reader)?,
            storage_root: Hash::decode(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let account = AccountData {
            balance: U256::from(1_000u64),
            nonce: 7,
            code_hash: Hash::of(b"code"),
            storage_root: Hash::EMPTY,
        };
        let decoded =
            AccountData::from_canonical_bytes(&account.to_canonical_bytes()).unwrap();
        assert_eq!(decoded, account);
    }

    #[test]
    fn default_is_zero_valued() {
        let account = AccountData::default();
        assert!(account.balance.is_zero());
        assert_eq!(account.nonce, 0);
        assert!(account.code_hash.is_empty());
    }
}
