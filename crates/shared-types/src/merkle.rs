//! Merkle root over canonically-encoded leaves.

use crate::codec::CanonicalEncode;
use crate::entities::Hash;
use shared_crypto::keccak256_many;

/// Root of the empty sequence. A fixed sentinel rather than the zero hash so
/// "no transactions" is distinguishable from "no root computed".
pub fn empty_merkle_root() -> Hash {
    Hash::of(b"")
}

/// Compute the Merkle root of a sequence. Leaves are the Keccak-256 hashes of
/// each item's canonical encoding; odd levels duplicate their last node.
pub fn merkle_root<T: CanonicalEncode>(items: &[T]) -> Hash {
    if items.is_empty() {
        return empty_merkle_root();
    }

    let mut level: Vec<Hash> = items
        .iter()
        .map(|item| Hash::of(&item.to_canonical_bytes()))
        .collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            next.push(Hash(keccak256_many(&[
                pair[0].as_bytes(),
                right.as_bytes(),
            ])));
        }
        level = next;
    }

    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteWriter;

    struct Leaf(u64);

    impl CanonicalEncode for Leaf {
        fn encode(&self, writer: &mut ByteWriter) {
            writer.write_u64(self.0);
        }
    }

    #[test]
    fn empty_sequence_yields_sentinel() {
        let root = merkle_root::<Leaf>(&[]);
        assert_eq!(root, empty_merkle_root());
        assert!(!root.is_empty());
    }

    #[test]
    fn root_is_order_sensitive() {
        let forward = merkle_root(&[Leaf(1), Leaf(2), Leaf(3)]);
        let reversed = merkle_root(&[Leaf(3), Leaf(2), Leaf(1)]);
        assert_ne!(forward, reversed);
    }

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let root = merkle_root(&[Leaf(9)]);
        assert_eq!(root, Hash::of(&Leaf(9).to_canonical_bytes()));
    }

    #[test]
    fn odd_count_duplicates_last_leaf() {
        // With three leaves the second pair is (h3, h3).
        let three = merkle_root(&[Leaf(1), Leaf(2), Leaf(3)]);
        let padded = merkle_root(&[Leaf(1), Leaf(2), Leaf(3), Leaf(3)]);
        assert_eq!(three, padded);
    }
}
