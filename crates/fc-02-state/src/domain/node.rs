//! Trie nodes and their canonical encoding.
//!
//! A node's identity is the Keccak-256 hash of its encoding, so identical
//! subtrees converge on identical hashes regardless of how they were built.

use shared_types::codec::{ByteReader, ByteWriter, CanonicalDecode, CanonicalEncode, CodecError};
use shared_types::Hash;

const TAG_LEAF: u8 = 0;
const TAG_BRANCH: u8 = 1;

/// A radix-16 trie node. `Hash::EMPTY` children mean "absent".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf {
        /// Remaining nibble path below this node.
        path: Vec<u8>,
        value: Vec<u8>,
    },
    Branch {
        children: [Hash; 16],
        value: Option<Vec<u8>>,
    },
}

impl Node {
    pub fn hash(&self) -> Hash {
        Hash::of(&self.to_canonical_bytes())
    }
}

impl CanonicalEncode for Node {
    fn encode(&self, writer: &mut ByteWriter) {
        match self {
            Node::Leaf { path, value } => {
                writer.write_u8(TAG_LEAF);
                writer.write_bytes(path);
                writer.write_bytes(value);
            }
            Node::Branch { children, value } => {
                writer.write_u8(TAG_BRANCH);
                let mut bitmap: u16 = 0;
                for (index, child) in children.iter().enumerate() {
                    if !child.is_empty() {
                        bitmap |= 1 << index;
                    }
                }
                writer.write_u32(bitmap as u32);
                for child in children.iter().filter(|c| !c.is_empty()) {
                    child.encode(writer);
                }
                match value {
                    Some(value) => {
                        writer.write_u8(1);
                        writer.write_bytes(value);
                    }
                    None => writer.write_u8(0),
                }
            }
        }
    }
}

impl CanonicalDecode for Node {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        match reader.read_u8()? {
            TAG_LEAF => Ok(Node::Leaf {
                path: reader.read_bytes()?,
                value: reader.read_bytes()?,
            }),
            TAG_BRANCH => {
                let bitmap = reader.read_u32()? as u16;
                let mut children = [Hash::EMPTY; 16];
                for (index, slot) in children.iter_mut().enumerate() {
                    if bitmap & (1 << index) != 0 {
                        *slot = Hash::decode(reader)?;
                    }
                }
                let value = match reader.read_u8()? {
                    0 => None,
                    _ => Some(reader.read_bytes()?),
                };
                Ok(Node::Branch { children, value })
            }
            tag => Err(CodecError::InvalidTag {
                tag,
                type_name: "trie node",
            }),
        }
    }
}
