//! Copy-on-write trie over a key-value store.
//!
//! Mutations never touch existing nodes: the path from the changed leaf up to
//! the root is rebuilt, everything else is shared with prior versions. New
//! nodes accumulate in memory until [`Trie::commit`] moves them into a
//! storage batch.

use super::errors::StateError;
use super::nibbles::{common_prefix_len, nibbles_of};
use super::node::Node;
use fc_03_store::{Batch, KeyValueStore};
use shared_types::{CanonicalDecode, CanonicalEncode, Hash};
use std::collections::HashMap;
use std::sync::Arc;

/// Storage key prefix for trie nodes.
const NODE_PREFIX: &[u8] = b"trn-";

fn node_key(hash: &Hash) -> Vec<u8> {
    let mut key = NODE_PREFIX.to_vec();
    key.extend_from_slice(hash.as_bytes());
    key
}

/// A mutable view of one state version.
pub struct Trie {
    db: Arc<dyn KeyValueStore>,
    /// Nodes created since the last commit, keyed by their hash.
    fresh: HashMap<Hash, Arc<Node>>,
    root: Hash,
}

impl Trie {
    /// Open the trie at `root`. `Hash::EMPTY` is the empty trie; any other
    /// root must resolve to a stored node.
    pub fn open(root: Hash, db: Arc<dyn KeyValueStore>) -> Result<Self, StateError> {
        let trie = Trie {
            db,
            fresh: HashMap::new(),
            root,
        };
        if !root.is_empty() {
            trie.load_node(&root)?;
        }
        Ok(trie)
    }

    pub fn root_hash(&self) -> Hash {
        self.root
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        if self.root.is_empty() {
            return Ok(None);
        }
        self.get_at(self.root, &nibbles_of(key))
    }

    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StateError> {
        let root = self.root;
        self.root = self.insert_at(root, &nibbles_of(key), value)?;
        Ok(())
    }

    /// Move every node created since the last commit into `batch` and return
    /// the root anchoring this version.
    pub fn commit(&mut self, batch: &mut Batch) -> Hash {
        for (hash, node) in self.fresh.drain() {
            batch.put(node_key(&hash), node.to_canonical_bytes());
        }
        self.root
    }

    fn load_node(&self, hash: &Hash) -> Result<Arc<Node>, StateError> {
        if let Some(node) = self.fresh.get(hash) {
            return Ok(Arc::clone(node));
        }
        let bytes = self
            .db
            .get(&node_key(hash))?
            .ok_or(StateError::MissingNode(*hash))?;
        let node = Node::from_canonical_bytes(&bytes).map_err(|source| {
            StateError::CorruptNode {
                hash: *hash,
                source,
            }
        })?;
        Ok(Arc::new(node))
    }

    fn store_node(&mut self, node: Node) -> Hash {
        let hash = node.hash();
        self.fresh.entry(hash).or_insert_with(|| Arc::new(node));
        hash
    }

    fn get_at(&self, node_hash: Hash, path: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        let node = self.load_node(&node_hash)?;
        match &*node {
            Node::Leaf {
                path: leaf_path,
                value,
            } => Ok((leaf_path.as_slice() == path).then(|| value.clone())),
            Node::Branch { children, value } => {
                let Some((first, rest)) = path.split_first() else {
                    return Ok(value.clone());
                };
                let child = children[*first as usize];
                if child.is_empty() {
                    return Ok(None);
                }
                self.get_at(child, rest)
            }
        }
    }

    fn insert_at(
        &mut self,
        node_hash: Hash,
        path: &[u8],
        value: Vec<u8>,
    ) -> Result<Hash, StateError> {
        if node_hash.is_empty() {
            return Ok(self.store_node(Node::Leaf {
                path: path.to_vec(),
                value,
            }));
        }

        let node = self.load_node(&node_hash)?;
        match &*node {
            Node::Leaf {
                path: leaf_path,
                value: leaf_value,
            } => {
                if leaf_path.as_slice() == path {
                    return Ok(self.store_node(Node::Leaf {
                        path: path.to_vec(),
                        value,
                    }));
                }
                let leaf_path = leaf_path.clone();
                let leaf_value = leaf_value.clone();
                self.split_leaf(&leaf_path, leaf_value, path, value)
            }
            Node::Branch {
                children,
                value: branch_value,
            } => {
                let mut children = *children;
                let mut branch_value = branch_value.clone();
                match path.split_first() {
                    None => branch_value = Some(value),
                    Some((first, rest)) => {
                        let slot = *first as usize;
                        children[slot] = self.insert_at(children[slot], rest, value)?;
                    }
                }
                Ok(self.store_node(Node::Branch {
                    children,
                    value: branch_value,
                }))
            }
        }
    }

    /// Replace a leaf by the branch structure holding both the old and the
    /// new entry, chaining one single-child branch per shared nibble.
    fn split_leaf(
        &mut self,
        old_path: &[u8],
        old_value: Vec<u8>,
        new_path: &[u8],
        new_value: Vec<u8>,
    ) -> Result<Hash, StateError> {
        let common = common_prefix_len(old_path, new_path);
        let old_rest = &old_path[common..];
        let new_rest = &new_path[common..];

        let mut children = [Hash::EMPTY; 16];
        let mut branch_value = None;

        match old_rest.split_first() {
            None => branch_value = Some(old_value),
            Some((first, rest)) => {
                children[*first as usize] = self.store_node(Node::Leaf {
                    path: rest.to_vec(),
                    value: old_value,
                });
            }
        }
        match new_rest.split_first() {
            None => branch_value = Some(new_value),
            Some((first, rest)) => {
                children[*first as usize] = self.store_node(Node::Leaf {
                    path: rest.to_vec(),
                    value: new_value,
                });
            }
        }

        let mut node_hash = self.store_node(Node::Branch {
            children,
            value: branch_value,
        });

        for &nibble in old_path[..common].iter().rev() {
            let mut chain = [Hash::EMPTY; 16];
            chain[nibble as usize] = node_hash;
            node_hash = self.store_node(Node::Branch {
                children: chain,
                value: None,
            });
        }

        Ok(node_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_03_store::MemoryStore;

    fn empty_trie() -> (Trie, Arc<MemoryStore>) {
        let db = Arc::new(MemoryStore::new());
        let trie = Trie::open(Hash::EMPTY, db.clone()).unwrap();
        (trie, db)
    }

    #[test]
    fn insert_and_get() {
        let (mut trie, _db) = empty_trie();
        trie.insert(b"alpha", b"1".to_vec()).unwrap();
        trie.insert(b"alien", b"2".to_vec()).unwrap();
        trie.insert(b"beta", b"3".to_vec()).unwrap();

        assert_eq!(trie.get(b"alpha").unwrap(), Some(b"1".to_vec()));
        assert_eq!(trie.get(b"alien").unwrap(), Some(b"2".to_vec()));
        assert_eq!(trie.get(b"beta").unwrap(), Some(b"3".to_vec()));
        assert_eq!(trie.get(b"gamma").unwrap(), None);
    }

    #[test]
    fn overwrite_updates_value() {
        let (mut trie, _db) = empty_trie();
        trie.insert(b"key", b"old".to_vec()).unwrap();
        trie.insert(b"key", b"new".to_vec()).unwrap();
        assert_eq!(trie.get(b"key").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn root_is_insertion_order_independent() {
        let (mut a, _) = empty_trie();
        a.insert(b"one", b"1".to_vec()).unwrap();
        a.insert(b"two", b"2".to_vec()).unwrap();
        a.insert(b"three", b"3".to_vec()).unwrap();

        let (mut b, _) = empty_trie();
        b.insert(b"three", b"3".to_vec()).unwrap();
        b.insert(b"one", b"1".to_vec()).unwrap();
        b.insert(b"two", b"2".to_vec()).unwrap();

        assert_eq!(a.root_hash(), b.root_hash());
    }

    #[test]
    fn committed_version_reopens() {
        let db = Arc::new(MemoryStore::new());
        let mut trie = Trie::open(Hash::EMPTY, db.clone()).unwrap();
        trie.insert(b"persist", b"me".to_vec()).unwrap();

        let mut batch = Batch::new();
        let root = trie.commit(&mut batch);
        db.write_batch(batch).unwrap();

        let reopened = Trie::open(root, db).unwrap();
        assert_eq!(reopened.get(b"persist").unwrap(), Some(b"me".to_vec()));
    }

    #[test]
    fn old_version_survives_new_writes() {
        let db = Arc::new(MemoryStore::new());
        let mut trie = Trie::open(Hash::EMPTY, db.clone()).unwrap();
        trie.insert(b"account", b"v1".to_vec()).unwrap();

        let mut batch = Batch::new();
        let root_v1 = trie.commit(&mut batch);
        db.write_batch(batch).unwrap();

        trie.insert(b"account", b"v2".to_vec()).unwrap();
        let mut batch = Batch::new();
        let root_v2 = trie.commit(&mut batch);
        db.write_batch(batch).unwrap();

        // Both versions stay readable through their roots.
        let v1 = Trie::open(root_v1, db.clone()).unwrap();
        let v2 = Trie::open(root_v2, db).unwrap();
        assert_eq!(v1.get(b"account").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(v2.get(b"account").unwrap(), Some(b"v2".to_vec()));
        assert_ne!(root_v1, root_v2);
    }

    #[test]
    fn missing_root_is_rejected() {
        let db = Arc::new(MemoryStore::new());
        let result = Trie::open(Hash::of(b"nowhere"), db);
        assert!(matches!(result, Err(StateError::MissingNode(_))));
    }
}
