//! Sparse Merkle tree over the live UTXO set.
//!
//! Keys are UTXO keys (`"<tx_id>:<output_index>"`); a key's leaf slot is
//! the first 64 bits of its SHA-256 digest. Hashes are hex text:
//! `H_leaf = sha256("leaf:" + key + ":" + value)`,
//! `H_branch = sha256(left_hex + right_hex)`, and the empty node at
//! every level is `sha256("0")`. Only nodes with a populated leaf below
//! them are materialized, so the empty-tree root is restored once every
//! key is deleted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::utils::sha256_hex;

/// Number of levels below the root; leaves sit at this depth.
pub const TREE_DEPTH: u8 = 64;

/// Which side of the path a proof sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiblingSide {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofNode {
    pub side: SiblingSide,
    pub hash: String,
}

/// Inclusion proof: sibling hashes from the leaf's level up to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub key: String,
    pub value_hash: String,
    pub siblings: Vec<ProofNode>,
}

/// Node address: depth (0 = root) and the path prefix at that depth.
type NodeId = (u8, u64);

pub struct SparseMerkleTree {
    nodes: HashMap<NodeId, String>,
    /// Leaf key -> leaf hash, for membership and proofs.
    leaves: HashMap<String, String>,
    empty_hash: String,
}

impl Default for SparseMerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseMerkleTree {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            leaves: HashMap::new(),
            empty_hash: sha256_hex(b"0"),
        }
    }

    /// Root of the empty tree: the designated empty-node constant.
    pub fn empty_root() -> String {
        sha256_hex(b"0")
    }

    fn hash_leaf(key: &str, value: &str) -> String {
        sha256_hex(format!("leaf:{key}:{value}").as_bytes())
    }

    fn hash_branch(left: &str, right: &str) -> String {
        sha256_hex(format!("{left}{right}").as_bytes())
    }

    /// Leaf slot for a key: the first 64 bits of its digest.
    fn leaf_index(key: &str) -> u64 {
        let digest = crate::utils::sha256_bytes(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }

    /// Path prefix of the node containing `index` at the given depth.
    fn prefix_at(index: u64, depth: u8) -> u64 {
        if depth == 0 {
            0
        } else {
            index >> (TREE_DEPTH - depth)
        }
    }

    fn node_hash(&self, id: NodeId) -> &str {
        self.nodes.get(&id).map(String::as_str).unwrap_or(&self.empty_hash)
    }

    /// Insert/update (`Some`) or delete (`None`) a key.
    ///
    /// Re-inserting an identical value is idempotent; deleting an absent
    /// key is a no-op. The new root is observable via [`root`](Self::root)
    /// as soon as this returns.
    pub fn update(&mut self, key: &str, value: Option<&str>) {
        let index = Self::leaf_index(key);
        match value {
            Some(value) => {
                let leaf_hash = Self::hash_leaf(key, value);
                self.leaves.insert(key.to_string(), leaf_hash.clone());
                self.nodes.insert((TREE_DEPTH, index), leaf_hash);
            }
            None => {
                if self.leaves.remove(key).is_none() {
                    return;
                }
                self.nodes.remove(&(TREE_DEPTH, index));
            }
        }
        self.recompute_path(index);
    }

    /// Recompute ancestors of a leaf slot, pruning childless nodes.
    fn recompute_path(&mut self, index: u64) {
        for depth in (1..=TREE_DEPTH).rev() {
            let prefix = Self::prefix_at(index, depth);
            let sibling = prefix ^ 1;
            let parent = (depth - 1, prefix >> 1);

            let has_children =
                self.nodes.contains_key(&(depth, prefix)) || self.nodes.contains_key(&(depth, sibling));
            if !has_children {
                self.nodes.remove(&parent);
                continue;
            }

            let (left, right) = if prefix & 1 == 0 {
                (prefix, sibling)
            } else {
                (sibling, prefix)
            };
            let parent_hash =
                Self::hash_branch(self.node_hash((depth, left)), self.node_hash((depth, right)));
            self.nodes.insert(parent, parent_hash);
        }
    }

    /// Current root; the empty tree has the designated empty constant.
    pub fn root(&self) -> String {
        self.nodes
            .get(&(0, 0))
            .cloned()
            .unwrap_or_else(|| self.empty_hash.clone())
    }

    /// Leaf hash for a present key.
    pub fn get(&self, key: &str) -> Option<&String> {
        self.leaves.get(key)
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Inclusion proof for a present key, or `None` if absent.
    ///
    /// Siblings are ordered leaf level first; the proof verifies only
    /// against the root at the time it was generated.
    pub fn prove(&self, key: &str) -> Option<MerkleProof> {
        let value_hash = self.leaves.get(key)?.clone();
        let index = Self::leaf_index(key);
        let mut siblings = Vec::with_capacity(TREE_DEPTH as usize);
        for depth in (1..=TREE_DEPTH).rev() {
            let prefix = Self::prefix_at(index, depth);
            let side = if prefix & 1 == 0 {
                SiblingSide::Right
            } else {
                SiblingSide::Left
            };
            siblings.push(ProofNode {
                side,
                hash: self.node_hash((depth, prefix ^ 1)).to_string(),
            });
        }
        Some(MerkleProof {
            key: key.to_string(),
            value_hash,
            siblings,
        })
    }

    /// Recompute the root from a proof and compare against `root`.
    pub fn verify(key: &str, value: &str, proof: &MerkleProof, root: &str) -> bool {
        if proof.key != key || proof.siblings.len() != TREE_DEPTH as usize {
            return false;
        }
        let leaf_hash = Self::hash_leaf(key, value);
        if leaf_hash != proof.value_hash {
            return false;
        }
        let index = Self::leaf_index(key);
        let mut current = leaf_hash;
        for (i, sibling) in proof.siblings.iter().enumerate() {
            let depth = TREE_DEPTH - i as u8;
            let prefix = Self::prefix_at(index, depth);
            current = if prefix & 1 == 0 {
                Self::hash_branch(&current, &sibling.hash)
            } else {
                Self::hash_branch(&sibling.hash, &current)
            };
        }
        current == root
    }
}
