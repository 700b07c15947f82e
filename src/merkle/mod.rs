//! State commitment over the live UTXO set.

pub mod smt;

pub use smt::{MerkleProof, ProofNode, SiblingSide, SparseMerkleTree, TREE_DEPTH};
