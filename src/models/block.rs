//! Blocks and block headers.

use serde::{Deserialize, Serialize};

use crate::canonical;
use crate::models::transaction::SignedTransaction;

/// `prev_hash` of the genesis block.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Blob reference recorded for the genesis block instead of a DA locator.
pub const GENESIS_BLOB_REF: &str = "genesis";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub prev_hash: String,
    /// State-tree root after every transaction in this block applied.
    pub state_root: String,
    pub timestamp: u64,
    pub tx_count: u32,
    /// DA locator (`"<da_height>:<namespace_hex>"`), empty until posted.
    pub blob_ref: String,
    pub fee_schedule_id: String,
    /// Content hash over every other header field.
    pub hash: String,
}

impl BlockHeader {
    /// Build a header and seal it with its content hash.
    pub fn new(
        height: u64,
        prev_hash: impl Into<String>,
        state_root: impl Into<String>,
        timestamp: u64,
        tx_count: u32,
        blob_ref: impl Into<String>,
        fee_schedule_id: impl Into<String>,
    ) -> Self {
        let mut header = Self {
            height,
            prev_hash: prev_hash.into(),
            state_root: state_root.into(),
            timestamp,
            tx_count,
            blob_ref: blob_ref.into(),
            fee_schedule_id: fee_schedule_id.into(),
            hash: String::new(),
        };
        header.hash = header.compute_hash();
        header
    }

    /// The canonical content hash, excluding the `hash` field itself.
    pub fn compute_hash(&self) -> String {
        canonical::header_hash(
            self.height,
            &self.prev_hash,
            &self.state_root,
            self.timestamp,
            self.tx_count,
            &self.blob_ref,
            &self.fee_schedule_id,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<SignedTransaction>,
}

impl Block {
    /// Serialize for DA submission (canonical JSON, sorted keys).
    pub fn to_blob(&self) -> serde_json::Result<String> {
        canonical::canonical_json(self)
    }

    pub fn from_blob(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}
