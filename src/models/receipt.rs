//! Payment receipts: proof that a transaction paid a provider inside a
//! specific block.

use serde::{Deserialize, Serialize};

use crate::models::block::BlockHeader;
use crate::models::transaction::SignedTransaction;

/// A self-contained record tying a payment transaction to the block
/// that included it and the endpoint it paid for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptProof {
    /// The full transaction used for the payment.
    pub tx: SignedTransaction,
    /// Header of the block that included it.
    pub block_header: BlockHeader,
    /// Position of the transaction within the block.
    pub position: u32,
    /// Unix time of block inclusion.
    pub included_at: u64,
    /// Endpoint the payment was for.
    pub provider_url: String,
}

impl ReceiptProof {
    /// Build a receipt for one of a block's transactions, or `None` if
    /// the block does not contain it.
    pub fn for_transaction(
        block: &crate::models::Block,
        tx_id: &str,
        provider_url: impl Into<String>,
    ) -> Option<Self> {
        let position = block
            .transactions
            .iter()
            .position(|tx| tx.tx_id == tx_id)?;
        Some(Self {
            tx: block.transactions[position].clone(),
            block_header: block.header.clone(),
            position: position as u32,
            included_at: block.header.timestamp,
            provider_url: provider_url.into(),
        })
    }

    pub fn id(&self) -> String {
        format!("{}:{}", self.tx.tx_id, self.position)
    }
}
