//! UTXO records and input references.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;

/// Lifecycle of a UTXO: created `unspent`, consumed exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UtxoStatus {
    #[default]
    Unspent,
    Spent,
}

/// Pointer to an output: the transaction that created it and its index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UTXORef {
    pub tx_id: String,
    pub output_index: u32,
}

impl UTXORef {
    pub fn new(tx_id: impl Into<String>, output_index: u32) -> Self {
        Self {
            tx_id: tx_id.into(),
            output_index,
        }
    }

    /// Storage and state-tree key: `"<tx_id>:<output_index>"`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.tx_id, self.output_index)
    }
}

/// An unspent transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UTXO {
    pub tx_id: String,
    pub output_index: u32,
    pub recipient: String,
    pub amount: Amount,
    #[serde(default)]
    pub status: UtxoStatus,
}

impl UTXO {
    pub fn new(
        tx_id: impl Into<String>,
        output_index: u32,
        recipient: impl Into<String>,
        amount: Amount,
    ) -> Self {
        Self {
            tx_id: tx_id.into(),
            output_index,
            recipient: recipient.into(),
            amount,
            status: UtxoStatus::Unspent,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.tx_id, self.output_index)
    }

    pub fn to_ref(&self) -> UTXORef {
        UTXORef::new(self.tx_id.clone(), self.output_index)
    }

    pub fn is_spent(&self) -> bool {
        self.status == UtxoStatus::Spent
    }
}
