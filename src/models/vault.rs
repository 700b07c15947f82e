//! Bridge vault records: L1 deposits in, withdrawals out.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::models::utxo::UTXORef;

/// A deposit observed on the L1 chain, minting one rollup UTXO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultDeposit {
    pub l1_tx_hash: String,
    /// Rollup address credited with the minted UTXO.
    pub recipient: String,
    pub amount: Amount,
    pub l1_height: u64,
    pub timestamp: u64,
    pub processed: bool,
}

impl VaultDeposit {
    pub fn key(&self) -> String {
        deposit_key(&self.l1_tx_hash, &self.recipient)
    }
}

pub fn deposit_key(l1_tx_hash: &str, recipient: &str) -> String {
    format!("{l1_tx_hash}:{recipient}")
}

/// A withdrawal initiated on the rollup, awaiting L1 finality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultWithdrawal {
    /// The rollup transaction that burned the withdrawn UTXOs.
    pub rollup_tx_id: String,
    pub recipient: String,
    /// Destination address on the L1 chain.
    pub l1_address: String,
    pub amount: Amount,
    pub timestamp: u64,
    pub burned_inputs: Vec<UTXORef>,
    /// Set once the payout transaction lands on L1.
    #[serde(default)]
    pub l1_tx_hash: Option<String>,
    #[serde(default)]
    pub l1_confirmed: bool,
}
