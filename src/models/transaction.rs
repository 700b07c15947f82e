//! Signed value-transfer transactions.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::canonical;
use crate::crypto::{self, Wallet};
use crate::models::utxo::{UTXO, UTXORef};

/// An externally signed transaction, as admitted and as stored.
///
/// `tx_id` is the hex SHA-256 of the canonical pre-hash and the
/// signature covers the same bytes, so neither can be altered without
/// the other breaking. `block_height` stays `None` until inclusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx_id: String,
    pub sender: String,
    pub inputs: Vec<UTXORef>,
    pub outputs: Vec<UTXO>,
    pub fee: Amount,
    pub payload_hash: String,
    pub timestamp: u64,
    pub signature: String,
    #[serde(default)]
    pub block_height: Option<u64>,
}

impl SignedTransaction {
    /// Build and sign a transaction with the given wallet.
    ///
    /// Output UTXOs receive the derived `tx_id` and positional indexes;
    /// callers supply only `(recipient, amount)` pairs.
    pub fn create(
        wallet: &Wallet,
        inputs: Vec<UTXORef>,
        outputs: Vec<(String, Amount)>,
        fee: Amount,
        payload_hash: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        let sender = wallet.address();
        let prehash = canonical::tx_prehash_bytes(&sender, &inputs, &outputs, fee, timestamp);
        let tx_id = canonical::tx_id_from_prehash(&prehash);
        let signature = wallet.sign(&prehash);
        let outputs = outputs
            .into_iter()
            .enumerate()
            .map(|(index, (recipient, amount))| {
                UTXO::new(tx_id.clone(), index as u32, recipient, amount)
            })
            .collect();
        Self {
            tx_id,
            sender,
            inputs,
            outputs,
            fee,
            payload_hash: payload_hash.into(),
            timestamp,
            signature,
            block_height: None,
        }
    }

    /// The canonical bytes this transaction's signature covers.
    pub fn prehash_bytes(&self) -> Vec<u8> {
        let outputs: Vec<(String, Amount)> = self
            .outputs
            .iter()
            .map(|o| (o.recipient.clone(), o.amount))
            .collect();
        canonical::tx_prehash_bytes(&self.sender, &self.inputs, &outputs, self.fee, self.timestamp)
    }

    /// Recompute the id from current content.
    pub fn computed_tx_id(&self) -> String {
        canonical::tx_id_from_prehash(&self.prehash_bytes())
    }

    /// Verify the Ed25519 signature against the sender address.
    pub fn verify_signature(&self) -> bool {
        crypto::verify_signature(&self.sender, &self.prehash_bytes(), &self.signature)
    }

    pub fn input_keys(&self) -> Vec<String> {
        self.inputs.iter().map(UTXORef::key).collect()
    }

    /// Σ outputs, or `None` on overflow.
    pub fn total_output(&self) -> Option<Amount> {
        Amount::checked_sum(self.outputs.iter().map(|o| o.amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(wallet: &Wallet) -> SignedTransaction {
        SignedTransaction::create(
            wallet,
            vec![UTXORef::new("genesis", 0)],
            vec![
                ("addr-b".to_string(), "4".parse().unwrap()),
                (wallet.address(), "5.99".parse().unwrap()),
            ],
            "0.01".parse().unwrap(),
            "00".repeat(32),
            1_700_000_000,
        )
    }

    #[test]
    fn created_transaction_is_internally_consistent() {
        let wallet = Wallet::generate();
        let tx = sample(&wallet);
        assert_eq!(tx.tx_id, tx.computed_tx_id());
        assert!(tx.verify_signature());
        for (i, out) in tx.outputs.iter().enumerate() {
            assert_eq!(out.tx_id, tx.tx_id);
            assert_eq!(out.output_index, i as u32);
        }
        assert_eq!(tx.total_output().unwrap(), "9.99".parse().unwrap());
        assert!(tx.block_height.is_none());
    }

    #[test]
    fn altering_any_canonical_field_breaks_the_signature() {
        let wallet = Wallet::generate();
        let base = sample(&wallet);

        let mut tampered = base.clone();
        tampered.fee = "0.02".parse().unwrap();
        assert!(!tampered.verify_signature());

        let mut tampered = base.clone();
        tampered.outputs[0].amount = "5".parse().unwrap();
        assert!(!tampered.verify_signature());

        let mut tampered = base.clone();
        tampered.timestamp += 1;
        assert!(!tampered.verify_signature());

        let mut tampered = base;
        tampered.inputs[0].output_index = 1;
        assert!(!tampered.verify_signature());
    }

    #[test]
    fn wire_round_trip_preserves_id() {
        let wallet = Wallet::generate();
        let tx = sample(&wallet);
        let json = serde_json::to_string(&tx).unwrap();
        let back: SignedTransaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
        assert_eq!(back.computed_tx_id(), tx.tx_id);
        assert!(back.verify_signature());
    }
}
