//! Transfer construction: coin selection, change, signing.
//!
//! This is what the external send surface calls. Selection works over
//! the sender's spendable set with pending-reserved UTXOs excluded, so
//! a freshly built transfer never contests an input already promised to
//! an admitted transaction. A [`ChainSession`] lets a caller issue
//! several transfers back to back before any block forms, spending the
//! change outputs of its own earlier transfers.

use log::debug;
use thiserror::Error;

use crate::amount::Amount;
use crate::crypto::Wallet;
use crate::models::{SignedTransaction, UTXO};
use crate::storage::{Store, StoreError};

#[derive(Debug, Error)]
pub enum TxBuildError {
    #[error("no spendable UTXOs for {0}")]
    NoSpendableUtxos(String),
    #[error("insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: Amount, required: Amount },
    #[error("transfer amount must be positive")]
    ZeroAmount,
    #[error("amount overflow")]
    AmountOverflow,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tracks the outputs of transfers built earlier in one batch, so the
/// next transfer can chain on their change before anything commits.
#[derive(Default)]
pub struct ChainSession {
    virtual_utxos: Vec<UTXO>,
    spent_keys: std::collections::HashSet<String>,
}

impl ChainSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.virtual_utxos.clear();
        self.spent_keys.clear();
    }

    /// Record a built transfer: its inputs are spoken for, its outputs
    /// become spendable by later transfers in the session.
    pub fn track(&mut self, tx: &SignedTransaction) {
        for key in tx.input_keys() {
            self.spent_keys.insert(key);
        }
        self.virtual_utxos.extend(tx.outputs.iter().cloned());
    }

    /// Session outputs a sender may still spend, largest first.
    fn spendable_for(&self, address: &str) -> Vec<UTXO> {
        let mut utxos: Vec<UTXO> = self
            .virtual_utxos
            .iter()
            .filter(|u| u.recipient == address && !self.spent_keys.contains(&u.key()))
            .cloned()
            .collect();
        utxos.sort_by(|a, b| b.amount.cmp(&a.amount));
        utxos
    }

    fn is_spent(&self, key: &str) -> bool {
        self.spent_keys.contains(key)
    }
}

/// Build and sign a transfer of `amount` to `recipient`.
///
/// Inputs are chosen largest-first until they cover amount + fee;
/// whatever is left over returns to the sender as a change output.
/// With a session, the session's own change outputs are preferred over
/// stored UTXOs.
pub fn build_transfer(
    store: &Store,
    wallet: &Wallet,
    recipient: &str,
    amount: Amount,
    fee: Amount,
    timestamp: u64,
    session: Option<&mut ChainSession>,
) -> Result<SignedTransaction, TxBuildError> {
    if amount.is_zero() {
        return Err(TxBuildError::ZeroAmount);
    }
    let sender = wallet.address();
    let required = amount.checked_add(fee).ok_or(TxBuildError::AmountOverflow)?;

    // Chained outputs first, then the durable spendable set.
    let mut candidates: Vec<UTXO> = match &session {
        Some(session) => session.spendable_for(&sender),
        None => Vec::new(),
    };
    let mut stored = store.fetch_unspent_utxos(&sender, true)?;
    stored.sort_by(|a, b| b.amount.cmp(&a.amount));
    for utxo in stored {
        let reserved = session
            .as_ref()
            .is_some_and(|s| s.is_spent(&utxo.key()));
        if !reserved && !candidates.iter().any(|c| c.key() == utxo.key()) {
            candidates.push(utxo);
        }
    }
    if candidates.is_empty() {
        return Err(TxBuildError::NoSpendableUtxos(sender));
    }

    let mut inputs = Vec::new();
    let mut total_in = Amount::ZERO;
    for utxo in &candidates {
        inputs.push(utxo.to_ref());
        total_in = total_in
            .checked_add(utxo.amount)
            .ok_or(TxBuildError::AmountOverflow)?;
        if total_in >= required {
            break;
        }
    }
    if total_in < required {
        return Err(TxBuildError::InsufficientFunds {
            available: total_in,
            required,
        });
    }

    let mut outputs = vec![(recipient.to_string(), amount)];
    let change = total_in
        .checked_sub(required)
        .ok_or(TxBuildError::AmountOverflow)?;
    if !change.is_zero() {
        outputs.push((sender.clone(), change));
    }

    let tx = SignedTransaction::create(wallet, inputs, outputs, fee, "0".repeat(64), timestamp);
    debug!(
        "built transfer {}: {} to {} with fee {} ({} inputs)",
        tx.tx_id,
        amount,
        recipient,
        fee,
        tx.inputs.len()
    );
    if let Some(session) = session {
        session.track(&tx);
    }
    Ok(tx)
}
