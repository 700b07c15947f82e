//! The ledger: sole authority over UTXO state transitions.
//!
//! Every mutation funnels through a `&mut Ledger`, which the node wraps
//! in one async mutex: at most one application runs at a time, and the
//! state tree is updated in the same critical section as the storage
//! commit.

use log::{debug, info, warn};
use thiserror::Error;

use crate::amount::Amount;
use crate::canonical;
use crate::merkle::{MerkleProof, SparseMerkleTree};
use crate::models::{
    Block, BlockHeader, GenesisState, SignedTransaction, VaultDeposit, VaultWithdrawal, UTXO,
    GENESIS_BLOB_REF, GENESIS_PREV_HASH,
};
use crate::storage::{Store, StoreError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid transaction signature")]
    InvalidSignature,
    #[error("input UTXO not found: {0}")]
    InputNotFound(String),
    #[error("input UTXO already spent: {0}")]
    InputSpent(String),
    #[error("input UTXO {0} does not belong to the sender")]
    NotOwner(String),
    #[error("duplicate input: {0}")]
    DuplicateInput(String),
    #[error("insufficient funds: inputs {inputs} < outputs {outputs} + fee {fee}")]
    InsufficientFunds {
        inputs: Amount,
        outputs: Amount,
        fee: Amount,
    },
    #[error("unbalanced transaction: inputs {inputs} exceed outputs {outputs} + fee {fee}")]
    Unbalanced {
        inputs: Amount,
        outputs: Amount,
        fee: Amount,
    },
    #[error("amount overflow while summing")]
    AmountOverflow,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// True when re-applying the identical transaction can never
    /// succeed, whatever else happens to the UTXO set. The generator
    /// deletes such rows instead of leaving them to the purger.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidSignature
                | LedgerError::NotOwner(_)
                | LedgerError::DuplicateInput(_)
                | LedgerError::InsufficientFunds { .. }
                | LedgerError::Unbalanced { .. }
                | LedgerError::AmountOverflow
        )
    }
}

pub struct Ledger {
    store: Store,
    tree: SparseMerkleTree,
}

impl Ledger {
    /// Boot from storage: every unspent UTXO is folded into the state
    /// tree, yielding a deterministic initial root.
    pub fn boot(store: Store) -> Result<Self, LedgerError> {
        let mut tree = SparseMerkleTree::new();
        let unspent = store.fetch_all_unspent_utxos()?;
        for utxo in &unspent {
            tree.update(
                &utxo.key(),
                Some(&canonical::utxo_leaf_value(&utxo.recipient, utxo.amount)),
            );
        }
        info!(
            "ledger booted: {} live UTXOs, state root {}",
            unspent.len(),
            tree.root()
        );
        Ok(Self { store, tree })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn state_root(&self) -> String {
        self.tree.root()
    }

    /// Σ unspent UTXO amounts held by an address.
    pub fn balance(&self, address: &str) -> Result<Amount, LedgerError> {
        let utxos = self.store.fetch_unspent_utxos(address, false)?;
        Amount::checked_sum(utxos.iter().map(|u| u.amount)).ok_or(LedgerError::AmountOverflow)
    }

    /// Inclusion proof for a live UTXO against the current root.
    pub fn prove_utxo(&self, tx_id: &str, output_index: u32) -> Option<MerkleProof> {
        self.tree.prove(&format!("{tx_id}:{output_index}"))
    }

    /// Apply a signed transaction.
    ///
    /// Returns `Ok(true)` when state moved, `Ok(false)` when the
    /// transaction was already committed (idempotent no-op). On any
    /// error nothing is mutated: the storage batch commits before the
    /// tree is touched.
    pub fn apply_transaction(&mut self, tx: &SignedTransaction) -> Result<bool, LedgerError> {
        if let Some(existing) = self.store.fetch_transaction(&tx.tx_id)? {
            if existing.block_height.is_some() {
                debug!("transaction {} already committed, skipping", tx.tx_id);
                return Ok(false);
            }
        }

        if !tx.verify_signature() {
            return Err(LedgerError::InvalidSignature);
        }

        let mut seen = std::collections::HashSet::new();
        for input in &tx.inputs {
            if !seen.insert(input.key()) {
                return Err(LedgerError::DuplicateInput(input.key()));
            }
        }

        let mut input_utxos = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let utxo = self
                .store
                .fetch_utxo(&input.tx_id, input.output_index)?
                .ok_or_else(|| LedgerError::InputNotFound(input.key()))?;
            if utxo.is_spent() {
                if self.was_applied(tx)? {
                    // Applied before a crash interrupted block commit;
                    // its effects are already in storage and the tree.
                    debug!("transaction {} resumed after crash", tx.tx_id);
                    return Ok(true);
                }
                return Err(LedgerError::InputSpent(input.key()));
            }
            if utxo.recipient != tx.sender {
                return Err(LedgerError::NotOwner(input.key()));
            }
            input_utxos.push(utxo);
        }

        let total_in = Amount::checked_sum(input_utxos.iter().map(|u| u.amount))
            .ok_or(LedgerError::AmountOverflow)?;
        let total_out = tx.total_output().ok_or(LedgerError::AmountOverflow)?;
        let spend = total_out
            .checked_add(tx.fee)
            .ok_or(LedgerError::AmountOverflow)?;
        if total_in < spend {
            return Err(LedgerError::InsufficientFunds {
                inputs: total_in,
                outputs: total_out,
                fee: tx.fee,
            });
        }
        if total_in > spend {
            return Err(LedgerError::Unbalanced {
                inputs: total_in,
                outputs: total_out,
                fee: tx.fee,
            });
        }

        self.store.write_applied_transaction(tx, &input_utxos)?;

        for input in &tx.inputs {
            self.tree.update(&input.key(), None);
        }
        for output in &tx.outputs {
            self.tree.update(
                &output.key(),
                Some(&canonical::utxo_leaf_value(&output.recipient, output.amount)),
            );
        }

        Ok(true)
    }

    /// Whether this exact transaction's effects already landed: output
    /// keys are content-addressed by `tx_id`, so they exist iff the
    /// transaction was applied.
    fn was_applied(&self, tx: &SignedTransaction) -> Result<bool, StoreError> {
        if self.store.fetch_transaction(&tx.tx_id)?.is_none() {
            return Ok(false);
        }
        for output in &tx.outputs {
            if self.store.fetch_utxo(&output.tx_id, output.output_index)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Mint a UTXO for a deposit observed on L1. Idempotent on the
    /// `(l1_tx_hash, recipient)` pair: a repeat returns `Ok(false)`
    /// without minting. No signature is checked; the external observer
    /// vouches for the event.
    pub fn process_deposit(
        &mut self,
        l1_tx_hash: &str,
        recipient: &str,
        amount: Amount,
        l1_height: u64,
        timestamp: u64,
    ) -> Result<bool, LedgerError> {
        if self.store.get_vault_deposit(l1_tx_hash, recipient)?.is_some() {
            debug!("deposit {l1_tx_hash} for {recipient} already processed");
            return Ok(false);
        }

        let deposit = VaultDeposit {
            l1_tx_hash: l1_tx_hash.to_string(),
            recipient: recipient.to_string(),
            amount,
            l1_height,
            timestamp,
            processed: true,
        };
        let minted = UTXO::new(format!("deposit:{l1_tx_hash}"), 0, recipient, amount);
        self.store.write_deposit(&deposit, &minted)?;
        self.tree.update(
            &minted.key(),
            Some(&canonical::utxo_leaf_value(&minted.recipient, minted.amount)),
        );
        info!("minted {} for {} from deposit {}", amount, recipient, l1_tx_hash);
        Ok(true)
    }

    /// Record a withdrawal row when a burn transaction leaves the
    /// rollup. No UTXO motion here; the burn happened when the
    /// withdrawal transaction was applied.
    pub fn record_withdrawal(&self, withdrawal: &VaultWithdrawal) -> Result<(), LedgerError> {
        self.store.insert_vault_withdrawal(withdrawal)?;
        Ok(())
    }

    /// Reflect L1 finality for a withdrawal. Returns false if the row
    /// is unknown.
    pub fn confirm_withdrawal(
        &self,
        rollup_tx_id: &str,
        l1_tx_hash: &str,
    ) -> Result<bool, LedgerError> {
        let updated = self.store.confirm_withdrawal(rollup_tx_id, l1_tx_hash)?;
        if !updated {
            warn!("withdrawal confirmation for unknown transaction {rollup_tx_id}");
        }
        Ok(updated)
    }

    /// Initialize an empty chain from genesis: mint the initial UTXOs
    /// and write block 0. A chain that already has block 0 is left
    /// untouched.
    pub fn load_genesis(
        &mut self,
        genesis: &GenesisState,
        fee_schedule_id: &str,
    ) -> Result<Option<Block>, LedgerError> {
        if self.store.get_block_by_height(0)?.is_some() {
            debug!("genesis block already present, skipping initialization");
            return Ok(None);
        }

        for (index, allocation) in genesis.utxos.iter().enumerate() {
            let utxo = UTXO::new("genesis", index as u32, &allocation.recipient, allocation.amount);
            self.store.insert_utxo(&utxo)?;
            self.tree.update(
                &utxo.key(),
                Some(&canonical::utxo_leaf_value(&utxo.recipient, utxo.amount)),
            );
        }

        let header = BlockHeader::new(
            0,
            GENESIS_PREV_HASH,
            self.tree.root(),
            genesis.timestamp,
            0,
            GENESIS_BLOB_REF,
            fee_schedule_id,
        );
        let block = Block {
            header,
            transactions: Vec::new(),
        };
        self.store.commit_block(&block)?;
        info!(
            "genesis initialized: {} UTXOs, state root {}",
            genesis.utxos.len(),
            block.header.state_root
        );
        Ok(Some(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Wallet;
    use crate::models::{GenesisUtxo, UTXORef};
    use crate::storage::DbConfig;
    use tempfile::tempdir;

    fn genesis_for(address: &str, amount: &str) -> GenesisState {
        let mut genesis = GenesisState::empty();
        genesis.timestamp = 1_700_000_000;
        genesis.utxos = vec![GenesisUtxo {
            recipient: address.to_string(),
            amount: amount.parse().unwrap(),
        }];
        genesis
    }

    fn booted(dir: &tempfile::TempDir, wallet: &Wallet) -> Ledger {
        let store = Store::open(DbConfig::at(dir.path().join("db"))).unwrap();
        let mut ledger = Ledger::boot(store).unwrap();
        ledger
            .load_genesis(&genesis_for(&wallet.address(), "10"), "fp6")
            .unwrap();
        ledger
    }

    fn transfer(
        wallet: &Wallet,
        to: &str,
        amount: &str,
        change: &str,
        fee: &str,
    ) -> SignedTransaction {
        SignedTransaction::create(
            wallet,
            vec![UTXORef::new("genesis", 0)],
            vec![
                (to.to_string(), amount.parse().unwrap()),
                (wallet.address(), change.parse().unwrap()),
            ],
            fee.parse().unwrap(),
            "00".repeat(32),
            1_700_000_100,
        )
    }

    #[test]
    fn genesis_writes_block_zero_once() {
        let dir = tempdir().unwrap();
        let wallet = Wallet::generate();
        let mut ledger = booted(&dir, &wallet);

        let block0 = ledger.store().get_block_by_height(0).unwrap().unwrap();
        assert_eq!(block0.header.prev_hash, GENESIS_PREV_HASH);
        assert_eq!(block0.header.blob_ref, GENESIS_BLOB_REF);
        assert_eq!(block0.header.tx_count, 0);
        assert_eq!(block0.header.state_root, ledger.state_root());

        // Re-running genesis is a no-op.
        assert!(ledger
            .load_genesis(&genesis_for(&wallet.address(), "10"), "fp6")
            .unwrap()
            .is_none());
        assert_eq!(ledger.balance(&wallet.address()).unwrap(), "10".parse().unwrap());
    }

    #[test]
    fn applies_a_balanced_transfer() {
        let dir = tempdir().unwrap();
        let wallet = Wallet::generate();
        let receiver = Wallet::generate();
        let mut ledger = booted(&dir, &wallet);
        let root_before = ledger.state_root();

        let tx = transfer(&wallet, &receiver.address(), "4", "5.99", "0.01");
        assert!(ledger.apply_transaction(&tx).unwrap());

        assert_eq!(ledger.balance(&receiver.address()).unwrap(), "4".parse().unwrap());
        assert_eq!(ledger.balance(&wallet.address()).unwrap(), "5.99".parse().unwrap());
        assert_ne!(ledger.state_root(), root_before);
        assert!(ledger
            .store()
            .fetch_utxo("genesis", 0)
            .unwrap()
            .unwrap()
            .is_spent());
    }

    #[test]
    fn rejects_each_invalid_shape() {
        let dir = tempdir().unwrap();
        let wallet = Wallet::generate();
        let stranger = Wallet::generate();
        let mut ledger = booted(&dir, &wallet);
        let root = ledger.state_root();

        // Bad signature: tamper after signing.
        let mut tampered = transfer(&wallet, &stranger.address(), "4", "5.99", "0.01");
        tampered.fee = "0.02".parse().unwrap();
        assert!(matches!(
            ledger.apply_transaction(&tampered),
            Err(LedgerError::InvalidSignature)
        ));

        // Unknown input.
        let ghost = SignedTransaction::create(
            &wallet,
            vec![UTXORef::new("ff".repeat(32), 0)],
            vec![(stranger.address(), "1".parse().unwrap())],
            Amount::ZERO,
            "00".repeat(32),
            1,
        );
        assert!(matches!(
            ledger.apply_transaction(&ghost),
            Err(LedgerError::InputNotFound(_))
        ));

        // Not the owner.
        let theft = SignedTransaction::create(
            &stranger,
            vec![UTXORef::new("genesis", 0)],
            vec![(stranger.address(), "10".parse().unwrap())],
            Amount::ZERO,
            "00".repeat(32),
            1,
        );
        assert!(matches!(
            ledger.apply_transaction(&theft),
            Err(LedgerError::NotOwner(_))
        ));

        // Duplicate inputs.
        let doubled = SignedTransaction::create(
            &wallet,
            vec![UTXORef::new("genesis", 0), UTXORef::new("genesis", 0)],
            vec![(stranger.address(), "20".parse().unwrap())],
            Amount::ZERO,
            "00".repeat(32),
            1,
        );
        assert!(matches!(
            ledger.apply_transaction(&doubled),
            Err(LedgerError::DuplicateInput(_))
        ));

        // Overdraw.
        let overdrawn = transfer(&wallet, &stranger.address(), "11", "0", "0.01");
        assert!(matches!(
            ledger.apply_transaction(&overdrawn),
            Err(LedgerError::InsufficientFunds { .. })
        ));

        // Surplus silently burned beyond the fee.
        let burning = SignedTransaction::create(
            &wallet,
            vec![UTXORef::new("genesis", 0)],
            vec![(stranger.address(), "4".parse().unwrap())],
            "0.01".parse().unwrap(),
            "00".repeat(32),
            1,
        );
        assert!(matches!(
            ledger.apply_transaction(&burning),
            Err(LedgerError::Unbalanced { .. })
        ));

        // Nothing moved.
        assert_eq!(ledger.state_root(), root);
        assert_eq!(ledger.balance(&wallet.address()).unwrap(), "10".parse().unwrap());
    }

    #[test]
    fn double_spend_fails_and_reapply_of_committed_is_a_no_op() {
        let dir = tempdir().unwrap();
        let wallet = Wallet::generate();
        let receiver = Wallet::generate();
        let mut ledger = booted(&dir, &wallet);

        let tx = transfer(&wallet, &receiver.address(), "4", "5.99", "0.01");
        assert!(ledger.apply_transaction(&tx).unwrap());

        // A competing spend of the same input loses.
        let rival = SignedTransaction::create(
            &wallet,
            vec![UTXORef::new("genesis", 0)],
            vec![(receiver.address(), "9.99".parse().unwrap())],
            "0.01".parse().unwrap(),
            "00".repeat(32),
            1_700_000_200,
        );
        assert!(matches!(
            ledger.apply_transaction(&rival),
            Err(LedgerError::InputSpent(_))
        ));

        // Once committed, re-applying the original is success-as-no-op.
        let mut committed = tx.clone();
        committed.block_height = Some(1);
        ledger.store().insert_transaction(&committed).unwrap();
        let root = ledger.state_root();
        assert!(!ledger.apply_transaction(&tx).unwrap());
        assert_eq!(ledger.state_root(), root);
    }

    #[test]
    fn applied_but_uncommitted_transaction_resumes_after_crash() {
        let dir = tempdir().unwrap();
        let wallet = Wallet::generate();
        let receiver = Wallet::generate();
        let tx = transfer(&wallet, &receiver.address(), "4", "5.99", "0.01");

        {
            let mut ledger = booted(&dir, &wallet);
            assert!(ledger.apply_transaction(&tx).unwrap());
            // Crash here: the block row carrying this tx never landed.
        }

        let store = Store::open(DbConfig::at(dir.path().join("db"))).unwrap();
        let mut ledger = Ledger::boot(store).unwrap();
        let root = ledger.state_root();
        // Re-application recognizes the prior effects instead of
        // reporting a spent input.
        assert!(ledger.apply_transaction(&tx).unwrap());
        assert_eq!(ledger.state_root(), root);
    }

    #[test]
    fn fresh_boot_reproduces_the_state_root() {
        let dir = tempdir().unwrap();
        let wallet = Wallet::generate();
        let receiver = Wallet::generate();
        let root_after_tx;
        {
            let mut ledger = booted(&dir, &wallet);
            let tx = transfer(&wallet, &receiver.address(), "4", "5.99", "0.01");
            ledger.apply_transaction(&tx).unwrap();
            root_after_tx = ledger.state_root();
        }
        let store = Store::open(DbConfig::at(dir.path().join("db"))).unwrap();
        let rebooted = Ledger::boot(store).unwrap();
        assert_eq!(rebooted.state_root(), root_after_tx);
    }

    #[test]
    fn deposits_mint_once() {
        let dir = tempdir().unwrap();
        let wallet = Wallet::generate();
        let receiver = Wallet::generate();
        let mut ledger = booted(&dir, &wallet);

        let amount: Amount = "2.5".parse().unwrap();
        assert!(ledger
            .process_deposit("0xabcd", &receiver.address(), amount, 120, 1_700_000_000)
            .unwrap());
        assert!(!ledger
            .process_deposit("0xabcd", &receiver.address(), amount, 120, 1_700_000_000)
            .unwrap());

        assert_eq!(ledger.balance(&receiver.address()).unwrap(), amount);
        let minted = ledger.store().fetch_utxo("deposit:0xabcd", 0).unwrap().unwrap();
        assert_eq!(minted.amount, amount);
        assert!(ledger.prove_utxo("deposit:0xabcd", 0).is_some());
    }
}
