//! Typed table surface over the column families.
//!
//! Rows are JSON documents keyed as: UTXOs by `"<tx_id>:<index>"`,
//! transactions by id, blocks by big-endian height (so height order is
//! key order), deposits by `"<l1_tx_hash>:<recipient>"`, withdrawals by
//! rollup transaction id. Composite mutations (transaction application,
//! block commit, deposit mint) are single write batches.

use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    Block, ReceiptProof, SignedTransaction, UtxoStatus, VaultDeposit, VaultWithdrawal, UTXO,
};
use crate::storage::schema::{cf_names, DatabaseManager, DbConfig};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("corrupt {table} row {key}: {reason}")]
    Corrupt {
        table: &'static str,
        key: String,
        reason: String,
    },
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(format!("{err:#}"))
    }
}

/// Stored block row: the block plus its DA commitment flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockRow {
    block: Block,
    committed: bool,
}

#[derive(Clone)]
pub struct Store {
    db: DatabaseManager,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Backend(e.to_string()))
}

fn decode<T: DeserializeOwned>(
    table: &'static str,
    key: &str,
    bytes: &[u8],
) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        table,
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn block_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

impl Store {
    pub fn open(config: DbConfig) -> anyhow::Result<Self> {
        Ok(Self {
            db: DatabaseManager::open(config)?,
        })
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    // ── UTXOs ──────────────────────────────────────────────────────────

    pub fn insert_utxo(&self, utxo: &UTXO) -> Result<(), StoreError> {
        self.db
            .put_cf(cf_names::UTXOS, utxo.key().as_bytes(), &encode(utxo)?)?;
        Ok(())
    }

    pub fn fetch_utxo(&self, tx_id: &str, output_index: u32) -> Result<Option<UTXO>, StoreError> {
        let key = format!("{tx_id}:{output_index}");
        match self.db.get_cf(cf_names::UTXOS, key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(cf_names::UTXOS, &key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Flip a UTXO to spent. Returns false if the row is absent.
    pub fn mark_utxo_spent(&self, tx_id: &str, output_index: u32) -> Result<bool, StoreError> {
        match self.fetch_utxo(tx_id, output_index)? {
            Some(mut utxo) => {
                utxo.status = UtxoStatus::Spent;
                self.insert_utxo(&utxo)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Every unspent UTXO, for booting the state tree.
    pub fn fetch_all_unspent_utxos(&self) -> Result<Vec<UTXO>, StoreError> {
        let mut utxos = Vec::new();
        for item in self.db.iterate_cf(cf_names::UTXOS)? {
            let (key, value) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let utxo: UTXO = decode(cf_names::UTXOS, &key, &value)?;
            if !utxo.is_spent() {
                utxos.push(utxo);
            }
        }
        Ok(utxos)
    }

    /// Unspent UTXOs owned by an address. With `exclude_pending`, UTXOs
    /// already referenced as input by an uncommitted transaction are
    /// filtered out (they are spoken for even though no block spent
    /// them yet).
    pub fn fetch_unspent_utxos(
        &self,
        address: &str,
        exclude_pending: bool,
    ) -> Result<Vec<UTXO>, StoreError> {
        let reserved: HashSet<String> = if exclude_pending {
            self.fetch_all_uncommitted_transactions()?
                .iter()
                .flat_map(|tx| tx.input_keys())
                .collect()
        } else {
            HashSet::new()
        };
        let mut utxos: Vec<UTXO> = self
            .fetch_all_unspent_utxos()?
            .into_iter()
            .filter(|u| u.recipient == address && !reserved.contains(&u.key()))
            .collect();
        utxos.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(utxos)
    }

    // ── Transactions ───────────────────────────────────────────────────

    pub fn insert_transaction(&self, tx: &SignedTransaction) -> Result<(), StoreError> {
        self.db
            .put_cf(cf_names::TRANSACTIONS, tx.tx_id.as_bytes(), &encode(tx)?)?;
        Ok(())
    }

    pub fn fetch_transaction(&self, tx_id: &str) -> Result<Option<SignedTransaction>, StoreError> {
        match self.db.get_cf(cf_names::TRANSACTIONS, tx_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(cf_names::TRANSACTIONS, tx_id, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_transaction(&self, tx_id: &str) -> Result<(), StoreError> {
        self.db.delete_cf(cf_names::TRANSACTIONS, tx_id.as_bytes())?;
        Ok(())
    }

    pub fn fetch_all_uncommitted_transactions(&self) -> Result<Vec<SignedTransaction>, StoreError> {
        let mut txs = Vec::new();
        for item in self.db.iterate_cf(cf_names::TRANSACTIONS)? {
            let (key, value) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let tx: SignedTransaction = decode(cf_names::TRANSACTIONS, &key, &value)?;
            if tx.block_height.is_none() {
                txs.push(tx);
            }
        }
        // Oldest first; id as a stable tiebreak.
        txs.sort_by(|a, b| (a.timestamp, &a.tx_id).cmp(&(b.timestamp, &b.tx_id)));
        Ok(txs)
    }

    pub fn fetch_uncommitted_transactions(
        &self,
        limit: usize,
    ) -> Result<Vec<SignedTransaction>, StoreError> {
        let mut txs = self.fetch_all_uncommitted_transactions()?;
        txs.truncate(limit);
        Ok(txs)
    }

    /// Stage one applied transaction atomically: inputs flip to spent,
    /// the transaction row lands (still uncommitted), outputs are born
    /// unspent.
    pub fn write_applied_transaction(
        &self,
        tx: &SignedTransaction,
        spent_inputs: &[UTXO],
    ) -> Result<(), StoreError> {
        let mut batch = self.db.batch();
        let utxos_cf = self.db.cf(cf_names::UTXOS)?;
        let txs_cf = self.db.cf(cf_names::TRANSACTIONS)?;

        for input in spent_inputs {
            let mut spent = input.clone();
            spent.status = UtxoStatus::Spent;
            batch.put_cf(utxos_cf, spent.key().as_bytes(), encode(&spent)?);
        }
        batch.put_cf(txs_cf, tx.tx_id.as_bytes(), encode(tx)?);
        for output in &tx.outputs {
            batch.put_cf(utxos_cf, output.key().as_bytes(), encode(output)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    // ── Blocks ─────────────────────────────────────────────────────────

    /// Persist a block and mark its transactions committed, in one
    /// batch. Blocks are immutable: a pre-existing row at this height
    /// wins and the write is a no-op (returns false).
    pub fn commit_block(&self, block: &Block) -> Result<bool, StoreError> {
        let height = block.header.height;
        if self.get_block_by_height(height)?.is_some() {
            return Ok(false);
        }
        let mut batch = self.db.batch();
        let blocks_cf = self.db.cf(cf_names::BLOCKS)?;
        let txs_cf = self.db.cf(cf_names::TRANSACTIONS)?;

        let row = BlockRow {
            block: block.clone(),
            committed: false,
        };
        batch.put_cf(blocks_cf, block_key(height), encode(&row)?);
        for tx in &block.transactions {
            let mut committed = tx.clone();
            committed.block_height = Some(height);
            batch.put_cf(txs_cf, committed.tx_id.as_bytes(), encode(&committed)?);
        }
        self.db.write(batch)?;
        Ok(true)
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, StoreError> {
        match self.db.get_cf(cf_names::BLOCKS, &block_key(height))? {
            Some(bytes) => {
                let row: BlockRow = decode(cf_names::BLOCKS, &height.to_string(), &bytes)?;
                Ok(Some(row.block))
            }
            None => Ok(None),
        }
    }

    pub fn get_latest_block(&self) -> Result<Option<Block>, StoreError> {
        match self.db.iterate_cf_reverse(cf_names::BLOCKS)?.next() {
            Some(item) => {
                let (key, value) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
                let key = String::from_utf8_lossy(&key).into_owned();
                let row: BlockRow = decode(cf_names::BLOCKS, &key, &value)?;
                Ok(Some(row.block))
            }
            None => Ok(None),
        }
    }

    /// Attach the DA blob reference to a committed block. Set once: a
    /// block that already carries a reference is left untouched
    /// (returns false).
    pub fn update_block_blob_ref(&self, height: u64, blob_ref: &str) -> Result<bool, StoreError> {
        let Some(bytes) = self.db.get_cf(cf_names::BLOCKS, &block_key(height))? else {
            return Ok(false);
        };
        let mut row: BlockRow = decode(cf_names::BLOCKS, &height.to_string(), &bytes)?;
        if !row.block.header.blob_ref.is_empty() {
            return Ok(false);
        }
        row.block.header.blob_ref = blob_ref.to_string();
        row.committed = true;
        self.db
            .put_cf(cf_names::BLOCKS, &block_key(height), &encode(&row)?)?;
        Ok(true)
    }

    /// Blocks awaiting DA attachment, lowest height first.
    pub fn fetch_blocks_missing_blob_ref(&self) -> Result<Vec<Block>, StoreError> {
        let mut blocks = Vec::new();
        for item in self.db.iterate_cf(cf_names::BLOCKS)? {
            let (key, value) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let row: BlockRow = decode(cf_names::BLOCKS, &key, &value)?;
            if row.block.header.blob_ref.is_empty() {
                blocks.push(row.block);
            }
        }
        Ok(blocks)
    }

    // ── Vault deposits ─────────────────────────────────────────────────

    pub fn get_vault_deposit(
        &self,
        l1_tx_hash: &str,
        recipient: &str,
    ) -> Result<Option<VaultDeposit>, StoreError> {
        let key = crate::models::vault::deposit_key(l1_tx_hash, recipient);
        match self.db.get_cf(cf_names::VAULT_DEPOSITS, key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(cf_names::VAULT_DEPOSITS, &key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Record a processed deposit and its minted UTXO atomically.
    pub fn write_deposit(&self, deposit: &VaultDeposit, minted: &UTXO) -> Result<(), StoreError> {
        let mut batch = self.db.batch();
        let deposits_cf = self.db.cf(cf_names::VAULT_DEPOSITS)?;
        let utxos_cf = self.db.cf(cf_names::UTXOS)?;
        batch.put_cf(deposits_cf, deposit.key().as_bytes(), encode(deposit)?);
        batch.put_cf(utxos_cf, minted.key().as_bytes(), encode(minted)?);
        self.db.write(batch)?;
        Ok(())
    }

    // ── Vault withdrawals ──────────────────────────────────────────────

    pub fn insert_vault_withdrawal(&self, withdrawal: &VaultWithdrawal) -> Result<(), StoreError> {
        self.db.put_cf(
            cf_names::VAULT_WITHDRAWALS,
            withdrawal.rollup_tx_id.as_bytes(),
            &encode(withdrawal)?,
        )?;
        Ok(())
    }

    pub fn get_vault_withdrawal(
        &self,
        rollup_tx_id: &str,
    ) -> Result<Option<VaultWithdrawal>, StoreError> {
        match self
            .db
            .get_cf(cf_names::VAULT_WITHDRAWALS, rollup_tx_id.as_bytes())?
        {
            Some(bytes) => Ok(Some(decode(cf_names::VAULT_WITHDRAWALS, rollup_tx_id, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Mark a withdrawal confirmed on L1. Returns false if no such row.
    pub fn confirm_withdrawal(
        &self,
        rollup_tx_id: &str,
        l1_tx_hash: &str,
    ) -> Result<bool, StoreError> {
        match self.get_vault_withdrawal(rollup_tx_id)? {
            Some(mut withdrawal) => {
                withdrawal.l1_tx_hash = Some(l1_tx_hash.to_string());
                withdrawal.l1_confirmed = true;
                self.insert_vault_withdrawal(&withdrawal)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Receipts ───────────────────────────────────────────────────────

    pub fn insert_receipt(&self, receipt: &ReceiptProof) -> Result<(), StoreError> {
        self.db.put_cf(
            cf_names::RECEIPTS,
            receipt.id().as_bytes(),
            &encode(receipt)?,
        )?;
        Ok(())
    }

    pub fn fetch_receipt(&self, receipt_id: &str) -> Result<Option<ReceiptProof>, StoreError> {
        match self.db.get_cf(cf_names::RECEIPTS, receipt_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(cf_names::RECEIPTS, receipt_id, &bytes)?)),
            None => Ok(None),
        }
    }
}
