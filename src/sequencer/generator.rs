//! The block generator: one long-lived task that turns pending
//! transactions into blocks.
//!
//! Two concerns live here. *When*: the trigger policy, polled every
//! 100 ms. *How*: snapshot, topological sort, apply through the ledger,
//! seal, commit, submit to DA. DA failure never rolls anything back:
//! a block is canonical the moment its row commits; the blob reference
//! is metadata attached later by this task or the poster.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::NodeConfig;
use crate::da::DaClient;
use crate::ledger::Ledger;
use crate::models::{Block, BlockHeader, SignedTransaction, GENESIS_PREV_HASH};
use crate::notifications::{NotificationBus, NotificationKind};
use crate::sequencer::admission::Admission;
use crate::sequencer::dag;
use crate::storage::Store;
use crate::utils::unix_now;

/// Trigger poll period.
const TICK: Duration = Duration::from_millis(100);

/// Purge cadence, in ticks (~5 s).
const PURGE_EVERY_TICKS: u32 = 50;

pub struct BlockGenerator {
    ledger: Arc<Mutex<Ledger>>,
    admission: Arc<Admission>,
    da: Arc<DaClient>,
    bus: Arc<NotificationBus>,
    store: Store,
    stop: Arc<AtomicBool>,
    block_interval: Duration,
    max_block_transactions: usize,
    min_batch_threshold: usize,
    fee_schedule_id: String,
}

impl BlockGenerator {
    pub fn new(
        ledger: Arc<Mutex<Ledger>>,
        admission: Arc<Admission>,
        da: Arc<DaClient>,
        bus: Arc<NotificationBus>,
        store: Store,
        stop: Arc<AtomicBool>,
        config: &NodeConfig,
    ) -> Self {
        info!(
            "block generator initialized: interval {}s, max {} tx/block",
            config.block_interval_secs, config.max_block_transactions
        );
        Self {
            ledger,
            admission,
            da,
            bus,
            store,
            stop,
            block_interval: Duration::from_secs(config.block_interval_secs),
            max_block_transactions: config.max_block_transactions,
            min_batch_threshold: config.min_batch_threshold,
            fee_schedule_id: config.fee_schedule_id.clone(),
        }
    }

    /// The cadence loop. Runs until the stop flag is raised; a round
    /// already past the apply step finishes its commit before exit.
    pub async fn run(&self) {
        self.admission.merge_from_storage();
        let mut last_block = Instant::now();
        let mut ticks: u32 = 0;
        info!("block generation loop started");

        while !self.stop.load(Ordering::Relaxed) {
            tokio::time::sleep(TICK).await;
            ticks = ticks.wrapping_add(1);

            if ticks % PURGE_EVERY_TICKS == 0 {
                if let Err(err) = self.purge_invalid_transactions().await {
                    error!("purge pass failed: {err:#}");
                }
            }

            if !self.should_assemble(last_block.elapsed()) {
                continue;
            }
            match self.generate_block().await {
                Ok(Some(block)) => {
                    last_block = Instant::now();
                    debug!(
                        "round produced block {} ({} tx)",
                        block.header.height, block.header.tx_count
                    );
                }
                Ok(None) => {}
                Err(err) => error!("block generation failed: {err:#}"),
            }
        }
        info!("block generation loop stopped");
    }

    /// Trigger policy: capacity, batch threshold after 2× interval,
    /// force flush after 5× interval, or an elapsed batch-mode window.
    fn should_assemble(&self, since_last: Duration) -> bool {
        let pending = self.admission.pending_count();
        if pending == 0 {
            return false;
        }
        if pending >= self.max_block_transactions {
            return true;
        }
        if pending >= self.min_batch_threshold && since_last >= self.block_interval * 2 {
            return true;
        }
        if since_last >= self.block_interval * 5 {
            return true;
        }
        self.admission.batch_window_elapsed()
    }

    /// Assemble one block from the current pending set.
    ///
    /// Returns `Ok(None)` when the round ends without a block (nothing
    /// pending, or nothing applied). Transactions that fail to apply
    /// are skipped, never abort the block; permanently invalid rows are
    /// deleted on the spot.
    pub async fn generate_block(&self) -> Result<Option<Block>> {
        // The snapshot folds in persisted uncommitted rows, so a cold
        // start with an empty in-memory queue still drains storage.
        self.admission.merge_from_storage();
        let pending = self.admission.pending_snapshot(self.max_block_transactions);
        if pending.is_empty() {
            return Ok(None);
        }

        let mut ledger = self.ledger.lock().await;

        let latest = ledger.store().get_latest_block()?;
        let (height, prev_hash) = match &latest {
            Some(block) => (block.header.height + 1, block.header.hash.clone()),
            None => (0, GENESIS_PREV_HASH.to_string()),
        };

        let (order, _cycled) = dag::topological_order(&pending);

        let mut applied: Vec<SignedTransaction> = Vec::new();
        let mut drop_ids: Vec<String> = Vec::new();
        for position in order {
            let tx = &pending[position];
            match ledger.apply_transaction(tx) {
                Ok(true) => {
                    let mut included = tx.clone();
                    included.block_height = Some(height);
                    applied.push(included);
                    self.bus.notify(
                        NotificationKind::TransactionIncluded,
                        json!({
                            "tx_id": tx.tx_id.clone(),
                            "height": height,
                            "sender": tx.sender.clone(),
                        }),
                    );
                }
                Ok(false) => {
                    // Already committed at some height; just drop it
                    // from the queue.
                    drop_ids.push(tx.tx_id.clone());
                }
                Err(err) if err.is_permanent() => {
                    warn!("dropping invalid transaction {}: {err}", tx.tx_id);
                    if let Err(delete_err) = self.store.delete_transaction(&tx.tx_id) {
                        error!("failed to delete invalid row {}: {delete_err}", tx.tx_id);
                    }
                    drop_ids.push(tx.tx_id.clone());
                }
                Err(err) => {
                    // May succeed in a later round (e.g. the producer of
                    // its input has not been admitted yet); leave queued.
                    warn!("skipping transaction {} this round: {err}", tx.tx_id);
                }
            }
        }

        if applied.is_empty() {
            drop(ledger);
            self.admission.remove_pending(&drop_ids);
            debug!("round applied nothing, no block produced");
            return Ok(None);
        }

        let state_root = ledger.state_root();
        let header = BlockHeader::new(
            height,
            prev_hash,
            state_root,
            unix_now(),
            applied.len() as u32,
            "",
            self.fee_schedule_id.clone(),
        );
        let block = Block {
            header,
            transactions: applied,
        };

        // A pre-existing row at this height wins; blocks are immutable
        // and the write is not retried.
        let inserted = ledger.store().commit_block(&block)?;
        drop(ledger);

        drop_ids.extend(block.transactions.iter().map(|tx| tx.tx_id.clone()));
        self.admission.remove_pending(&drop_ids);

        if !inserted {
            warn!("block {} already existed, skipping duplicate round", block.header.height);
            return Ok(None);
        }

        info!(
            "generated block {} with {} transaction(s), state root {}",
            block.header.height, block.header.tx_count, block.header.state_root
        );
        self.bus.notify(
            NotificationKind::BlockCreated,
            json!({
                "height": block.header.height,
                "hash": block.header.hash.clone(),
                "tx_count": block.header.tx_count,
                "state_root": block.header.state_root.clone(),
            }),
        );

        self.submit_to_da(&block).await;
        Ok(Some(block))
    }

    /// Submit a freshly committed block to the DA layer. Failure is
    /// logged and left to the poster's retry scan.
    async fn submit_to_da(&self, block: &Block) {
        match self.da.post_block(block).await {
            Ok(Some(blob_ref)) => {
                self.bus.notify(
                    NotificationKind::BlockSubmittedToDa,
                    json!({ "height": block.header.height, "blob_ref": blob_ref.clone() }),
                );
                match self.store.update_block_blob_ref(block.header.height, &blob_ref) {
                    Ok(true) => {
                        self.bus.notify(
                            NotificationKind::BlockCommittedToDa,
                            json!({ "height": block.header.height, "blob_ref": blob_ref }),
                        );
                    }
                    Ok(false) => {
                        debug!("block {} already carries a blob reference", block.header.height)
                    }
                    Err(err) => error!(
                        "failed to record blob reference for block {}: {err}",
                        block.header.height
                    ),
                }
            }
            Ok(None) => debug!(
                "DA disconnected; block {} awaits later attachment",
                block.header.height
            ),
            Err(err) => error!(
                "DA submission for block {} failed: {err}; poster will retry",
                block.header.height
            ),
        }
    }

    /// Remove uncommitted rows that can never commit: inputs spent or
    /// missing with no pending producer, or contested by an earlier
    /// uncommitted transaction outside their own dependency chain.
    /// Consumers of a doomed producer cascade.
    pub async fn purge_invalid_transactions(&self) -> Result<usize> {
        let ledger = self.ledger.lock().await;
        let pending = ledger.store().fetch_uncommitted_transactions(1000)?;
        if pending.is_empty() {
            return Ok(0);
        }

        let producers = dag::batch_producers(&pending);
        let mut doomed: HashSet<usize> = HashSet::new();
        let mut claimed: HashMap<String, usize> = HashMap::new();

        for (position, tx) in pending.iter().enumerate() {
            for input in &tx.inputs {
                let key = input.key();
                match ledger.store().fetch_utxo(&input.tx_id, input.output_index)? {
                    Some(utxo) if utxo.is_spent() => {
                        // Spent by this very transaction pre-crash is
                        // fine; the ledger resumes it. Spent by anyone
                        // else is fatal.
                        if !producers.contains_key(&key)
                            && !pending_tx_was_applied(&ledger, tx)?
                        {
                            doomed.insert(position);
                        }
                    }
                    Some(_) => {
                        // Live, but maybe contested: first claimant (the
                        // oldest, given fetch order) survives.
                        if let Some(&winner) = claimed.get(&key) {
                            if winner != position {
                                doomed.insert(position);
                            }
                        } else {
                            claimed.insert(key, position);
                        }
                    }
                    None => {
                        // Tolerable only when an uncommitted batchmate
                        // produces it.
                        if !producers.contains_key(&key) {
                            doomed.insert(position);
                        }
                    }
                }
            }
        }

        // Cascade: a transaction chained on a doomed producer is doomed.
        loop {
            let mut grew = false;
            for (position, tx) in pending.iter().enumerate() {
                if doomed.contains(&position) {
                    continue;
                }
                for input in &tx.inputs {
                    if let Some(producer) = producers.get(&input.key()) {
                        if doomed.contains(producer) {
                            doomed.insert(position);
                            grew = true;
                            break;
                        }
                    }
                }
            }
            if !grew {
                break;
            }
        }

        let mut purged_ids = Vec::with_capacity(doomed.len());
        for &position in &doomed {
            let tx_id = &pending[position].tx_id;
            ledger.store().delete_transaction(tx_id)?;
            purged_ids.push(tx_id.clone());
        }
        drop(ledger);

        if !purged_ids.is_empty() {
            info!("purged {} unapplyable transaction(s)", purged_ids.len());
            self.admission.remove_pending(&purged_ids);
        }
        Ok(purged_ids.len())
    }
}

/// Whether an uncommitted row's effects already landed (its outputs
/// exist), meaning it was applied before a crash interrupted block
/// commit and must not be purged.
fn pending_tx_was_applied(ledger: &Ledger, tx: &SignedTransaction) -> Result<bool> {
    for output in &tx.outputs {
        if ledger
            .store()
            .fetch_utxo(&output.tx_id, output.output_index)?
            .is_none()
        {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Wallet;
    use crate::models::{GenesisState, GenesisUtxo, UTXORef};
    use crate::storage::DbConfig;
    use tempfile::tempdir;

    struct Harness {
        _dir: tempfile::TempDir,
        generator: BlockGenerator,
        admission: Arc<Admission>,
        ledger: Arc<Mutex<Ledger>>,
        alice: Wallet,
    }

    async fn harness(genesis_amount: &str) -> Harness {
        let dir = tempdir().unwrap();
        let store = Store::open(DbConfig::at(dir.path().join("db"))).unwrap();
        let bus = Arc::new(NotificationBus::new());
        let config = NodeConfig::default();
        let alice = Wallet::generate();

        let mut ledger = Ledger::boot(store.clone()).unwrap();
        let mut genesis = GenesisState::empty();
        genesis.utxos = vec![GenesisUtxo {
            recipient: alice.address(),
            amount: genesis_amount.parse().unwrap(),
        }];
        ledger.load_genesis(&genesis, &config.fee_schedule_id).unwrap();
        let ledger = Arc::new(Mutex::new(ledger));

        let admission = Arc::new(Admission::new(store.clone(), bus.clone(), &config));
        let da = Arc::new(DaClient::new(&config, bus.clone()));
        let generator = BlockGenerator::new(
            ledger.clone(),
            admission.clone(),
            da,
            bus,
            store,
            Arc::new(AtomicBool::new(false)),
            &config,
        );
        Harness {
            _dir: dir,
            generator,
            admission,
            ledger,
            alice,
        }
    }

    fn spend(
        wallet: &Wallet,
        input: UTXORef,
        outputs: Vec<(String, &str)>,
        timestamp: u64,
    ) -> SignedTransaction {
        SignedTransaction::create(
            wallet,
            vec![input],
            outputs
                .into_iter()
                .map(|(to, amount)| (to, amount.parse().unwrap()))
                .collect(),
            "0.01".parse().unwrap(),
            "00".repeat(32),
            timestamp,
        )
    }

    #[tokio::test]
    async fn empty_queue_produces_no_block() {
        let h = harness("10").await;
        assert!(h.generator.generate_block().await.unwrap().is_none());
        assert!(h
            .ledger
            .lock()
            .await
            .store()
            .get_block_by_height(1)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn single_transfer_forms_block_one() {
        let h = harness("10").await;
        let bob = Wallet::generate();
        let tx = spend(
            &h.alice,
            UTXORef::new("genesis", 0),
            vec![(bob.address(), "4"), (h.alice.address(), "5.99")],
            1_700_000_000,
        );
        assert!(h.admission.admit(tx).is_accepted());

        let block = h.generator.generate_block().await.unwrap().unwrap();
        assert_eq!(block.header.height, 1);
        assert_eq!(block.header.tx_count, 1);

        let ledger = h.ledger.lock().await;
        assert_eq!(ledger.balance(&bob.address()).unwrap(), "4".parse().unwrap());
        assert_eq!(
            ledger.balance(&h.alice.address()).unwrap(),
            "5.99".parse().unwrap()
        );
        let block0 = ledger.store().get_block_by_height(0).unwrap().unwrap();
        assert_eq!(block.header.prev_hash, block0.header.hash);
        assert_eq!(h.admission.pending_count(), 0);
    }

    #[tokio::test]
    async fn chained_pair_lands_in_one_block_in_order() {
        let h = harness("10").await;
        let bob = Wallet::generate();
        let carol = Wallet::generate();

        let first = spend(
            &h.alice,
            UTXORef::new("genesis", 0),
            vec![(bob.address(), "4"), (h.alice.address(), "5.99")],
            1_700_000_000,
        );
        let second = spend(
            &bob,
            UTXORef::new(first.tx_id.clone(), 0),
            vec![(carol.address(), "3"), (bob.address(), "0.99")],
            1_700_000_001,
        );
        // Admit in reverse to prove ordering comes from the DAG.
        assert!(h.admission.admit(second.clone()).is_accepted());
        assert!(h.admission.admit(first.clone()).is_accepted());

        let block = h.generator.generate_block().await.unwrap().unwrap();
        assert_eq!(block.header.tx_count, 2);
        assert_eq!(block.transactions[0].tx_id, first.tx_id);
        assert_eq!(block.transactions[1].tx_id, second.tx_id);

        let ledger = h.ledger.lock().await;
        assert_eq!(ledger.balance(&carol.address()).unwrap(), "3".parse().unwrap());
        assert_eq!(ledger.balance(&bob.address()).unwrap(), "0.99".parse().unwrap());
    }

    #[tokio::test]
    async fn double_spend_keeps_exactly_one() {
        let h = harness("10").await;
        let bob = Wallet::generate();
        let carol = Wallet::generate();

        let honest = spend(
            &h.alice,
            UTXORef::new("genesis", 0),
            vec![(bob.address(), "4"), (h.alice.address(), "5.99")],
            1_700_000_000,
        );
        let rival = spend(
            &h.alice,
            UTXORef::new("genesis", 0),
            vec![(carol.address(), "7"), (h.alice.address(), "2.99")],
            1_700_000_001,
        );
        assert!(h.admission.admit(honest.clone()).is_accepted());
        assert!(h.admission.admit(rival.clone()).is_accepted());

        let block = h.generator.generate_block().await.unwrap().unwrap();
        assert_eq!(block.header.tx_count, 1);
        assert_eq!(block.transactions[0].tx_id, honest.tx_id);

        // The loser is purged; total supply only dropped by the fee.
        h.generator.purge_invalid_transactions().await.unwrap();
        let ledger = h.ledger.lock().await;
        assert!(ledger.store().fetch_transaction(&rival.tx_id).unwrap().is_none());
        let total = crate::amount::Amount::checked_sum(
            ledger
                .store()
                .fetch_all_unspent_utxos()
                .unwrap()
                .iter()
                .map(|u| u.amount),
        )
        .unwrap();
        assert_eq!(total, "9.99".parse().unwrap());
    }

    #[tokio::test]
    async fn overdraft_produces_no_block_and_is_deleted() {
        let h = harness("10").await;
        let bob = Wallet::generate();
        let overdraft = spend(
            &h.alice,
            UTXORef::new("genesis", 0),
            vec![(bob.address(), "11")],
            1_700_000_000,
        );
        let tx_id = overdraft.tx_id.clone();
        assert!(h.admission.admit(overdraft).is_accepted());

        assert!(h.generator.generate_block().await.unwrap().is_none());
        let ledger = h.ledger.lock().await;
        assert!(ledger.store().get_block_by_height(1).unwrap().is_none());
        assert!(ledger.store().fetch_transaction(&tx_id).unwrap().is_none());
        assert_eq!(h.admission.pending_count(), 0);
    }

    #[tokio::test]
    async fn purge_spares_dependency_chains() {
        let h = harness("10").await;
        let bob = Wallet::generate();
        let first = spend(
            &h.alice,
            UTXORef::new("genesis", 0),
            vec![(bob.address(), "4"), (h.alice.address(), "5.99")],
            1_700_000_000,
        );
        // Consumes an output that does not exist yet: producer pending.
        let second = spend(
            &bob,
            UTXORef::new(first.tx_id.clone(), 0),
            vec![(h.alice.address(), "3.99")],
            1_700_000_001,
        );
        // References an output nobody pending produces.
        let orphan = spend(
            &h.alice,
            UTXORef::new("ff".repeat(32), 0),
            vec![(bob.address(), "1")],
            1_700_000_002,
        );
        h.admission.admit(first.clone());
        h.admission.admit(second.clone());
        let orphan_id = orphan.tx_id.clone();
        h.admission.admit(orphan);

        assert_eq!(h.generator.purge_invalid_transactions().await.unwrap(), 1);
        let ledger = h.ledger.lock().await;
        assert!(ledger.store().fetch_transaction(&orphan_id).unwrap().is_none());
        assert!(ledger.store().fetch_transaction(&first.tx_id).unwrap().is_some());
        assert!(ledger.store().fetch_transaction(&second.tx_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_cascades_through_doomed_producers() {
        let h = harness("10").await;
        let bob = Wallet::generate();
        // Parent spends a nonexistent input, child chains on the parent.
        let parent = spend(
            &h.alice,
            UTXORef::new("ee".repeat(32), 0),
            vec![(bob.address(), "1")],
            1_700_000_000,
        );
        let child = spend(
            &bob,
            UTXORef::new(parent.tx_id.clone(), 0),
            vec![(h.alice.address(), "0.99")],
            1_700_000_001,
        );
        h.admission.admit(parent.clone());
        h.admission.admit(child.clone());

        assert_eq!(h.generator.purge_invalid_transactions().await.unwrap(), 2);
        assert_eq!(h.admission.pending_count(), 0);
    }
}
