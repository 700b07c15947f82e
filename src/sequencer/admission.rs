//! Fast-path transaction admission.
//!
//! Admission gives the only synchronous feedback a client ever gets,
//! so it stays cheap: fee floor, id recomputation, signature, structure
//! and duplicate checks. It never takes the ledger lock or looks up inputs
//! (an admitted transaction may chain on the outputs of another one
//! still waiting in the same batch). Accepted transactions are
//! persisted uncommitted and appended to the in-memory pending queue
//! the block generator drains.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;

use crate::amount::Amount;
use crate::config::NodeConfig;
use crate::models::SignedTransaction;
use crate::notifications::{NotificationBus, NotificationKind};
use crate::storage::Store;

/// A sender seen again within this window arms batch mode.
const BATCH_SENDER_WINDOW: Duration = Duration::from_secs(5);

/// How long batch mode collects before the generator flushes.
const BATCH_COLLECTION_WINDOW: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("transaction fee {fee} is below the minimum {minimum}")]
    FeeBelowFloor { fee: Amount, minimum: Amount },
    #[error("invalid transaction signature")]
    InvalidSignature,
    #[error("transaction is already pending")]
    DuplicatePending,
    #[error("malformed transaction: {0}")]
    Malformed(String),
    #[error("storage unavailable")]
    Storage,
}

#[derive(Debug)]
pub enum AdmissionResult {
    /// Queued for the next block; all further progress is asynchronous.
    Accepted {
        tx_id: String,
        latency: Duration,
        /// Worst-case seconds until block inclusion.
        estimated_block_secs: u64,
    },
    Rejected {
        tx_id: String,
        reason: AdmissionError,
    },
}

impl AdmissionResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AdmissionResult::Accepted { .. })
    }
}

/// Aggregate view over the pending queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStats {
    pub count: usize,
    pub total_fees: Amount,
    pub oldest_timestamp: Option<u64>,
}

struct PendingState {
    queue: Vec<SignedTransaction>,
    ids: HashSet<String>,
    last_seen_sender: HashMap<String, Instant>,
    batch_deadline: Option<Instant>,
}

pub struct Admission {
    store: Store,
    bus: Arc<NotificationBus>,
    minimum_fee: Amount,
    block_interval_secs: u64,
    state: Mutex<PendingState>,
}

impl Admission {
    pub fn new(store: Store, bus: Arc<NotificationBus>, config: &NodeConfig) -> Self {
        info!(
            "admission initialized: minimum fee {}, block interval {}s",
            config.minimum_transaction_fee, config.block_interval_secs
        );
        Self {
            store,
            bus,
            minimum_fee: config.minimum_transaction_fee,
            block_interval_secs: config.block_interval_secs,
            state: Mutex::new(PendingState {
                queue: Vec::new(),
                ids: HashSet::new(),
                last_seen_sender: HashMap::new(),
                batch_deadline: None,
            }),
        }
    }

    /// Validate cheaply and provisionally accept.
    pub fn admit(&self, tx: SignedTransaction) -> AdmissionResult {
        let started = Instant::now();
        let tx_id = tx.tx_id.clone();

        if let Err(reason) = self.validate(&tx) {
            debug!("rejected {tx_id}: {reason}");
            self.bus.notify(
                NotificationKind::TransactionRejected,
                json!({ "tx_id": tx_id.clone(), "reason": reason.to_string() }),
            );
            return AdmissionResult::Rejected { tx_id, reason };
        }

        if let Err(err) = self.store.insert_transaction(&tx) {
            warn!("failed to persist admitted transaction {tx_id}: {err}");
            self.bus.notify(
                NotificationKind::TransactionRejected,
                json!({ "tx_id": tx_id.clone(), "reason": "storage unavailable" }),
            );
            return AdmissionResult::Rejected {
                tx_id,
                reason: AdmissionError::Storage,
            };
        }

        {
            let mut state = self.state.lock();
            let now = Instant::now();
            let repeat_sender = state
                .last_seen_sender
                .get(&tx.sender)
                .is_some_and(|seen| now.duration_since(*seen) <= BATCH_SENDER_WINDOW);
            if repeat_sender && state.batch_deadline.is_none() {
                debug!("batch mode armed by sender {}", tx.sender);
                state.batch_deadline = Some(now + BATCH_COLLECTION_WINDOW);
            }
            state.last_seen_sender.insert(tx.sender.clone(), now);
            state.ids.insert(tx_id.clone());
            state.queue.push(tx);
        }

        let latency = started.elapsed();
        self.bus.notify(
            NotificationKind::TransactionReceived,
            json!({
                "tx_id": tx_id.clone(),
                "status": "provisionally_accepted",
                "latency_ms": latency.as_millis() as u64,
            }),
        );
        info!("accepted {} in {}ms", tx_id, latency.as_millis());
        AdmissionResult::Accepted {
            tx_id,
            latency,
            estimated_block_secs: self.block_interval_secs,
        }
    }

    fn validate(&self, tx: &SignedTransaction) -> Result<(), AdmissionError> {
        if tx.inputs.is_empty() {
            return Err(AdmissionError::Malformed("no inputs".to_string()));
        }
        if tx.outputs.is_empty() {
            return Err(AdmissionError::Malformed("no outputs".to_string()));
        }
        let mut seen = HashSet::new();
        for input in &tx.inputs {
            if !seen.insert(input.key()) {
                return Err(AdmissionError::Malformed(format!(
                    "duplicate input {}",
                    input.key()
                )));
            }
        }
        for (index, output) in tx.outputs.iter().enumerate() {
            if output.tx_id != tx.tx_id || output.output_index != index as u32 {
                return Err(AdmissionError::Malformed(format!(
                    "output {index} is not addressed by this transaction"
                )));
            }
            if output.amount.is_zero() {
                return Err(AdmissionError::Malformed(format!(
                    "output {index} has zero amount"
                )));
            }
        }
        if tx.computed_tx_id() != tx.tx_id {
            return Err(AdmissionError::Malformed(
                "tx_id does not match canonical content".to_string(),
            ));
        }
        if tx.fee < self.minimum_fee {
            return Err(AdmissionError::FeeBelowFloor {
                fee: tx.fee,
                minimum: self.minimum_fee,
            });
        }
        if !tx.verify_signature() {
            return Err(AdmissionError::InvalidSignature);
        }
        if self.state.lock().ids.contains(&tx.tx_id) {
            return Err(AdmissionError::DuplicatePending);
        }
        match self.store.fetch_transaction(&tx.tx_id) {
            Ok(Some(_)) => Err(AdmissionError::DuplicatePending),
            Ok(None) => Ok(()),
            Err(err) => {
                warn!("duplicate lookup failed for {}: {err}", tx.tx_id);
                Err(AdmissionError::Storage)
            }
        }
    }

    /// Fold persisted uncommitted rows into the in-memory queue. Run at
    /// generator start so a cold restart resumes where it left off.
    pub fn merge_from_storage(&self) -> usize {
        let rows = match self.store.fetch_uncommitted_transactions(1000) {
            Ok(rows) => rows,
            Err(err) => {
                warn!("failed to read uncommitted transactions: {err}");
                return 0;
            }
        };
        let mut state = self.state.lock();
        let mut merged = 0;
        for tx in rows {
            if state.ids.insert(tx.tx_id.clone()) {
                state.queue.push(tx);
                merged += 1;
            }
        }
        if merged > 0 {
            info!("recovered {merged} pending transaction(s) from storage");
        }
        merged
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Snapshot up to `limit` pending transactions in arrival order.
    /// Entries stay queued until [`remove_pending`](Self::remove_pending)
    /// confirms them, so a failed round can retry.
    pub fn pending_snapshot(&self, limit: usize) -> Vec<SignedTransaction> {
        let state = self.state.lock();
        state.queue.iter().take(limit).cloned().collect()
    }

    /// Drop transactions that were committed or purged. Disarms batch
    /// mode once the queue drains.
    pub fn remove_pending(&self, tx_ids: &[String]) {
        if tx_ids.is_empty() {
            return;
        }
        let drop: HashSet<&String> = tx_ids.iter().collect();
        let mut state = self.state.lock();
        state.queue.retain(|tx| !drop.contains(&tx.tx_id));
        for tx_id in tx_ids {
            state.ids.remove(tx_id);
        }
        state.batch_deadline = None;
    }

    /// True once an armed batch-collection window has fully elapsed.
    pub fn batch_window_elapsed(&self) -> bool {
        self.state
            .lock()
            .batch_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn transaction_stats(&self) -> PendingStats {
        let state = self.state.lock();
        PendingStats {
            count: state.queue.len(),
            total_fees: Amount::checked_sum(state.queue.iter().map(|tx| tx.fee))
                .unwrap_or(Amount::ZERO),
            oldest_timestamp: state.queue.iter().map(|tx| tx.timestamp).min(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Wallet;
    use crate::models::UTXORef;
    use crate::storage::DbConfig;
    use tempfile::tempdir;

    fn harness() -> (tempfile::TempDir, Admission) {
        let dir = tempdir().unwrap();
        let store = Store::open(DbConfig::at(dir.path().join("db"))).unwrap();
        let bus = Arc::new(NotificationBus::new());
        let config = NodeConfig::default();
        (dir, Admission::new(store, bus, &config))
    }

    fn signed(wallet: &Wallet, fee: &str, timestamp: u64) -> SignedTransaction {
        SignedTransaction::create(
            wallet,
            vec![UTXORef::new("genesis", 0)],
            vec![("addr-b".to_string(), "1".parse().unwrap())],
            fee.parse().unwrap(),
            "00".repeat(32),
            timestamp,
        )
    }

    #[test]
    fn accepts_a_well_formed_transaction() {
        let (_dir, admission) = harness();
        let wallet = Wallet::generate();
        let tx = signed(&wallet, "0.01", 1_700_000_000);
        let tx_id = tx.tx_id.clone();

        let result = admission.admit(tx);
        assert!(result.is_accepted());
        assert_eq!(admission.pending_count(), 1);
        // The row is durable and uncommitted.
        let stored = admission.store.fetch_transaction(&tx_id).unwrap().unwrap();
        assert!(stored.block_height.is_none());
    }

    #[test]
    fn fee_exactly_at_the_floor_is_accepted() {
        let (_dir, admission) = harness();
        let wallet = Wallet::generate();
        // Default floor is 0.01.
        assert!(admission.admit(signed(&wallet, "0.01", 1)).is_accepted());
        let low = admission.admit(signed(&wallet, "0.009999", 2));
        assert!(matches!(
            low,
            AdmissionResult::Rejected {
                reason: AdmissionError::FeeBelowFloor { .. },
                ..
            }
        ));
    }

    #[test]
    fn rejects_structural_garbage() {
        let (_dir, admission) = harness();
        let wallet = Wallet::generate();

        let mut no_inputs = signed(&wallet, "0.01", 1);
        no_inputs.inputs.clear();
        assert!(matches!(
            admission.admit(no_inputs),
            AdmissionResult::Rejected {
                reason: AdmissionError::Malformed(_),
                ..
            }
        ));

        let mut no_outputs = signed(&wallet, "0.01", 2);
        no_outputs.outputs.clear();
        assert!(matches!(
            admission.admit(no_outputs),
            AdmissionResult::Rejected {
                reason: AdmissionError::Malformed(_),
                ..
            }
        ));

        let mut duplicate_inputs = signed(&wallet, "0.01", 3);
        let dup = duplicate_inputs.inputs[0].clone();
        duplicate_inputs.inputs.push(dup);
        assert!(matches!(
            admission.admit(duplicate_inputs),
            AdmissionResult::Rejected {
                reason: AdmissionError::Malformed(_),
                ..
            }
        ));

        let mut forged_id = signed(&wallet, "0.01", 4);
        forged_id.tx_id = "00".repeat(32);
        assert!(matches!(
            admission.admit(forged_id),
            AdmissionResult::Rejected {
                reason: AdmissionError::Malformed(_),
                ..
            }
        ));
        assert_eq!(admission.pending_count(), 0);
    }

    #[test]
    fn rejects_bad_signatures_and_duplicates() {
        let (_dir, admission) = harness();
        let wallet = Wallet::generate();

        let mut tampered = signed(&wallet, "0.01", 1);
        tampered.outputs[0].amount = "2".parse().unwrap();
        tampered.tx_id = tampered.computed_tx_id();
        for output in &mut tampered.outputs {
            output.tx_id = tampered.tx_id.clone();
        }
        assert!(matches!(
            admission.admit(tampered),
            AdmissionResult::Rejected {
                reason: AdmissionError::InvalidSignature,
                ..
            }
        ));

        let tx = signed(&wallet, "0.01", 2);
        assert!(admission.admit(tx.clone()).is_accepted());
        assert!(matches!(
            admission.admit(tx),
            AdmissionResult::Rejected {
                reason: AdmissionError::DuplicatePending,
                ..
            }
        ));
    }

    #[test]
    fn merge_recovers_persisted_rows_once() {
        let (_dir, admission) = harness();
        let wallet = Wallet::generate();
        let tx = signed(&wallet, "0.01", 1);
        admission.store.insert_transaction(&tx).unwrap();

        assert_eq!(admission.pending_count(), 0);
        assert_eq!(admission.merge_from_storage(), 1);
        assert_eq!(admission.merge_from_storage(), 0);
        assert_eq!(admission.pending_count(), 1);
    }

    #[test]
    fn remove_pending_confirms_and_disarms() {
        let (_dir, admission) = harness();
        let wallet = Wallet::generate();
        let first = signed(&wallet, "0.01", 1);
        let second = signed(&wallet, "0.01", 2);
        let first_id = first.tx_id.clone();

        admission.admit(first);
        admission.admit(second);
        // Same sender twice inside the window arms batch mode.
        assert!(admission.state.lock().batch_deadline.is_some());

        admission.remove_pending(&[first_id]);
        assert_eq!(admission.pending_count(), 1);
        assert!(admission.state.lock().batch_deadline.is_none());
        assert!(!admission.batch_window_elapsed());
    }

    #[test]
    fn stats_summarize_the_queue() {
        let (_dir, admission) = harness();
        let wallet = Wallet::generate();
        admission.admit(signed(&wallet, "0.01", 50));
        admission.admit(signed(&wallet, "0.02", 40));

        let stats = admission.transaction_stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_fees, "0.03".parse().unwrap());
        assert_eq!(stats.oldest_timestamp, Some(40));
    }
}
