//! Bridge ingest: entry points the external L1 observer calls.
//!
//! Events arrive as loose JSON; nothing here panics or errors across
//! the boundary. A malformed event logs and returns false, a duplicate
//! deposit counts as success, and notifications fire only after the
//! ledger committed.

use log::{error, info};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::amount::Amount;
use crate::ledger::Ledger;
use crate::notifications::{NotificationBus, NotificationKind};

fn require_str<'a>(details: &'a Value, field: &str) -> Option<&'a str> {
    let value = details.get(field).and_then(Value::as_str);
    if value.is_none() {
        error!("bridge event missing required field '{field}'");
    }
    value
}

fn require_u64(details: &Value, field: &str) -> Option<u64> {
    let value = details.get(field).and_then(Value::as_u64);
    if value.is_none() {
        error!("bridge event missing required field '{field}'");
    }
    value
}

fn require_amount(details: &Value, field: &str) -> Option<Amount> {
    let parsed = match details.get(field) {
        Some(Value::String(text)) => text.parse().ok(),
        Some(Value::Number(number)) => number.to_string().parse().ok(),
        _ => None,
    };
    if parsed.is_none() {
        error!("bridge event missing or invalid field '{field}'");
    }
    parsed
}

/// Apply a deposit observed on L1: mints one UTXO for the recipient.
///
/// Required fields: `l1_tx_hash`, `recipient`, `amount`, `l1_height`,
/// `l1_time`. Idempotent on `l1_tx_hash`: a repeat is success without
/// a second mint or notification.
pub async fn handle_deposit_received(
    ledger: &Mutex<Ledger>,
    bus: &NotificationBus,
    details: &Value,
) -> bool {
    let Some(l1_tx_hash) = require_str(details, "l1_tx_hash") else {
        return false;
    };
    let Some(recipient) = require_str(details, "recipient") else {
        return false;
    };
    let Some(amount) = require_amount(details, "amount") else {
        return false;
    };
    let Some(l1_height) = require_u64(details, "l1_height") else {
        return false;
    };
    let Some(l1_time) = require_u64(details, "l1_time") else {
        return false;
    };
    if amount.is_zero() {
        error!("deposit {l1_tx_hash} has zero amount");
        return false;
    }

    let minted = {
        let mut ledger = ledger.lock().await;
        match ledger.process_deposit(l1_tx_hash, recipient, amount, l1_height, l1_time) {
            Ok(minted) => minted,
            Err(err) => {
                error!("deposit {l1_tx_hash} rejected by ledger: {err}");
                return false;
            }
        }
    };

    if minted {
        bus.notify(
            NotificationKind::DepositProcessed,
            json!({
                "l1_tx_hash": l1_tx_hash,
                "recipient": recipient,
                "amount": amount,
                "l1_height": l1_height,
            }),
        );
    } else {
        info!("deposit {l1_tx_hash} already processed");
    }
    true
}

/// Record L1 finality for a withdrawal.
///
/// Required fields: `l1_tx_hash`, `rollup_tx_id`, `amount`,
/// `l1_height`.
pub async fn handle_withdrawal_confirmed(
    ledger: &Mutex<Ledger>,
    bus: &NotificationBus,
    details: &Value,
) -> bool {
    let Some(l1_tx_hash) = require_str(details, "l1_tx_hash") else {
        return false;
    };
    let Some(rollup_tx_id) = require_str(details, "rollup_tx_id") else {
        return false;
    };
    let Some(amount) = require_amount(details, "amount") else {
        return false;
    };
    let Some(l1_height) = require_u64(details, "l1_height") else {
        return false;
    };

    let updated = {
        let ledger = ledger.lock().await;
        match ledger.confirm_withdrawal(rollup_tx_id, l1_tx_hash) {
            Ok(updated) => updated,
            Err(err) => {
                error!("withdrawal confirmation {rollup_tx_id} failed: {err}");
                return false;
            }
        }
    };
    if !updated {
        return false;
    }

    bus.notify(
        NotificationKind::WithdrawalConfirmed,
        json!({
            "l1_tx_hash": l1_tx_hash,
            "rollup_tx_id": rollup_tx_id,
            "amount": amount,
            "l1_height": l1_height,
        }),
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VaultWithdrawal;
    use crate::storage::{DbConfig, Store};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn harness() -> (tempfile::TempDir, Mutex<Ledger>, Arc<NotificationBus>) {
        let dir = tempdir().unwrap();
        let store = Store::open(DbConfig::at(dir.path().join("db"))).unwrap();
        let ledger = Ledger::boot(store).unwrap();
        (dir, Mutex::new(ledger), Arc::new(NotificationBus::new()))
    }

    #[tokio::test]
    async fn deposit_mints_once_and_notifies_once() {
        let (_dir, ledger, bus) = harness();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        bus.subscribe(NotificationKind::DepositProcessed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let event = json!({
            "l1_tx_hash": "0xabcd",
            "recipient": "addr-b",
            "amount": 2.5,
            "l1_height": 120,
            "l1_time": 1_700_000_000u64,
        });
        assert!(handle_deposit_received(&ledger, &bus, &event).await);
        // Repeat is a successful no-op.
        assert!(handle_deposit_received(&ledger, &bus, &event).await);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let guard = ledger.lock().await;
        let minted = guard.store().fetch_utxo("deposit:0xabcd", 0).unwrap().unwrap();
        assert_eq!(minted.recipient, "addr-b");
        assert_eq!(minted.amount, "2.5".parse().unwrap());
    }

    #[tokio::test]
    async fn missing_fields_fail_soft() {
        let (_dir, ledger, bus) = harness();
        for broken in [
            json!({"recipient": "addr-b", "amount": 1, "l1_height": 1, "l1_time": 1}),
            json!({"l1_tx_hash": "0x1", "amount": 1, "l1_height": 1, "l1_time": 1}),
            json!({"l1_tx_hash": "0x1", "recipient": "addr-b", "l1_height": 1, "l1_time": 1}),
            json!({"l1_tx_hash": "0x1", "recipient": "addr-b", "amount": 0, "l1_height": 1, "l1_time": 1}),
        ] {
            assert!(!handle_deposit_received(&ledger, &bus, &broken).await);
        }
        let guard = ledger.lock().await;
        assert!(guard.store().fetch_all_unspent_utxos().unwrap().is_empty());
    }

    #[tokio::test]
    async fn withdrawal_confirmation_updates_the_row() {
        let (_dir, ledger, bus) = harness();
        let rollup_tx_id = "aa".repeat(32);
        {
            let guard = ledger.lock().await;
            guard
                .record_withdrawal(&VaultWithdrawal {
                    rollup_tx_id: rollup_tx_id.clone(),
                    recipient: "addr-a".to_string(),
                    l1_address: "celestia1xyz".to_string(),
                    amount: "1".parse().unwrap(),
                    timestamp: 1_700_000_000,
                    burned_inputs: Vec::new(),
                    l1_tx_hash: None,
                    l1_confirmed: false,
                })
                .unwrap();
        }

        let event = json!({
            "l1_tx_hash": "0xbeef",
            "rollup_tx_id": rollup_tx_id.clone(),
            "amount": "1",
            "l1_height": 500,
        });
        assert!(handle_withdrawal_confirmed(&ledger, &bus, &event).await);

        let guard = ledger.lock().await;
        let row = guard
            .store()
            .get_vault_withdrawal(&rollup_tx_id)
            .unwrap()
            .unwrap();
        assert!(row.l1_confirmed);
        assert_eq!(row.l1_tx_hash.as_deref(), Some("0xbeef"));

        // Unknown withdrawal fails soft.
        let unknown = json!({
            "l1_tx_hash": "0xbeef",
            "rollup_tx_id": "bb".repeat(32),
            "amount": "1",
            "l1_height": 500,
        });
        drop(guard);
        assert!(!handle_withdrawal_confirmed(&ledger, &bus, &unknown).await);
    }
}
