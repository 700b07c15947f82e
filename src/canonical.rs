//! Canonical serialization for everything that gets hashed or signed.
//!
//! Transaction ids and signatures depend on byte-exact agreement with
//! wallets, so the pre-hash is built here and nowhere else: object keys
//! in lexicographic order, no whitespace, amounts in their canonical
//! decimal text. `serde_json`'s default map is ordered, which gives the
//! sorted-key property for free, so the `preserve_order` feature must
//! never be enabled on this crate.

use serde::Serialize;
use serde_json::{json, Value};

use crate::amount::Amount;
use crate::models::utxo::UTXORef;
use crate::utils::sha256_hex;

/// Serialize any value to canonical JSON text (sorted keys, compact).
pub fn canonical_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&value)
}

/// The signed pre-hash bytes of a transaction.
///
/// Covers `{fee, inputs, outputs[{amount, recipient}], sender,
/// timestamp}`; output `tx_id`/`output_index`/`status` are derived and
/// excluded.
pub fn tx_prehash_bytes(
    sender: &str,
    inputs: &[UTXORef],
    outputs: &[(String, Amount)],
    fee: Amount,
    timestamp: u64,
) -> Vec<u8> {
    let inputs: Vec<Value> = inputs
        .iter()
        .map(|r| json!({ "output_index": r.output_index, "tx_id": r.tx_id }))
        .collect();
    let outputs: Vec<Value> = outputs
        .iter()
        .map(|(recipient, amount)| json!({ "amount": amount, "recipient": recipient }))
        .collect();
    let document = json!({
        "fee": fee,
        "inputs": inputs,
        "outputs": outputs,
        "sender": sender,
        "timestamp": timestamp,
    });
    document.to_string().into_bytes()
}

/// Transaction id: hex SHA-256 of the pre-hash bytes.
pub fn tx_id_from_prehash(prehash: &[u8]) -> String {
    sha256_hex(prehash)
}

/// Leaf value stored in the state tree for one live UTXO.
pub fn utxo_leaf_value(recipient: &str, amount: Amount) -> String {
    json!({ "amount": amount, "recipient": recipient }).to_string()
}

/// Block header hash over every header field except `hash` itself.
#[allow(clippy::too_many_arguments)]
pub fn header_hash(
    height: u64,
    prev_hash: &str,
    state_root: &str,
    timestamp: u64,
    tx_count: u32,
    blob_ref: &str,
    fee_schedule_id: &str,
) -> String {
    let document = json!({
        "blob_ref": blob_ref,
        "fee_schedule_id": fee_schedule_id,
        "height": height,
        "prev_hash": prev_hash,
        "state_root": state_root,
        "timestamp": timestamp,
        "tx_count": tx_count,
    });
    sha256_hex(document.to_string().as_bytes())
}
