//! Core data model: UTXOs, transactions, blocks, genesis, vault records.

pub mod block;
pub mod genesis;
pub mod receipt;
pub mod transaction;
pub mod utxo;
pub mod vault;

pub use block::{Block, BlockHeader, GENESIS_BLOB_REF, GENESIS_PREV_HASH};
pub use genesis::{GenesisError, GenesisState, GenesisUtxo};
pub use receipt::ReceiptProof;
pub use transaction::SignedTransaction;
pub use utxo::{UtxoStatus, UTXO, UTXORef};
pub use vault::{VaultDeposit, VaultWithdrawal};
