//! firth: a DA-anchored optimistic UTXO payment rollup sequencer.
//!
//! A single sequencer admits externally signed transfers, batches them
//! into blocks on a cadence, maintains a sparse-Merkle commitment over
//! the live UTXO set, and publishes each block as an opaque blob to a
//! data-availability layer.

pub mod amount;
pub mod bridge;
pub mod canonical;
pub mod config;
pub mod crypto;
pub mod da;
pub mod ledger;
pub mod merkle;
pub mod models;
pub mod node;
pub mod notifications;
pub mod sequencer;
pub mod storage;
pub mod txbuilder;
pub mod utils;

pub use amount::Amount;
pub use config::NodeConfig;
pub use crypto::Wallet;
pub use da::DaClient;
pub use ledger::{Ledger, LedgerError};
pub use merkle::{MerkleProof, SparseMerkleTree};
pub use models::{Block, BlockHeader, GenesisState, SignedTransaction, UTXO, UTXORef};
pub use node::SequencerNode;
pub use notifications::{Notification, NotificationBus, NotificationKind};
pub use sequencer::{Admission, AdmissionError, AdmissionResult, BlobPoster, BlockGenerator};
pub use storage::{DbConfig, Store, StoreError};
pub use txbuilder::{build_transfer, ChainSession, TxBuildError};
