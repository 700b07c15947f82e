//! Node configuration, read from `FIRTH_*` environment variables.
//!
//! The config is a plain struct handed explicitly to every constructor
//! that needs it. No process-wide singleton: parallel tests each build
//! their own.

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::amount::Amount;

/// Identifier of the economic policy stamped into every block header.
/// The canonical pre-hash uses 6-decimal fixed-point amounts and
/// Ed25519 signing, hence the tag.
pub const DEFAULT_FEE_SCHEDULE_ID: &str = "fp6-ed25519-v1";

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Database directory.
    pub db_path: PathBuf,
    /// Genesis document applied when the chain is empty.
    pub genesis_file: Option<PathBuf>,
    /// Operator key file (consumed by external wallet tooling).
    pub wallet_path: PathBuf,

    // DA layer
    pub da_node_url: Option<String>,
    pub da_auth_token: Option<String>,
    pub da_namespace: String,

    // L1 bridge observer
    pub l1_node_url: Option<String>,
    pub l1_vault_address: Option<String>,

    // Block generation
    pub block_interval_secs: u64,
    pub max_block_transactions: usize,
    pub min_batch_threshold: usize,

    // Fees
    pub minimum_transaction_fee: Amount,
    pub fee_schedule_id: String,
}

fn data_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".firth")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            db_path: data_dir().join("ledger.db"),
            genesis_file: None,
            wallet_path: data_dir().join("wallet.json"),
            da_node_url: None,
            da_auth_token: None,
            da_namespace: "firth".to_string(),
            l1_node_url: None,
            l1_vault_address: None,
            block_interval_secs: 5,
            max_block_transactions: 100,
            min_batch_threshold: 3,
            minimum_transaction_fee: Amount::from_units(10_000), // 0.01
            fee_schedule_id: DEFAULT_FEE_SCHEDULE_ID.to_string(),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

impl NodeConfig {
    /// Build from environment variables, falling back to defaults, and
    /// validate before the node touches anything.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = env_string("FIRTH_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(path) = env_string("FIRTH_GENESIS_FILE") {
            config.genesis_file = Some(PathBuf::from(path));
        }
        if let Some(path) = env_string("FIRTH_WALLET_PATH") {
            config.wallet_path = PathBuf::from(path);
        }
        config.da_node_url = env_string("FIRTH_DA_NODE_URL").or(config.da_node_url);
        config.da_auth_token = env_string("FIRTH_DA_AUTH_TOKEN").or(config.da_auth_token);
        if let Some(namespace) = env_string("FIRTH_DA_NAMESPACE") {
            config.da_namespace = namespace;
        }
        config.l1_node_url = env_string("FIRTH_L1_NODE_URL").or(config.l1_node_url);
        config.l1_vault_address =
            env_string("FIRTH_L1_VAULT_ADDRESS").or(config.l1_vault_address);

        if let Some(value) = env_string("FIRTH_BLOCK_INTERVAL_SECONDS") {
            config.block_interval_secs = value
                .parse()
                .context("FIRTH_BLOCK_INTERVAL_SECONDS must be an integer")?;
        }
        if let Some(value) = env_string("FIRTH_MAX_BLOCK_TRANSACTIONS") {
            config.max_block_transactions = value
                .parse()
                .context("FIRTH_MAX_BLOCK_TRANSACTIONS must be an integer")?;
        }
        if let Some(value) = env_string("FIRTH_MIN_BATCH_THRESHOLD") {
            config.min_batch_threshold = value
                .parse()
                .context("FIRTH_MIN_BATCH_THRESHOLD must be an integer")?;
        }
        if let Some(value) = env_string("FIRTH_MINIMUM_TRANSACTION_FEE") {
            config.minimum_transaction_fee = value
                .parse()
                .context("FIRTH_MINIMUM_TRANSACTION_FEE must be a decimal amount")?;
        }
        if let Some(value) = env_string("FIRTH_FEE_SCHEDULE_ID") {
            config.fee_schedule_id = value;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_interval_secs == 0 {
            bail!("block interval must be greater than 0");
        }
        if self.max_block_transactions == 0 {
            bail!("max block transactions must be greater than 0");
        }
        if self.fee_schedule_id.is_empty() {
            bail!("fee schedule id must not be empty");
        }
        Ok(())
    }

    /// Whether a DA endpoint is fully configured.
    pub fn da_configured(&self) -> bool {
        self.da_node_url.is_some() && self.da_auth_token.is_some()
    }
}
