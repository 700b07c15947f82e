//! firth-node: the sequencer daemon.
//!
//! Reads its configuration from `FIRTH_*` environment variables, boots
//! the chain (applying the genesis file on first run), and serves until
//! interrupted.

use anyhow::Result;
use log::info;

use firth::{NodeConfig, SequencerNode};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = NodeConfig::from_env()?;
    info!(
        "starting firth-node: db={}, interval={}s, max {} tx/block, DA {}",
        config.db_path.display(),
        config.block_interval_secs,
        config.max_block_transactions,
        if config.da_configured() { "connected" } else { "disconnected" },
    );

    let mut node = SequencerNode::bootstrap(config)?;
    node.start();

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    node.shutdown().await;
    Ok(())
}
