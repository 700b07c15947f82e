//! Node wiring: storage, ledger, admission, generator, poster and the
//! DA monitor, built from one config and torn down with one stop flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::da::DaClient;
use crate::ledger::Ledger;
use crate::models::GenesisState;
use crate::notifications::NotificationBus;
use crate::sequencer::{Admission, BlobPoster, BlockGenerator};
use crate::storage::{DbConfig, Store};

pub struct SequencerNode {
    config: NodeConfig,
    store: Store,
    ledger: Arc<Mutex<Ledger>>,
    admission: Arc<Admission>,
    da: Arc<DaClient>,
    bus: Arc<NotificationBus>,
    stop: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SequencerNode {
    /// Open storage, boot the ledger, and apply genesis if the chain is
    /// empty. Nothing runs yet; call [`start`](Self::start).
    pub fn bootstrap(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data directory {}", parent.display()))?;
        }
        let store = Store::open(DbConfig::at(config.db_path.clone()))
            .context("failed to open node storage")?;
        let mut ledger = Ledger::boot(store.clone()).context("failed to boot ledger")?;

        if ledger.store().get_block_by_height(0)?.is_none() {
            let genesis = match &config.genesis_file {
                Some(path) => {
                    let data = std::fs::read_to_string(path).with_context(|| {
                        format!("failed to read genesis file {}", path.display())
                    })?;
                    GenesisState::from_json(&data)
                        .with_context(|| format!("invalid genesis file {}", path.display()))?
                }
                None => {
                    warn!("no genesis file configured; starting with an empty allocation");
                    GenesisState::empty()
                }
            };
            ledger.load_genesis(&genesis, &config.fee_schedule_id)?;
        }

        let bus = Arc::new(NotificationBus::new());
        let ledger = Arc::new(Mutex::new(ledger));
        let admission = Arc::new(Admission::new(store.clone(), bus.clone(), &config));
        let da = Arc::new(DaClient::new(&config, bus.clone()));

        Ok(Self {
            config,
            store,
            ledger,
            admission,
            da,
            bus,
            stop: Arc::new(AtomicBool::new(false)),
            tasks: Vec::new(),
        })
    }

    /// Spawn the long-lived tasks: block generator, blob poster, DA
    /// confirmation monitor.
    pub fn start(&mut self) {
        let generator = BlockGenerator::new(
            self.ledger.clone(),
            self.admission.clone(),
            self.da.clone(),
            self.bus.clone(),
            self.store.clone(),
            self.stop.clone(),
            &self.config,
        );
        self.tasks.push(tokio::spawn(async move {
            generator.run().await;
        }));

        let poster = BlobPoster::new(
            self.store.clone(),
            self.da.clone(),
            self.bus.clone(),
            self.stop.clone(),
        );
        self.tasks.push(tokio::spawn(async move {
            poster.run().await;
        }));

        let da = self.da.clone();
        let stop = self.stop.clone();
        self.tasks.push(tokio::spawn(async move {
            da.run_monitor(stop).await;
        }));

        if self.da.enabled() {
            let da = self.da.clone();
            tokio::spawn(async move {
                match da.account_balance().await {
                    Ok(Some(0)) => warn!("DA fee account is empty; blob submissions will fail"),
                    Ok(Some(balance)) => info!("DA fee account balance: {balance}"),
                    Ok(None) => {}
                    Err(err) => warn!("could not read DA fee account balance: {err}"),
                }
            });
        }

        info!("sequencer node started");
    }

    /// Raise the stop flag and wait for every task to drain. The
    /// generator finishes an in-progress commit; in-flight DA
    /// submissions are abandoned to the next cold-start scan.
    pub async fn shutdown(mut self) {
        info!("shutting down sequencer node");
        self.stop.store(true, Ordering::Relaxed);
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!("task ended abnormally during shutdown: {err}");
            }
        }
        info!("sequencer node stopped");
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Handle for the client-facing surface to admit transactions.
    pub fn admission(&self) -> Arc<Admission> {
        self.admission.clone()
    }

    /// Handle for balance/proof queries and bridge ingest.
    pub fn ledger(&self) -> Arc<Mutex<Ledger>> {
        self.ledger.clone()
    }

    pub fn bus(&self) -> Arc<NotificationBus> {
        self.bus.clone()
    }

    pub fn da(&self) -> Arc<DaClient> {
        self.da.clone()
    }
}
