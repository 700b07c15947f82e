//! Blob poster: attaches DA references to blocks that lack one.
//!
//! Covers the crash window between block commit and DA submission, and
//! any submission the generator gave up on. The scan runs at node start
//! and then on its poll interval; a block is posted with bounded
//! retries and exponential backoff before being left for the next
//! cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use serde_json::json;

use crate::da::DaClient;
use crate::models::Block;
use crate::notifications::{NotificationBus, NotificationKind};
use crate::storage::Store;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;

pub struct BlobPoster {
    store: Store,
    da: Arc<DaClient>,
    bus: Arc<NotificationBus>,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    max_retries: u32,
    backoff_factor: f64,
}

impl BlobPoster {
    pub fn new(
        store: Store,
        da: Arc<DaClient>,
        bus: Arc<NotificationBus>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            da,
            bus,
            stop,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Poll loop; idle when the DA layer is not configured.
    pub async fn run(&self) {
        if !self.da.enabled() {
            info!("DA disconnected; blob poster idle");
            return;
        }
        info!("blob poster started");
        while !self.stop.load(Ordering::Relaxed) {
            match self.scan_once().await {
                Ok(0) => {}
                Ok(posted) => info!("attached blob references to {posted} block(s)"),
                Err(err) => error!("blob poster scan failed: {err:#}"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        info!("blob poster stopped");
    }

    /// One pass over blocks missing a blob reference, lowest height
    /// first. Returns how many were attached.
    pub async fn scan_once(&self) -> Result<usize> {
        let blocks = self.store.fetch_blocks_missing_blob_ref()?;
        if blocks.is_empty() {
            return Ok(0);
        }
        debug!("found {} block(s) awaiting DA attachment", blocks.len());
        let mut posted = 0;
        for block in &blocks {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            if self.post_with_retry(block).await {
                posted += 1;
            }
        }
        Ok(posted)
    }

    /// Post one block with bounded retries. True once the reference is
    /// recorded.
    async fn post_with_retry(&self, block: &Block) -> bool {
        let height = block.header.height;
        let mut delay = self.poll_interval;
        for attempt in 1..=self.max_retries {
            match self.da.post_block(block).await {
                Ok(Some(blob_ref)) => {
                    match self.store.update_block_blob_ref(height, &blob_ref) {
                        Ok(true) => {
                            info!("block {height} re-posted to DA: {blob_ref}");
                            self.bus.notify(
                                NotificationKind::BlockCommittedToDa,
                                json!({ "height": height, "blob_ref": blob_ref }),
                            );
                        }
                        Ok(false) => debug!("block {height} already carries a reference"),
                        Err(err) => {
                            error!("failed to record blob reference for block {height}: {err}");
                            return false;
                        }
                    }
                    return true;
                }
                // DA got unconfigured; nothing this task can do.
                Ok(None) => return false,
                Err(err) => {
                    warn!("posting block {height} failed (attempt {attempt}): {err}");
                    if attempt < self.max_retries {
                        tokio::time::sleep(delay).await;
                        delay = delay.mul_f64(self.backoff_factor);
                    }
                }
            }
        }
        warn!("giving up on block {height} until the next cycle");
        false
    }
}
