//! Process-wide typed event bus.
//!
//! Synchronous in-process subscribers run inline with panics contained;
//! webhooks are fire-and-forget HTTP POSTs on spawned tasks. Delivery
//! is best-effort everywhere; core state transitions are already
//! committed by the time an event fires, so nothing here is a
//! correctness signal.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::utils::unix_now;

/// Every event kind the sequencer emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TransactionReceived,
    TransactionRejected,
    TransactionIncluded,
    BlockCreated,
    BlockSubmittedToDa,
    BlockCommittedToDa,
    BlockConfirmedOnDa,
    DepositProcessed,
    WithdrawalConfirmed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub timestamp: u64,
    pub data: Value,
}

type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    by_kind: HashMap<NotificationKind, Vec<(u64, Callback)>>,
    /// One-shot routes for a specific transaction, dropped once it is
    /// included in a block.
    by_tx: HashMap<String, Vec<Callback>>,
    /// One-shot routes for a specific height, dropped once the block is
    /// committed to the DA layer.
    by_block: HashMap<u64, Vec<Callback>>,
    webhooks: HashMap<NotificationKind, Vec<String>>,
}

pub struct NotificationBus {
    subscribers: RwLock<Subscribers>,
    next_id: AtomicU64,
    http: reqwest::Client,
    runtime: Option<tokio::runtime::Handle>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    /// Webhook delivery rides the ambient tokio runtime when one
    /// exists; without one, webhooks are skipped (sync subscribers
    /// still fire).
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Subscribers::default()),
            next_id: AtomicU64::new(1),
            http: reqwest::Client::new(),
            runtime: tokio::runtime::Handle::try_current().ok(),
        }
    }

    /// Subscribe to an event kind. The returned id can be passed to
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe<F>(&self, kind: NotificationKind, callback: F) -> u64
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, kind: NotificationKind, id: u64) {
        if let Some(list) = self.subscribers.write().by_kind.get_mut(&kind) {
            list.retain(|(entry_id, _)| *entry_id != id);
        }
    }

    /// Route every event mentioning this transaction to the callback,
    /// until the transaction is included.
    pub fn subscribe_transaction<F>(&self, tx_id: impl Into<String>, callback: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .by_tx
            .entry(tx_id.into())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Route every event mentioning this height to the callback, until
    /// the block is committed to DA.
    pub fn subscribe_block<F>(&self, height: u64, callback: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .by_block
            .entry(height)
            .or_default()
            .push(Arc::new(callback));
    }

    pub fn register_webhook(&self, kind: NotificationKind, url: impl Into<String>) {
        let url = url.into();
        info!("registered webhook for {kind:?}: {url}");
        self.subscribers
            .write()
            .webhooks
            .entry(kind)
            .or_default()
            .push(url);
    }

    /// Fan an event out to subscribers and webhooks.
    pub fn notify(&self, kind: NotificationKind, data: Value) {
        let notification = Notification {
            kind,
            timestamp: unix_now(),
            data,
        };

        let (kind_callbacks, tx_callbacks, block_callbacks, webhook_urls) = {
            let mut subs = self.subscribers.write();
            let kind_callbacks: Vec<Callback> = subs
                .by_kind
                .get(&kind)
                .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default();

            let tx_id = notification.data.get("tx_id").and_then(Value::as_str);
            let tx_callbacks: Vec<Callback> = match tx_id {
                Some(tx_id) if kind == NotificationKind::TransactionIncluded => {
                    subs.by_tx.remove(tx_id).unwrap_or_default()
                }
                Some(tx_id) => subs.by_tx.get(tx_id).cloned().unwrap_or_default(),
                None => Vec::new(),
            };

            let height = notification.data.get("height").and_then(Value::as_u64);
            let block_callbacks: Vec<Callback> = match height {
                Some(height) if kind == NotificationKind::BlockCommittedToDa => {
                    subs.by_block.remove(&height).unwrap_or_default()
                }
                Some(height) => subs.by_block.get(&height).cloned().unwrap_or_default(),
                None => Vec::new(),
            };

            let webhook_urls = subs.webhooks.get(&kind).cloned().unwrap_or_default();
            (kind_callbacks, tx_callbacks, block_callbacks, webhook_urls)
        };

        for callback in kind_callbacks
            .iter()
            .chain(tx_callbacks.iter())
            .chain(block_callbacks.iter())
        {
            if catch_unwind(AssertUnwindSafe(|| callback(&notification))).is_err() {
                error!("notification subscriber panicked on {kind:?}");
            }
        }

        if webhook_urls.is_empty() {
            return;
        }
        let Some(runtime) = &self.runtime else {
            debug!("no async runtime; dropping {} webhook(s) for {kind:?}", webhook_urls.len());
            return;
        };
        for url in webhook_urls {
            let client = self.http.clone();
            let payload = notification.clone();
            runtime.spawn(async move {
                match client.post(&url).json(&payload).send().await {
                    Ok(response) if !response.status().is_success() => {
                        error!("webhook {url} answered {}", response.status());
                    }
                    Ok(_) => {}
                    Err(err) => error!("webhook {url} failed: {err}"),
                }
            });
        }
    }
}
