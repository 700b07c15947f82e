//! Data-availability client: namespaced blob submission over the DA
//! node's JSON-RPC, plus confirmation tracking.
//!
//! Every block of the rollup shares one fixed-width namespace derived
//! from the configured namespace string. A blob reference is
//! `"<da_height>:<namespace_hex>"`. Without a configured endpoint the
//! client runs disconnected: blocks still form, references are never
//! attached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::NodeConfig;
use crate::models::Block;
use crate::notifications::{NotificationBus, NotificationKind};
use crate::utils::{sha256_bytes, unix_now};

/// Fixed namespace width on the DA layer.
pub const NAMESPACE_LEN: usize = 8;

const MONITOR_POLL: Duration = Duration::from_secs(10);
const MONITOR_ERROR_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DaError {
    #[error("DA submission failed: {0}")]
    Submission(String),
    #[error("DA transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed blob reference: {0}")]
    BadBlobRef(String),
    #[error("blob decode failed: {0}")]
    Decode(String),
}

/// Derive the rollup namespace from its configured string: literal hex
/// when already the right width, otherwise a truncated digest.
pub fn derive_namespace(configured: &str) -> [u8; NAMESPACE_LEN] {
    if configured.len() == NAMESPACE_LEN * 2 {
        if let Ok(bytes) = hex::decode(configured) {
            let mut namespace = [0u8; NAMESPACE_LEN];
            namespace.copy_from_slice(&bytes);
            return namespace;
        }
    }
    let digest = sha256_bytes(configured.as_bytes());
    let mut namespace = [0u8; NAMESPACE_LEN];
    namespace.copy_from_slice(&digest[..NAMESPACE_LEN]);
    namespace
}

struct PendingSubmission {
    block_height: u64,
    da_height: u64,
    submitted_at: u64,
    confirmed: bool,
}

pub struct DaClient {
    http: reqwest::Client,
    endpoint: Option<(String, String)>,
    namespace_hex: String,
    bus: Arc<NotificationBus>,
    /// Submissions awaiting confirmation, keyed by blob reference.
    pending: Mutex<HashMap<String, PendingSubmission>>,
}

impl DaClient {
    pub fn new(config: &NodeConfig, bus: Arc<NotificationBus>) -> Self {
        let endpoint = match (&config.da_node_url, &config.da_auth_token) {
            (Some(url), Some(token)) => Some((url.clone(), token.clone())),
            _ => {
                warn!("DA integration disabled: missing node URL or auth token");
                None
            }
        };
        let namespace_hex = hex::encode(derive_namespace(&config.da_namespace));
        if endpoint.is_some() {
            info!("DA client initialized with namespace {namespace_hex}");
        }
        Self {
            http: reqwest::Client::new(),
            endpoint,
            namespace_hex,
            bus,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn namespace_hex(&self) -> &str {
        &self.namespace_hex
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, DaError> {
        let Some((url, token)) = &self.endpoint else {
            return Err(DaError::Submission("DA endpoint not configured".to_string()));
        };
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response: Value = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown RPC error");
            return Err(DaError::Submission(format!("{method}: {message}")));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Publish a block as a blob. Returns the blob reference, or
    /// `Ok(None)` in disconnected mode.
    pub async fn post_block(&self, block: &Block) -> Result<Option<String>, DaError> {
        if !self.enabled() {
            debug!(
                "DA disabled, skipping submission for block {}",
                block.header.height
            );
            return Ok(None);
        }

        let payload = block
            .to_blob()
            .map_err(|e| DaError::Submission(format!("serialize block: {e}")))?;
        let params = json!([[{
            "namespace": self.namespace_hex,
            "data": BASE64.encode(payload.as_bytes()),
        }]]);
        let result = self.rpc("blob.Submit", params).await?;
        let da_height = result
            .as_u64()
            .or_else(|| result.get("height").and_then(Value::as_u64))
            .ok_or_else(|| DaError::Submission("submit returned no height".to_string()))?;

        let blob_ref = format!("{da_height}:{}", self.namespace_hex);
        self.pending.lock().insert(
            blob_ref.clone(),
            PendingSubmission {
                block_height: block.header.height,
                da_height,
                submitted_at: unix_now(),
                confirmed: false,
            },
        );
        info!(
            "block {} submitted to DA: blob_ref={blob_ref}",
            block.header.height
        );
        Ok(Some(blob_ref))
    }

    fn parse_blob_ref(blob_ref: &str) -> Result<(u64, String), DaError> {
        let (height, namespace) = blob_ref
            .split_once(':')
            .ok_or_else(|| DaError::BadBlobRef(blob_ref.to_string()))?;
        let height: u64 = height
            .parse()
            .map_err(|_| DaError::BadBlobRef(blob_ref.to_string()))?;
        if namespace.len() != NAMESPACE_LEN * 2 || hex::decode(namespace).is_err() {
            return Err(DaError::BadBlobRef(blob_ref.to_string()));
        }
        Ok((height, namespace.to_string()))
    }

    /// Fetch the blobs recorded at a reference's height and namespace.
    async fn blobs_at(&self, da_height: u64, namespace: &str) -> Result<Vec<Vec<u8>>, DaError> {
        let result = self
            .rpc("blob.GetAll", json!([da_height, [namespace]]))
            .await?;
        let Some(entries) = result.as_array() else {
            return Ok(Vec::new());
        };
        let mut blobs = Vec::with_capacity(entries.len());
        for entry in entries {
            let data = entry
                .get("data")
                .and_then(Value::as_str)
                .ok_or_else(|| DaError::Decode("blob entry without data".to_string()))?;
            let bytes = BASE64
                .decode(data)
                .map_err(|e| DaError::Decode(format!("blob data: {e}")))?;
            blobs.push(bytes);
        }
        Ok(blobs)
    }

    /// Balance of the node's DA fee account in the layer's smallest
    /// unit, or `Ok(None)` when disconnected. Blob submissions drain
    /// this account; the node surfaces it at startup so an operator
    /// notices an underfunded sequencer before submissions start
    /// failing.
    pub async fn account_balance(&self) -> Result<Option<u64>, DaError> {
        if !self.enabled() {
            return Ok(None);
        }
        let result = self.rpc("state.Balance", json!([])).await?;
        let amount = result
            .get("amount")
            .map(|v| match v {
                Value::String(text) => text.parse::<u64>().ok(),
                Value::Number(number) => number.as_u64(),
                _ => None,
            })
            .unwrap_or_default()
            .ok_or_else(|| DaError::Decode("balance response without amount".to_string()))?;
        Ok(Some(amount))
    }

    /// Parse a previously posted block back out of the DA layer.
    pub async fn fetch_block(&self, blob_ref: &str) -> Result<Option<Block>, DaError> {
        if !self.enabled() {
            return Ok(None);
        }
        let (da_height, namespace) = Self::parse_blob_ref(blob_ref)?;
        let blobs = self.blobs_at(da_height, &namespace).await?;
        let Some(first) = blobs.first() else {
            warn!("no blob data found at {blob_ref}");
            return Ok(None);
        };
        let block = Block::from_blob(first).map_err(|e| DaError::Decode(e.to_string()))?;
        Ok(Some(block))
    }

    /// True once the blob behind a reference is observable at its
    /// recorded DA height. Confirmations are cached; the first positive
    /// check fires `BlockConfirmedOnDa`.
    pub async fn check_confirmation(&self, blob_ref: &str) -> bool {
        if !self.enabled() {
            return false;
        }
        if let Some(submission) = self.pending.lock().get(blob_ref) {
            if submission.confirmed {
                return true;
            }
        }
        let Ok((da_height, namespace)) = Self::parse_blob_ref(blob_ref) else {
            warn!("cannot check confirmation for malformed reference {blob_ref}");
            return false;
        };
        let observable = match self.blobs_at(da_height, &namespace).await {
            Ok(blobs) => !blobs.is_empty(),
            Err(err) => {
                error!("confirmation check for {blob_ref} failed: {err}");
                return false;
            }
        };
        if observable {
            let newly_confirmed = {
                let mut pending = self.pending.lock();
                match pending.get_mut(blob_ref) {
                    Some(submission) if !submission.confirmed => {
                        submission.confirmed = true;
                        Some((
                            submission.block_height,
                            submission.da_height,
                            submission.submitted_at,
                        ))
                    }
                    _ => None,
                }
            };
            if let Some((block_height, da_height, submitted_at)) = newly_confirmed {
                info!(
                    "block {block_height} confirmed on DA after {}s",
                    unix_now().saturating_sub(submitted_at)
                );
                self.bus.notify(
                    NotificationKind::BlockConfirmedOnDa,
                    json!({
                        "height": block_height,
                        "blob_ref": blob_ref,
                        "da_height": da_height,
                    }),
                );
            }
        }
        observable
    }

    /// Background monitor: polls unconfirmed submissions until each is
    /// observable.
    pub async fn run_monitor(&self, stop: Arc<std::sync::atomic::AtomicBool>) {
        use std::sync::atomic::Ordering;
        if !self.enabled() {
            return;
        }
        info!("DA confirmation monitor started");
        while !stop.load(Ordering::Relaxed) {
            let unconfirmed: Vec<String> = self
                .pending
                .lock()
                .iter()
                .filter(|(_, s)| !s.confirmed)
                .map(|(blob_ref, _)| blob_ref.clone())
                .collect();
            let mut failed = false;
            for blob_ref in unconfirmed {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if !self.check_confirmation(&blob_ref).await {
                    failed = true;
                }
            }
            let pause = if failed { MONITOR_ERROR_BACKOFF } else { MONITOR_POLL };
            tokio::time::sleep(pause).await;
        }
        info!("DA confirmation monitor stopped");
    }
}
