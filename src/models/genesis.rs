//! Genesis state: the initial UTXO allocation.
//!
//! Two file shapes are accepted: the full form with a `utxos` list, and
//! the `allocations` map sugar (`{"<address>": <amount>, ...}`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::amount::Amount;
use crate::utils::unix_now;

#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("unrecognized genesis document: expected a `utxos` list or an `allocations` map")]
    UnknownShape,
    #[error("invalid genesis document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("genesis allocation for {0} must be positive")]
    NonPositiveAmount(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisUtxo {
    pub recipient: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "unix_now")]
    pub timestamp: u64,
    #[serde(default)]
    pub utxos: Vec<GenesisUtxo>,
    #[serde(default = "default_state_root")]
    pub initial_state_root: String,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_state_root() -> String {
    "0".repeat(64)
}

impl GenesisState {
    pub fn empty() -> Self {
        Self {
            version: default_version(),
            timestamp: unix_now(),
            utxos: Vec::new(),
            initial_state_root: default_state_root(),
            description: None,
        }
    }

    /// Parse either accepted document shape.
    pub fn from_json(data: &str) -> Result<Self, GenesisError> {
        let value: serde_json::Value = serde_json::from_str(data)?;
        let object = value.as_object().ok_or(GenesisError::UnknownShape)?;

        if let Some(allocations) = object.get("allocations") {
            let map: std::collections::BTreeMap<String, Amount> =
                serde_json::from_value(allocations.clone())?;
            let mut state = Self::empty();
            // BTreeMap iteration gives a deterministic UTXO order.
            state.utxos = map
                .into_iter()
                .map(|(recipient, amount)| GenesisUtxo { recipient, amount })
                .collect();
            state.validate()?;
            return Ok(state);
        }

        if object.contains_key("utxos") {
            let state: GenesisState = serde_json::from_value(value)?;
            state.validate()?;
            return Ok(state);
        }

        Err(GenesisError::UnknownShape)
    }

    fn validate(&self) -> Result<(), GenesisError> {
        for utxo in &self.utxos {
            if utxo.amount.is_zero() {
                return Err(GenesisError::NonPositiveAmount(utxo.recipient.clone()));
            }
        }
        Ok(())
    }
}
