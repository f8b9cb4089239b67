//! The genesis document (base spec §3 `GenesisDoc`).
//!
//! Loaded once per node at startup from `genesis.json`; immutable for
//! the lifetime of the chain. `plugins` names the ordered list of
//! application hooks to wire up, by name, so the same binary can run
//! chains with different plugin sets without a recompile.

use {
  super::validator::{Validator, ValidatorSet, ValidatorSetError},
  chrono::{DateTime, Utc},
  serde::{Deserialize, Serialize},
  thiserror::Error,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisValidator {
  pub pub_key: crate::primitives::Pubkey,
  pub voting_power: u64,
  pub is_ca: bool,
  pub rpc_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisDoc {
  pub chain_id: String,
  pub genesis_time: DateTime<Utc>,
  pub validators: Vec<GenesisValidator>,
  /// Hex-encoded application state hash the first block is built on
  /// top of; all-zero for a chain whose application starts empty.
  pub app_hash: String,
  /// Ordered list of plugin names to register, by name, at startup.
  #[serde(default)]
  pub plugins: Vec<String>,
}

#[derive(Debug, Error)]
pub enum GenesisError {
  #[error("chain_id must not be empty")]
  EmptyChainId,

  #[error(transparent)]
  InvalidValidatorSet(#[from] ValidatorSetError),
}

impl GenesisDoc {
  pub fn validate(&self) -> Result<(), GenesisError> {
    if self.chain_id.is_empty() {
      return Err(GenesisError::EmptyChainId);
    }
    self.validator_set(true)?;
    Ok(())
  }

  /// Builds the initial [`ValidatorSet`] named at genesis.
  /// `require_ca` mirrors whatever the running node's config says
  /// about CA-gated peering (base spec §3 `ValidatorSet` invariant c).
  pub fn validator_set(&self, require_ca: bool) -> Result<ValidatorSet, GenesisError> {
    let validators = self
      .validators
      .iter()
      .map(|gv| {
        let mut v = Validator::new(gv.pub_key.clone(), gv.voting_power, gv.is_ca);
        v.rpc_address = gv.rpc_address.clone();
        v
      })
      .collect();
    Ok(ValidatorSet::new(validators, require_ca)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_json() -> &'static str {
    r#"{
      "chain_id": "test-chain",
      "genesis_time": "2024-01-01T00:00:00Z",
      "validators": [
        {"pub_key": "GBQEQGo5zQYCFdewiWuZ5FT9pi6D4muTAvyYzqR4ty4U", "voting_power": 10, "is_ca": true, "rpc_address": null}
      ],
      "app_hash": "00",
      "plugins": ["specialop"]
    }"#
  }

  #[test]
  fn parses_and_validates_minimal_doc() {
    let doc: GenesisDoc = serde_json::from_str(sample_json()).unwrap();
    doc.validate().unwrap();
    assert_eq!(doc.validators.len(), 1);
    assert_eq!(doc.plugins, vec!["specialop".to_string()]);
  }

  #[test]
  fn rejects_empty_chain_id() {
    let mut doc: GenesisDoc = serde_json::from_str(sample_json()).unwrap();
    doc.chain_id.clear();
    assert!(matches!(doc.validate(), Err(GenesisError::EmptyChainId)));
  }
}
