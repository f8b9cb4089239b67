//! The specialop plugin (base spec §4.7 "Specialop plugin"): a
//! dedicated channel for validator-signed, out-of-band operations —
//! add/remove a validator, ban a pubkey, change a runtime parameter —
//! that take effect only once ⅔ of the CA validators have signed off,
//! independent of ordinary transaction execution.

use {
  super::{BeginBlockParams, EndBlockParams, EndBlockReturns, Plugin},
  crate::{
    consensus::{Validator, ValidatorSet},
    primitives::{Pubkey, Signature},
  },
  serde::{Deserialize, Serialize},
  std::{
    collections::HashMap,
    sync::{Arc, Mutex},
  },
  thiserror::Error,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ValidatorChange {
  Add(Validator),
  Remove(Pubkey),
  BanPubkey(Pubkey),
  ChangeParam { key: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOp {
  pub id: [u8; 32],
  pub change: ValidatorChange,
  /// CA validator addresses that have signed off so far.
  pub signed_by: Vec<[u8; 20]>,
}

#[derive(Debug, Error)]
pub enum SpecialopError {
  #[error("specialop {0:x?} already has quorum")]
  AlreadyQuorate([u8; 32]),

  #[error("signer is not a CA validator")]
  NotCaValidator,

  #[error("unknown specialop id")]
  UnknownOp,
}

/// Out-of-band vote collection, exposed to the rest of the engine as
/// `SetSpecialVoteRPC(fn)` in the original: callers submit a
/// validator-signed vote for a pending op id and this plugin tallies
/// CA power behind it.
pub struct Specialop {
  pending: HashMap<[u8; 32], PendingOp>,
  ready: Vec<ValidatorChange>,
}

impl Specialop {
  pub fn new() -> Self {
    Self { pending: HashMap::new(), ready: Vec::new() }
  }

  pub fn propose(&mut self, id: [u8; 32], change: ValidatorChange) {
    self.pending.entry(id).or_insert(PendingOp { id, change, signed_by: vec![] });
  }

  /// Records a CA validator's signature for `op_id`. `signature` must
  /// already have been checked by the caller against `signer`'s
  /// pubkey and `op_id` as the signed message — this plugin only
  /// tallies CA power, it doesn't do cryptography.
  pub fn record_vote(
    &mut self,
    op_id: [u8; 32],
    signer: &Validator,
    _signature: &Signature,
    validators: &ValidatorSet,
  ) -> Result<(), SpecialopError> {
    if !signer.is_ca {
      return Err(SpecialopError::NotCaValidator);
    }
    let op = self.pending.get_mut(&op_id).ok_or(SpecialopError::UnknownOp)?;
    if !op.signed_by.contains(&signer.address) {
      op.signed_by.push(signer.address);
    }

    let ca_power_total: u64 =
      validators.validators.iter().filter(|v| v.is_ca).map(|v| v.voting_power).sum();
    let signed_power: u64 = op
      .signed_by
      .iter()
      .filter_map(|addr| validators.get_by_address(addr))
      .filter(|v| v.is_ca)
      .map(|v| v.voting_power)
      .sum();

    if signed_power * 3 >= ca_power_total * 2 {
      let op = self.pending.remove(&op_id).expect("just looked up");
      self.ready.push(op.change);
    }
    Ok(())
  }
}

impl Default for Specialop {
  fn default() -> Self {
    Self::new()
  }
}

impl Plugin for Specialop {
  fn name(&self) -> &str {
    "specialop"
  }

  fn deliver_tx(&mut self, _tx: &[u8], _index: usize) -> Result<bool, String> {
    // specialops travel out-of-band via record_vote, not as ordinary
    // txs, so the plugin never itself vetoes tx delivery.
    Ok(true)
  }

  fn check_tx(&self, _tx: &[u8]) -> Result<bool, String> {
    Ok(true)
  }

  fn begin_block(&mut self, _params: &BeginBlockParams) -> Result<(), String> {
    Ok(())
  }

  fn end_block(&mut self, params: &EndBlockParams) -> Result<EndBlockReturns, String> {
    if self.ready.is_empty() {
      return Ok(EndBlockReturns::default());
    }

    let mut validators = params.current_validators.validators.clone();
    for change in self.ready.drain(..) {
      match change {
        ValidatorChange::Add(v) => validators.push(v),
        ValidatorChange::Remove(pk) => validators.retain(|v| v.pub_key != pk),
        ValidatorChange::BanPubkey(pk) => validators.retain(|v| v.pub_key != pk),
        ValidatorChange::ChangeParam { .. } => {}
      }
    }

    let next = ValidatorSet::new(validators, true).map_err(|e| e.to_string())?;
    Ok(EndBlockReturns { next_validator_set: Some(next) })
  }

  fn reset(&mut self) {
    self.pending.clear();
    self.ready.clear();
  }
}

/// A handle to a [`Specialop`] that both runs as an ordinary registered
/// [`Plugin`] (so `end_block` sees it like any other) and can be cloned
/// and handed to the RPC layer so `POST /specialop` can record a vote
/// without routing through the consensus round driver at all — specialop
/// votes are out-of-band by design, so admitting them doesn't need to
/// wait for a block.
#[derive(Clone)]
pub struct SharedSpecialop(Arc<Mutex<Specialop>>);

impl SharedSpecialop {
  pub fn new() -> Self {
    Self(Arc::new(Mutex::new(Specialop::new())))
  }

  pub fn propose(&self, id: [u8; 32], change: ValidatorChange) {
    self.0.lock().expect("specialop lock poisoned").propose(id, change);
  }

  pub fn record_vote(
    &self,
    op_id: [u8; 32],
    signer: &Validator,
    signature: &Signature,
    validators: &ValidatorSet,
  ) -> Result<(), SpecialopError> {
    self.0.lock().expect("specialop lock poisoned").record_vote(op_id, signer, signature, validators)
  }
}

impl Default for SharedSpecialop {
  fn default() -> Self {
    Self::new()
  }
}

impl Plugin for SharedSpecialop {
  fn name(&self) -> &str {
    "specialop"
  }

  fn deliver_tx(&mut self, tx: &[u8], index: usize) -> Result<bool, String> {
    self.0.lock().expect("specialop lock poisoned").deliver_tx(tx, index)
  }

  fn check_tx(&self, tx: &[u8]) -> Result<bool, String> {
    self.0.lock().expect("specialop lock poisoned").check_tx(tx)
  }

  fn begin_block(&mut self, params: &BeginBlockParams) -> Result<(), String> {
    self.0.lock().expect("specialop lock poisoned").begin_block(params)
  }

  fn end_block(&mut self, params: &EndBlockParams) -> Result<EndBlockReturns, String> {
    self.0.lock().expect("specialop lock poisoned").end_block(params)
  }

  fn reset(&mut self) {
    self.0.lock().expect("specialop lock poisoned").reset()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::primitives::Keypair;

  fn validator_set_with_ca(n: usize) -> (ValidatorSet, Vec<Keypair>) {
    let mut keys = vec![];
    let mut vs = vec![];
    for i in 0..n {
      let kp = Keypair::generate(&mut rand::thread_rng());
      vs.push(Validator::new(kp.public(), 10, true));
      keys.push(kp);
    }
    (ValidatorSet::new(vs, true).unwrap(), keys)
  }

  #[test]
  fn op_applies_once_two_thirds_ca_power_signs() {
    let (set, keys) = validator_set_with_ca(4);
    let mut plugin = Specialop::new();
    let op_id = [1u8; 32];
    let new_validator_key = Keypair::generate(&mut rand::thread_rng());
    plugin.propose(op_id, ValidatorChange::Add(Validator::new(new_validator_key.public(), 5, false)));

    let sig = keys[0].sign(&op_id);
    for (i, key) in keys.iter().enumerate().take(2) {
      let signer = set.get_by_pubkey(&key.public()).unwrap().1.clone();
      let result = plugin.record_vote(op_id, &signer, &sig, &set);
      if i < 1 {
        result.unwrap();
      }
    }
    // 2 of 4 equal-power CA validators is exactly 1/2, not yet 2/3.
    assert!(plugin.ready.is_empty());

    let signer = set.get_by_pubkey(&keys[2].public()).unwrap().1.clone();
    plugin.record_vote(op_id, &signer, &sig, &set).unwrap();
    assert_eq!(plugin.ready.len(), 1);
  }
}
