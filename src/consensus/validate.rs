//! Block validation (base spec §4.4): the predicate a received block
//! must satisfy before the Engine is allowed to apply it.
//!
//! The per-tx mempool filter check base spec §4.4 describes is
//! deliberately not part of [`validate_block`] — it's non-fatal
//! ("invalid txs are dropped but the block is accepted"), so it lives
//! as a separate, infallible pass the caller runs after validation
//! succeeds, not as a rejection predicate.

use {
  super::{
    types::{merkle_root, txs_hash, Block, BlockId},
    validator::ValidatorSet,
  },
  crate::plugin::{self, Plugin},
  thiserror::Error,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
  #[error("chain_id mismatch: block has {found:?}, expected {expected:?}")]
  ChainId { found: String, expected: String },

  #[error("height {found} is not the expected next height {expected}")]
  Height { found: u64, expected: u64 },

  #[error("last_block_id does not match the stored previous block")]
  LastBlockId,

  #[error("last_commit carries {power} of the {needed} voting power required")]
  InsufficientLastCommit { power: u64, needed: u64 },

  #[error("data_hash does not match the Merkle root of the block's txs")]
  DataHash,

  #[error("validators_hash does not match the Merkle root of the active validator set")]
  ValidatorsHash,
}

/// Checks every base spec §4.4 predicate except the per-tx mempool
/// filter pass. `last_block_height`/`last_block_id`/`last_validators`
/// describe the chain immediately before `block`; `current_validators`
/// is the set active for `block`'s own height.
pub fn validate_block(
  block: &Block,
  chain_id: &str,
  last_block_height: u64,
  last_block_id: &BlockId,
  last_validators: &ValidatorSet,
  current_validators: &ValidatorSet,
) -> Result<(), ValidationError> {
  if block.header.chain_id != chain_id {
    return Err(ValidationError::ChainId {
      found: block.header.chain_id.clone(),
      expected: chain_id.to_string(),
    });
  }

  let expected_height = last_block_height + 1;
  if block.header.height != expected_height {
    return Err(ValidationError::Height { found: block.header.height, expected: expected_height });
  }

  if &block.header.last_block_id != last_block_id {
    return Err(ValidationError::LastBlockId);
  }

  // genesis's first block has no prior commit to check.
  if last_block_height > 0 {
    let power = block.last_commit.voted_power(last_validators);
    let needed = last_validators.majority_power();
    if power < needed {
      return Err(ValidationError::InsufficientLastCommit { power, needed });
    }
  }

  if block.header.data_hash != txs_hash(&block.data.txs) {
    return Err(ValidationError::DataHash);
  }

  let validator_leaves: Vec<Vec<u8>> = current_validators
    .validators
    .iter()
    .map(|v| bincode::serialize(v).expect("validator encodes"))
    .collect();
  if block.header.validators_hash != merkle_root(&validator_leaves) {
    return Err(ValidationError::ValidatorsHash);
  }

  Ok(())
}

/// Runs every registered plugin's `check_tx` over `block`'s txs and
/// returns the ones that fail (base spec §4.4 "every tx passes the
/// mempool filters currently registered; non-fatal"). The caller logs
/// and drops these; the block itself is still accepted.
pub fn filter_failing_txs<'a>(
  plugins: &[Box<dyn Plugin>],
  block: &'a Block,
) -> Vec<&'a [u8]> {
  block
    .data
    .txs
    .iter()
    .filter(|tx| !matches!(plugin::check_tx_all(plugins, tx), Ok(true)))
    .map(|tx| tx.as_slice())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{consensus::{validator::Validator, BlockBody, Commit, Header, PartSetHeader, Vote, VoteType}, primitives::Keypair};

  fn validator_set(n: usize) -> (ValidatorSet, Vec<Keypair>) {
    let mut keys = vec![];
    let mut vs = vec![];
    for i in 0..n {
      let kp = Keypair::generate(&mut rand::thread_rng());
      vs.push(Validator::new(kp.public(), 10, i == 0));
      keys.push(kp);
    }
    (ValidatorSet::new(vs, true).unwrap(), keys)
  }

  fn sample_block(chain_id: &str, height: u64, last_block_id: BlockId, validators: &ValidatorSet) -> Block {
    let txs = vec![vec![1u8, 2, 3]];
    let validator_leaves: Vec<Vec<u8>> =
      validators.validators.iter().map(|v| bincode::serialize(v).unwrap()).collect();
    let header = Header {
      chain_id: chain_id.to_string(),
      height,
      time: chrono::Utc::now(),
      num_txs: txs.len() as u64,
      last_block_id,
      last_commit_hash: None,
      data_hash: txs_hash(&txs),
      validators_hash: merkle_root(&validator_leaves),
      app_hash: vec![0u8; 32],
    };
    Block { header, data: BlockBody { txs }, last_commit: Commit::empty() }
  }

  #[test]
  fn genesis_successor_needs_no_last_commit() {
    let (validators, _keys) = validator_set(4);
    let block = sample_block("test", 1, BlockId::nil(), &validators);
    // last_commit is Commit::empty() (zero voted power), which would
    // fail InsufficientLastCommit at any height above genesis — this
    // must still pass since last_block_height is 0.
    validate_block(&block, "test", 0, &BlockId::nil(), &validators, &validators).unwrap();
  }

  #[test]
  fn wrong_chain_id_is_rejected() {
    let (validators, _keys) = validator_set(4);
    let block = sample_block("other-chain", 1, BlockId::nil(), &validators);
    let err = validate_block(&block, "test", 0, &BlockId::nil(), &validators, &validators).unwrap_err();
    assert_eq!(
      err,
      ValidationError::ChainId { found: "other-chain".into(), expected: "test".into() }
    );
  }

  #[test]
  fn height_must_be_exactly_one_past_last() {
    let (validators, _keys) = validator_set(4);
    let block = sample_block("test", 5, BlockId::nil(), &validators);
    let err = validate_block(&block, "test", 0, &BlockId::nil(), &validators, &validators).unwrap_err();
    assert_eq!(err, ValidationError::Height { found: 5, expected: 1 });
  }

  #[test]
  fn insufficient_last_commit_power_is_rejected() {
    let (validators, keys) = validator_set(4);
    let first = sample_block("test", 1, BlockId::nil(), &validators);
    let first_id = first.id(PartSetHeader::zero());

    let mut second = sample_block("test", 2, first_id.clone(), &validators);
    // only one of four validators precommits — well under majority.
    let mut precommits = vec![None; 4];
    precommits[0] = Some(Vote {
      validator_address: keys[0].public().address(),
      validator_index: 0,
      height: 1,
      round: 0,
      vote_type: VoteType::Precommit,
      block_id: first_id.clone(),
      signature: None,
    });
    second.last_commit = Commit { block_id: first_id, precommits };

    let err =
      validate_block(&second, "test", 1, &second.header.last_block_id.clone(), &validators, &validators)
        .unwrap_err();
    assert!(matches!(err, ValidationError::InsufficientLastCommit { .. }));
  }

  #[test]
  fn tampered_data_hash_is_rejected() {
    let (validators, _keys) = validator_set(4);
    let mut block = sample_block("test", 1, BlockId::nil(), &validators);
    block.data.txs.push(vec![9, 9, 9]);
    let err = validate_block(&block, "test", 0, &BlockId::nil(), &validators, &validators).unwrap_err();
    assert_eq!(err, ValidationError::DataHash);
  }
}
