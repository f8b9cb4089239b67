//! Per (height, round, type) vote aggregation.
//!
//! Grounded in base spec §4.3 "Vote aggregation" and in the
//! `VoteCollector`/double-vote-detection pattern from a reference
//! Tendermint engine: a map from validator index to the vote it cast,
//! power accumulated per `block_id`, and evidence recorded the moment
//! a validator is caught signing two different votes for the same
//! (height, round, type).

use {
  super::{
    types::{BlockId, Vote, VoteType},
    validator::ValidatorSet,
  },
  std::collections::HashMap,
};

#[derive(Debug, Clone)]
pub struct DuplicateVote {
  pub validator_index: usize,
  pub height: u64,
  pub round: u32,
  pub vote_a: Vote,
  pub vote_b: Vote,
}

/// Aggregates votes for a single (height, round, type).
#[derive(Debug)]
pub struct VoteSet {
  height: u64,
  round: u32,
  vote_type: VoteType,
  /// first-seen vote per validator index; conflicting later votes are
  /// diverted to `evidence` instead of overwriting this one, so POL
  /// computation for the first-seen block_id is unaffected by a
  /// Byzantine validator's second vote (base spec S6).
  votes: HashMap<usize, Vote>,
  power_by_block: HashMap<Option<multihash::Multihash>, u64>,
  evidence: Vec<DuplicateVote>,
}

impl VoteSet {
  pub fn new(height: u64, round: u32, vote_type: VoteType) -> Self {
    Self {
      height,
      round,
      vote_type,
      votes: HashMap::new(),
      power_by_block: HashMap::new(),
      evidence: Vec::new(),
    }
  }

  /// Adds `vote` cast by the validator at `index` with `power`.
  /// Returns `false` if the vote was a duplicate/conflicting vote
  /// (recorded as evidence rather than counted).
  pub fn add_vote(&mut self, index: usize, power: u64, vote: Vote) -> bool {
    debug_assert_eq!(vote.height, self.height);
    debug_assert_eq!(vote.round, self.round);
    debug_assert_eq!(vote.vote_type, self.vote_type);

    if let Some(existing) = self.votes.get(&index) {
      if existing.block_id != vote.block_id {
        self.evidence.push(DuplicateVote {
          validator_index: index,
          height: self.height,
          round: self.round,
          vote_a: existing.clone(),
          vote_b: vote,
        });
      }
      return false;
    }

    *self.power_by_block.entry(vote.block_id.hash).or_insert(0) += power;
    self.votes.insert(index, vote);
    true
  }

  pub fn evidence(&self) -> &[DuplicateVote] {
    &self.evidence
  }

  pub fn power_for(&self, block_id: &BlockId) -> u64 {
    self.power_by_block.get(&block_id.hash).copied().unwrap_or(0)
  }

  /// The first `block_id` (by insertion, i.e. by vote arrival order)
  /// to cross `set.majority_power()` — the Proof-of-Lock. `None` if
  /// no block_id has yet crossed the threshold.
  pub fn proof_of_lock(&self, set: &ValidatorSet) -> Option<BlockId> {
    let threshold = set.majority_power();
    // iterate votes in arrival (insertion into the underlying vec of
    // indices visited) order to keep "first to cross" meaningful; a
    // HashMap doesn't preserve insertion order, so recompute from the
    // vote list directly instead of `power_by_block`.
    let mut seen_hashes: Vec<BlockId> = vec![];
    for v in self.votes.values() {
      if !seen_hashes.iter().any(|b| b == &v.block_id) {
        seen_hashes.push(v.block_id.clone());
      }
    }
    seen_hashes
      .into_iter()
      .find(|block_id| self.power_for(block_id) >= threshold)
  }

  pub fn has_two_thirds_any(&self, set: &ValidatorSet) -> bool {
    let total: u64 = self.power_by_block.values().sum();
    total >= set.majority_power()
  }

  pub fn has_two_thirds_nil(&self, set: &ValidatorSet) -> bool {
    self.power_for(&BlockId::nil()) >= set.majority_power()
  }

  pub fn vote_count(&self) -> usize {
    self.votes.len()
  }

  /// The vote cast by the validator at `index`, if any (used to
  /// rebuild a sparse [`super::Commit`] from the votes a precommit
  /// round actually collected).
  pub fn vote_for(&self, index: usize) -> Option<&Vote> {
    self.votes.get(&index)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn vote(index: u32, height: u64, round: u32, block_id: BlockId) -> Vote {
    Vote {
      validator_address: [index as u8; 20],
      validator_index: index,
      height,
      round,
      vote_type: VoteType::Prevote,
      block_id,
      signature: None,
    }
  }

  fn validator_set(n: usize) -> ValidatorSet {
    use crate::{consensus::validator::Validator, primitives::Pubkey};
    let vs = (0..n)
      .map(|i| {
        let mut bytes = [0u8; 32];
        bytes[0] = i as u8 + 1;
        Validator::new(Pubkey::from_bytes(bytes), 10, i == 0)
      })
      .collect();
    ValidatorSet::new(vs, true).unwrap()
  }

  #[test]
  fn pol_forms_at_two_thirds_majority() {
    let set = validator_set(4); // total power 40, majority 27
    let mut vs = VoteSet::new(1, 0, VoteType::Prevote);
    let block = BlockId { hash: Some(crate::consensus::types::merkle_root(&[])), ..BlockId::nil() };

    assert!(vs.add_vote(0, 10, vote(0, 1, 0, block.clone())));
    assert!(vs.add_vote(1, 10, vote(1, 1, 0, block.clone())));
    assert!(vs.proof_of_lock(&set).is_none());
    assert!(vs.add_vote(2, 10, vote(2, 1, 0, block.clone())));
    assert_eq!(vs.proof_of_lock(&set), Some(block));
  }

  #[test]
  fn conflicting_vote_is_recorded_as_evidence_not_counted() {
    let set = validator_set(4);
    let mut vs = VoteSet::new(5, 0, VoteType::Prevote);
    let block_a = BlockId { hash: Some(crate::consensus::types::merkle_root(&[1])), ..BlockId::nil() };
    let block_b = BlockId { hash: Some(crate::consensus::types::merkle_root(&[2])), ..BlockId::nil() };

    assert!(vs.add_vote(2, 10, vote(2, 5, 0, block_a.clone())));
    assert!(!vs.add_vote(2, 10, vote(2, 5, 0, block_b)));
    assert_eq!(vs.evidence().len(), 1);
    assert_eq!(vs.evidence()[0].validator_index, 2);
    // the first-seen vote still counts toward block_a's POL tally.
    assert_eq!(vs.power_for(&block_a), 10);
    let _ = set;
  }
}
