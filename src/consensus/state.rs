//! The Tendermint-style round state machine (base spec §4.3).
//!
//! `RoundState` owns everything the spec calls out as owned solely by
//! the consensus loop: the current step, lock, and the vote sets for
//! every round seen at this height. It is a pure state machine —
//! network I/O, timers, and block storage are driven from the outside
//! by feeding it [`Event`]s and reading back [`Action`]s to perform,
//! the way a reference Tendermint engine separates `handle_message`
//! (pure transition) from the reactor that owns sockets and timers.

use {
  super::{
    types::{BlockId, Commit, PartSetHeader, Proposal, Vote, VoteType},
    validator::ValidatorSet,
    vote_set::{DuplicateVote, VoteSet},
  },
  crate::primitives::Pubkey,
  std::{collections::BTreeMap, time::Duration},
  thiserror::Error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
  NewHeight,
  NewRound,
  Propose,
  Prevote,
  PrevoteWait,
  Precommit,
  PrecommitWait,
  Commit,
}

impl Step {
  pub fn is_prevote_like(self) -> bool {
    matches!(self, Step::Prevote | Step::PrevoteWait)
  }
}

/// Configurable round timeouts (base spec §4.3): `propose` grows
/// linearly with the round number to guarantee eventual synchrony
/// under partial synchrony assumptions; the others are fixed.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
  pub propose_base: Duration,
  pub propose_delta: Duration,
  pub prevote_wait: Duration,
  pub precommit_wait: Duration,
  pub commit: Duration,
}

impl Default for TimeoutConfig {
  fn default() -> Self {
    Self {
      propose_base: Duration::from_secs(3),
      propose_delta: Duration::from_millis(500),
      prevote_wait: Duration::from_secs(1),
      precommit_wait: Duration::from_secs(1),
      commit: Duration::from_secs(1),
    }
  }
}

impl TimeoutConfig {
  pub fn propose(&self, round: u32) -> Duration {
    self.propose_base + self.propose_delta * round
  }
}

#[derive(Debug, Error)]
pub enum ConsensusError {
  #[error("vote for height {vote_height} does not match current height {current_height}")]
  WrongHeight { vote_height: u64, current_height: u64 },

  #[error("unknown validator address in vote")]
  UnknownValidator,

  #[error("vote signature does not verify")]
  BadSignature,

  #[error("safety violation: locked on a block at round {locked_round} but asked to prevote a different block at round {round} without a POL at or after the lock")]
  LockViolation { locked_round: u32, round: u32 },
}

/// Per-round vote sets, mirroring the original's `HeightVoteSet`.
#[derive(Debug, Default)]
struct RoundVotes {
  prevotes: Option<VoteSet>,
  precommits: Option<VoteSet>,
}

/// What the state machine wants done. The caller (the consensus
/// reactor / main loop) performs these side effects and feeds results
/// back in as further [`Event`]s.
#[derive(Debug, Clone)]
pub enum Action {
  BroadcastProposal(Proposal),
  BroadcastVote(Vote),
  ScheduleTimeout { step: Step, round: u32, after: Duration },
  Commit { block_id: BlockId, commit: Commit },
  Evidence(DuplicateVote),
}

pub struct RoundState {
  pub height: u64,
  pub round: u32,
  pub step: Step,
  validators: ValidatorSet,
  chain_id: String,
  me: Pubkey,

  proposer: Pubkey,
  proposal: Option<Proposal>,
  proposal_block_id: Option<BlockId>,

  locked_round: Option<u32>,
  locked_block_id: Option<BlockId>,
  valid_round: Option<u32>,
  valid_block_id: Option<BlockId>,

  rounds: BTreeMap<u32, RoundVotes>,
  commit_round: Option<u32>,

  timeouts: TimeoutConfig,
  actions: Vec<Action>,
}

impl RoundState {
  pub fn new(
    height: u64,
    chain_id: String,
    me: Pubkey,
    mut validators: ValidatorSet,
    timeouts: TimeoutConfig,
  ) -> Self {
    let proposer = validators.advance_proposer();
    let mut rounds = BTreeMap::new();
    rounds.insert(0, RoundVotes::default());
    let mut actions = vec![];
    actions.push(Action::ScheduleTimeout {
      step: Step::Propose,
      round: 0,
      after: timeouts.propose(0),
    });
    Self {
      height,
      round: 0,
      step: Step::Propose,
      validators,
      chain_id,
      me,
      proposer,
      proposal: None,
      proposal_block_id: None,
      locked_round: None,
      locked_block_id: None,
      valid_round: None,
      valid_block_id: None,
      rounds,
      commit_round: None,
      timeouts,
      actions,
    }
  }

  pub fn drain_actions(&mut self) -> Vec<Action> {
    std::mem::take(&mut self.actions)
  }

  pub fn is_proposer(&self) -> bool {
    self.proposer == self.me
  }

  pub fn proposer(&self) -> &Pubkey {
    &self.proposer
  }

  /// The round whose precommits produced this height's commit, once
  /// `Action::Commit` has fired. `None` before that happens.
  pub fn commit_round(&self) -> Option<u32> {
    self.commit_round
  }

  fn round_votes_mut(&mut self, round: u32) -> &mut RoundVotes {
    self.rounds.entry(round).or_insert_with(RoundVotes::default)
  }

  fn prevotes(&mut self, round: u32) -> &mut VoteSet {
    let height = self.height;
    self
      .round_votes_mut(round)
      .prevotes
      .get_or_insert_with(|| VoteSet::new(height, round, VoteType::Prevote))
  }

  fn precommits(&mut self, round: u32) -> &mut VoteSet {
    let height = self.height;
    self
      .round_votes_mut(round)
      .precommits
      .get_or_insert_with(|| VoteSet::new(height, round, VoteType::Precommit))
  }

  /// Enters a new round: advances the proposer accumulator and
  /// schedules the propose timeout. Never moves backward — callers
  /// only call this with `round > self.round`.
  pub fn enter_new_round(&mut self, round: u32) {
    assert!(round > self.round, "round state must not move backward");
    self.round = round;
    self.step = Step::Propose;
    self.proposal = None;
    self.proposal_block_id = None;
    self.proposer = self.validators.advance_proposer();
    self.actions.push(Action::ScheduleTimeout {
      step: Step::Propose,
      round,
      after: self.timeouts.propose(round),
    });
  }

  /// Records a received, signature-checked proposal for the current
  /// round and immediately decides this validator's prevote,
  /// honoring the locking rule (base spec §4.3 "Locking rules").
  pub fn receive_proposal(&mut self, proposal: Proposal, block_id: BlockId) {
    if proposal.round != self.round || self.proposal.is_some() {
      return;
    }
    self.proposal = Some(proposal);
    self.proposal_block_id = Some(block_id.clone());
    self.step = Step::Prevote;
    self.cast_prevote(Some(block_id));
  }

  /// `propose_timeout` fired with no proposal received: prevote nil.
  pub fn propose_timed_out(&mut self) {
    if self.step != Step::Propose {
      return;
    }
    self.step = Step::Prevote;
    self.cast_prevote(None);
  }

  fn cast_prevote(&mut self, candidate: Option<BlockId>) {
    let choice = match (&self.locked_block_id, &candidate) {
      // locked to a prior-round block: always prevote it, regardless
      // of what's proposed this round, until a POL releases the lock.
      (Some(locked), _) => Some(locked.clone()),
      (None, Some(block_id)) => Some(block_id.clone()),
      (None, None) => None,
    };
    self.emit_vote(VoteType::Prevote, choice.unwrap_or_else(BlockId::nil));
  }

  fn emit_vote(&mut self, vote_type: VoteType, block_id: BlockId) {
    if let Some((index, validator)) = self.validators.get_by_pubkey(&self.me) {
      let vote = Vote {
        validator_address: validator.address,
        validator_index: index as u32,
        height: self.height,
        round: self.round,
        vote_type,
        block_id,
        signature: None, // signed by the caller, which holds the keypair
      };
      self.actions.push(Action::BroadcastVote(vote));
    }
  }

  /// Feeds in a network vote. Returns an error for malformed votes;
  /// Byzantine double-votes are *not* an error — they're recorded as
  /// [`Action::Evidence`] and the first-seen vote still counts.
  pub fn add_vote(&mut self, vote: Vote) -> Result<(), ConsensusError> {
    if vote.height != self.height {
      return Err(ConsensusError::WrongHeight {
        vote_height: vote.height,
        current_height: self.height,
      });
    }
    let validator = self
      .validators
      .get_by_address(&vote.validator_address)
      .ok_or(ConsensusError::UnknownValidator)?;
    if !vote.verify(&self.chain_id, &validator.pub_key) {
      return Err(ConsensusError::BadSignature);
    }

    let (index, power, round) =
      (vote.validator_index as usize, validator.voting_power, vote.round);

    let set = match vote.vote_type {
      VoteType::Prevote => self.prevotes(round),
      VoteType::Precommit => self.precommits(round),
    };
    if !set.add_vote(index, power, vote.clone()) {
      if let Some(dup) = set.evidence().last().cloned() {
        self.actions.push(Action::Evidence(dup));
      }
      return Ok(());
    }

    match vote.vote_type {
      VoteType::Prevote => self.on_prevote_added(round),
      VoteType::Precommit => self.on_precommit_added(round),
    }
    Ok(())
  }

  fn on_prevote_added(&mut self, round: u32) {
    if round != self.round || !self.step.is_prevote_like() {
      return;
    }
    let validators = self.validators.clone();
    let prevotes = self.prevotes(round);
    if let Some(pol) = prevotes.proof_of_lock(&validators) {
      // +2/3 prevotes for a single block_id: lock on it and precommit.
      self.locked_round = Some(round);
      self.locked_block_id = Some(pol.clone());
      self.valid_round = Some(round);
      self.valid_block_id = Some(pol.clone());
      self.step = Step::Precommit;
      self.emit_vote(VoteType::Precommit, pol);
    } else if prevotes.has_two_thirds_nil(&validators) {
      self.locked_round = None;
      self.locked_block_id = None;
      self.step = Step::Precommit;
      self.emit_vote(VoteType::Precommit, BlockId::nil());
    } else if prevotes.has_two_thirds_any(&validators) && self.step == Step::Prevote {
      self.step = Step::PrevoteWait;
      self.actions.push(Action::ScheduleTimeout {
        step: Step::PrevoteWait,
        round,
        after: self.timeouts.prevote_wait,
      });
    }
  }

  /// `prevote_wait` fired without a POL or nil-majority: precommit nil.
  pub fn prevote_wait_timed_out(&mut self, round: u32) {
    if round != self.round || self.step != Step::PrevoteWait {
      return;
    }
    self.step = Step::Precommit;
    self.emit_vote(VoteType::Precommit, BlockId::nil());
  }

  fn on_precommit_added(&mut self, round: u32) {
    let validators = self.validators.clone();
    let precommits = self.precommits(round);
    if let Some(block_id) = precommits.proof_of_lock(&validators) {
      if !block_id.is_nil() {
        self.commit_round = Some(round);
        self.step = Step::Commit;
        let commit = self.build_commit(round, &block_id);
        self.actions.push(Action::Commit { block_id, commit });
        return;
      }
    }
    if round == self.round
      && precommits.has_two_thirds_any(&validators)
      && matches!(self.step, Step::Precommit)
    {
      self.step = Step::PrecommitWait;
      self.actions.push(Action::ScheduleTimeout {
        step: Step::PrecommitWait,
        round,
        after: self.timeouts.precommit_wait,
      });
    }
  }

  /// `precommit_wait` fired without a quorum for any single
  /// block_id: advance to the next round.
  pub fn precommit_wait_timed_out(&mut self, round: u32) {
    if round != self.round || self.step != Step::PrecommitWait {
      return;
    }
    self.enter_new_round(round + 1);
  }

  /// Rebuilds the sparse `precommits` vector from the round's
  /// [`VoteSet`], keeping only the votes cast for the winning
  /// `block_id` (a validator that precommitted nil or a different
  /// block simply has no entry).
  fn build_commit(&self, round: u32, block_id: &BlockId) -> Commit {
    let n = self.validators.size();
    let mut precommits = vec![None; n];
    if let Some(rv) = self.rounds.get(&round) {
      if let Some(set) = &rv.precommits {
        for (index, slot) in precommits.iter_mut().enumerate() {
          if let Some(vote) = set.vote_for(index) {
            if &vote.block_id == block_id {
              *slot = Some(vote.clone());
            }
          }
        }
      }
    }
    Commit { block_id: block_id.clone(), precommits }
  }

  pub fn locked_block_id(&self) -> Option<&BlockId> {
    self.locked_block_id.as_ref()
  }

  pub fn valid_block_id(&self) -> Option<&BlockId> {
    self.valid_block_id.as_ref()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    consensus::{types::merkle_root, validator::Validator, vote_sign_bytes},
    primitives::Keypair,
  };

  fn four_validator_set() -> (ValidatorSet, Vec<Keypair>) {
    let mut keys = vec![];
    let mut vs = vec![];
    for i in 1..=4u8 {
      let kp = Keypair::generate(&mut rand::thread_rng());
      vs.push(Validator::new(kp.public(), 10, i == 1));
      keys.push(kp);
    }
    (ValidatorSet::new(vs, true).unwrap(), keys)
  }

  fn signed_vote(
    chain_id: &str,
    keypair: &Keypair,
    validator_index: u32,
    height: u64,
    round: u32,
    vote_type: VoteType,
    block_id: BlockId,
  ) -> Vote {
    let mut vote = Vote {
      validator_address: keypair.public().address(),
      validator_index,
      height,
      round,
      vote_type,
      block_id,
      signature: None,
    };
    vote.signature = Some(keypair.sign(&vote_sign_bytes(chain_id, &vote)));
    vote
  }

  #[test]
  fn propose_timeout_with_no_proposal_prevotes_nil() {
    let (set, keys) = four_validator_set();
    let mut rs = RoundState::new(
      1,
      "test".into(),
      keys[0].public(),
      set,
      TimeoutConfig::default(),
    );
    rs.drain_actions();
    rs.propose_timed_out();
    let actions = rs.drain_actions();
    assert!(actions.iter().any(|a| matches!(
      a,
      Action::BroadcastVote(v) if v.vote_type == VoteType::Prevote && v.block_id.is_nil()
    )));
  }

  #[test]
  fn two_thirds_prevote_locks_and_precommits() {
    let (set, keys) = four_validator_set();
    let mut rs = RoundState::new(
      1,
      "test".into(),
      keys[0].public(),
      set.clone(),
      TimeoutConfig::default(),
    );
    rs.drain_actions();

    let block_id = BlockId {
      hash: Some(merkle_root(&[vec![1]])),
      parts_header: PartSetHeader::zero(),
    };

    for (i, key) in keys.iter().enumerate().take(3) {
      let vote = signed_vote(
        "test",
        key,
        i as u32,
        1,
        0,
        VoteType::Prevote,
        block_id.clone(),
      );
      rs.add_vote(vote).unwrap();
    }

    assert_eq!(rs.locked_block_id(), Some(&block_id));
    assert_eq!(rs.step, Step::Precommit);

    for (i, key) in keys.iter().enumerate().take(3) {
      let vote = signed_vote(
        "test",
        key,
        i as u32,
        1,
        0,
        VoteType::Precommit,
        block_id.clone(),
      );
      rs.add_vote(vote).unwrap();
    }

    let actions = rs.drain_actions();
    let commit = actions.iter().find_map(|a| match a {
      Action::Commit { block_id: b, commit } if b == &block_id => Some(commit),
      _ => None,
    });
    let commit = commit.expect("commit action emitted for the locked block");
    assert_eq!(commit.precommits.iter().filter(|p| p.is_some()).count(), 3);
    assert_eq!(commit.voted_power(&set), 30);
    assert_eq!(rs.step, Step::Commit);
  }

  #[test]
  fn wrong_height_vote_is_rejected() {
    let (set, keys) = four_validator_set();
    let mut rs = RoundState::new(
      5,
      "test".into(),
      keys[0].public(),
      set,
      TimeoutConfig::default(),
    );
    let vote = signed_vote("test", &keys[0], 0, 4, 0, VoteType::Prevote, BlockId::nil());
    assert!(matches!(
      rs.add_vote(vote),
      Err(ConsensusError::WrongHeight { vote_height: 4, current_height: 5 })
    ));
  }
}
