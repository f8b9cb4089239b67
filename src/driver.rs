//! Drives a single height's [`RoundState`] against real signatures,
//! timers and the block cache, the way `producer`/`chain` drove the
//! teacher's CBC-Casper runloop: `main`'s `tokio::select!` loop feeds
//! it network events and fired timeouts, and gets back a small set of
//! [`DriverOutput`]s to gossip or schedule.
//!
//! `RoundState` itself never touches signatures or block bytes — it
//! only knows about `BlockId`s and unsigned vote skeletons, and it
//! never originates a proposal (the proposer drafts and signs one
//! directly, outside the state machine). This is where vote skeletons
//! get connected to a real [`PrivValidator`] and a cache of blocks
//! seen over the wire.

use {
  crate::consensus::{
    vote_sign_bytes, Action, Block, BlockId, Commit, ConsensusError, PrivValidator, Proposal,
    RoundState, SignStep, Step, TimeoutConfig, Vote,
  },
  std::time::Duration,
  tracing::warn,
};

/// What the caller must do in response to feeding the driver an event.
pub enum DriverOutput {
  GossipVote(Vote),
  ScheduleTimeout { step: Step, round: u32, after: Duration },
  /// `block` is `None` only if this node never saw the winning
  /// proposal's block bytes despite precommitting for it — the main
  /// loop should fall back to fast-sync to catch up rather than stall.
  Commit { block: Option<Block>, round: u32, commit: Commit },
}

pub struct ConsensusDriver {
  chain_id: String,
  priv_validator: PrivValidator,
  round: RoundState,
  /// A proposal received for the current round whose block hasn't
  /// arrived yet.
  pending_proposal: Option<Proposal>,
  /// A block received for the current round whose proposal hasn't
  /// arrived yet.
  unpaired_block: Option<Block>,
  /// Blocks seen for the current round, by the `BlockId` they'd
  /// produce once paired with a proposal's parts header. Small enough
  /// (at most a couple of entries per round) that a linear scan beats
  /// requiring `BlockId: Hash`.
  known_blocks: Vec<(BlockId, Block)>,
}

impl ConsensusDriver {
  /// Starts a fresh height, returning the driver plus any outputs the
  /// new `RoundState` already queued (at minimum, the round-0 propose
  /// timeout).
  pub fn new(
    height: u64,
    chain_id: String,
    priv_validator: PrivValidator,
    validators: crate::consensus::ValidatorSet,
    timeouts: TimeoutConfig,
  ) -> (Self, Vec<DriverOutput>) {
    let me = priv_validator.pubkey();
    let mut round = RoundState::new(height, chain_id.clone(), me, validators, timeouts);
    let actions = round.drain_actions();
    let mut driver = Self {
      chain_id,
      priv_validator,
      round,
      pending_proposal: None,
      unpaired_block: None,
      known_blocks: Vec::new(),
    };
    let outputs = driver.convert(actions);
    (driver, outputs)
  }

  pub fn height(&self) -> u64 {
    self.round.height
  }

  /// Reclaims the signing identity, e.g. to fall back to fast-sync
  /// after a commit this node never saw the block for, or to hand it
  /// straight to the next height's driver.
  pub fn into_priv_validator(self) -> PrivValidator {
    self.priv_validator
  }

  pub fn current_round(&self) -> u32 {
    self.round.round
  }

  pub fn is_proposer(&self) -> bool {
    self.round.is_proposer()
  }

  pub fn proposer(&self) -> &crate::primitives::Pubkey {
    self.round.proposer()
  }

  /// Signs a proposal this node just drafted for its own turn,
  /// enforcing the same double-sign guard as votes.
  pub fn sign_proposal(&mut self, mut proposal: Proposal) -> Proposal {
    let sign_bytes = crate::consensus::proposal_sign_bytes(&self.chain_id, &proposal);
    match self.priv_validator.sign(
      proposal.height,
      proposal.round,
      SignStep::Propose,
      &sign_bytes,
    ) {
      Ok(signature) => proposal.signature = Some(signature),
      Err(e) => warn!("refusing to sign proposal: {e}"),
    }
    proposal
  }

  /// Feeds this node's own freshly drafted-and-signed proposal back
  /// through the round state, the same way an incoming one would be —
  /// the proposer evaluates and prevotes its own proposal symmetrically
  /// with every other validator. Unlike [`Self::receive_proposal`],
  /// the backing block never needs to round-trip over the wire to be
  /// recognized as the one the proposal describes.
  pub fn propose_own_block(&mut self, proposal: Proposal, block: Block) -> Vec<DriverOutput> {
    let block_id = block.id(proposal.block_parts_header.clone());
    self.known_blocks.push((block_id.clone(), block));
    self.apply_proposal(proposal, block_id)
  }

  /// A block arrived before (or instead of) its proposal; pair it up
  /// if the proposal is already waiting, otherwise stash it until one
  /// shows up.
  pub fn receive_block(&mut self, block: Block) -> Vec<DriverOutput> {
    if let Some(proposal) = self.pending_proposal.clone() {
      let block_id = block.id(proposal.block_parts_header.clone());
      self.known_blocks.push((block_id.clone(), block));
      return self.apply_proposal(proposal, block_id);
    }
    self.unpaired_block = Some(block);
    Vec::new()
  }

  pub fn receive_proposal(&mut self, proposal: Proposal) -> Vec<DriverOutput> {
    if proposal.round != self.round.round || self.pending_proposal.is_some() {
      return Vec::new();
    }
    let sign_bytes = crate::consensus::proposal_sign_bytes(&self.chain_id, &proposal);
    let verifies = match &proposal.signature {
      Some(sig) => sig.verify(self.round.proposer(), &sign_bytes),
      None => false,
    };
    if !verifies {
      warn!("dropping proposal with bad signature for round {}", proposal.round);
      return Vec::new();
    }

    if let Some(block) = self.unpaired_block.take() {
      let block_id = block.id(proposal.block_parts_header.clone());
      self.known_blocks.push((block_id.clone(), block));
      return self.apply_proposal(proposal, block_id);
    }

    self.pending_proposal = Some(proposal);
    Vec::new()
  }

  fn apply_proposal(&mut self, proposal: Proposal, block_id: BlockId) -> Vec<DriverOutput> {
    self.pending_proposal = None;
    self.round.receive_proposal(proposal, block_id);
    let actions = self.round.drain_actions();
    self.convert(actions)
  }

  pub fn receive_vote(&mut self, vote: Vote) -> Result<Vec<DriverOutput>, ConsensusError> {
    self.round.add_vote(vote)?;
    let actions = self.round.drain_actions();
    Ok(self.convert(actions))
  }

  pub fn propose_timed_out(&mut self) -> Vec<DriverOutput> {
    self.round.propose_timed_out();
    let actions = self.round.drain_actions();
    self.convert(actions)
  }

  pub fn prevote_wait_timed_out(&mut self, round: u32) -> Vec<DriverOutput> {
    self.round.prevote_wait_timed_out(round);
    let actions = self.round.drain_actions();
    self.convert(actions)
  }

  pub fn precommit_wait_timed_out(&mut self, round: u32) -> Vec<DriverOutput> {
    self.round.precommit_wait_timed_out(round);
    self.pending_proposal = None;
    self.unpaired_block = None;
    let actions = self.round.drain_actions();
    self.convert(actions)
  }

  fn convert(&mut self, actions: Vec<Action>) -> Vec<DriverOutput> {
    actions
      .into_iter()
      .filter_map(|action| match action {
        Action::BroadcastVote(mut vote) => {
          let step = match vote.vote_type {
            crate::consensus::VoteType::Prevote => SignStep::Prevote,
            crate::consensus::VoteType::Precommit => SignStep::Precommit,
          };
          let sign_bytes = vote_sign_bytes(&self.chain_id, &vote);
          match self.priv_validator.sign(vote.height, vote.round, step, &sign_bytes) {
            Ok(signature) => {
              vote.signature = Some(signature);
              Some(DriverOutput::GossipVote(vote))
            }
            Err(e) => {
              warn!("refusing to sign vote: {e}");
              None
            }
          }
        }
        Action::BroadcastProposal(_) => {
          // RoundState never emits this itself; the proposer drafts
          // and gossips its own proposal directly.
          None
        }
        Action::ScheduleTimeout { step, round, after } => {
          Some(DriverOutput::ScheduleTimeout { step, round, after })
        }
        Action::Commit { block_id, commit } => {
          let block =
            self.known_blocks.iter().find(|(id, _)| id == &block_id).map(|(_, b)| b.clone());
          if block.is_none() {
            warn!(%block_id, "committed to a block this node never received; falling back to fast-sync");
          }
          let round = self.round.commit_round().unwrap_or(self.round.round);
          Some(DriverOutput::Commit { block, round, commit })
        }
        Action::Evidence(dup) => {
          warn!(?dup, "duplicate vote evidence recorded");
          None
        }
      })
      .collect()
  }
}
