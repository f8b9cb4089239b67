//! A Tendermint-style BFT round-based consensus engine: round-robin
//! proposer rotation, prevote/precommit quorum gating, and a locking
//! rule that guarantees safety across rounds.

pub mod genesis;
pub mod priv_validator;
pub mod state;
pub mod types;
pub mod validate;
pub mod validator;
pub mod vote_set;

pub use {
  genesis::{GenesisDoc, GenesisError, GenesisValidator},
  priv_validator::{PrivValidator, PrivValidatorError, SignStep},
  state::{Action, ConsensusError, RoundState, Step, TimeoutConfig},
  types::{
    merkle_root, proposal_sign_bytes, tx_hash, txs_hash, unwrap_tx, verify_merkle_proof,
    vote_sign_bytes, wrap_tx, Block, BlockBody, BlockId, Commit, Header, Part, PartSet,
    PartSetHeader, Proposal, Tx, Vote, VoteType,
  },
  validate::{filter_failing_txs, validate_block, ValidationError},
  validator::{Validator, ValidatorSet, ValidatorSetError},
  vote_set::{DuplicateVote, VoteSet},
};
