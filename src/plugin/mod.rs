//! Application-independent hooks the Engine drives around every block
//! (base spec §4.7 "State Machine & Plugins"), grounded in the
//! original `IPlugin` interface: every registered plugin gets a
//! `begin_block`/`end_block` pair and a say in `deliver_tx`/`check_tx`
//! admission, independent of whatever the application's own ABCI-like
//! hooks decide.

mod specialop;

pub use specialop::{SharedSpecialop, Specialop, SpecialopError, ValidatorChange};

use crate::consensus::{Block, ValidatorSet};

pub struct BeginBlockParams<'a> {
  pub block: &'a Block,
}

pub struct EndBlockParams<'a> {
  pub block: &'a Block,
  pub current_validators: &'a ValidatorSet,
}

/// Applied at `height + 2`, as in standard Tendermint (base spec
/// §4.7 step 3).
#[derive(Default)]
pub struct EndBlockReturns {
  pub next_validator_set: Option<ValidatorSet>,
}

pub trait Plugin: Send + Sync {
  fn name(&self) -> &str;

  /// `false` means the tx is not passed on to the application.
  fn deliver_tx(&mut self, tx: &[u8], index: usize) -> Result<bool, String>;

  /// `false` means the tx is not passed on to the application.
  fn check_tx(&self, tx: &[u8]) -> Result<bool, String>;

  fn begin_block(&mut self, params: &BeginBlockParams) -> Result<(), String>;

  fn end_block(&mut self, params: &EndBlockParams) -> Result<EndBlockReturns, String>;

  /// Called when this plugin's accumulated status no longer needs to
  /// be retained, e.g. after a height is finalized past any replay
  /// window.
  fn reset(&mut self);
}

/// Runs `plugins` in registration order for `BeginBlock`, short-
/// circuiting on the first error (base spec §4.7 step 1).
pub fn begin_block_all(
  plugins: &mut [Box<dyn Plugin>],
  params: &BeginBlockParams,
) -> Result<(), String> {
  for plugin in plugins.iter_mut() {
    plugin.begin_block(params)?;
  }
  Ok(())
}

/// Runs `plugins` in registration order for `EndBlock`; the last
/// plugin to return a `next_validator_set` wins, mirroring a single
/// specialop-style plugin owning validator-set mutation while other
/// plugins are free to return `None`.
pub fn end_block_all(
  plugins: &mut [Box<dyn Plugin>],
  params: &EndBlockParams,
) -> Result<EndBlockReturns, String> {
  let mut result = EndBlockReturns::default();
  for plugin in plugins.iter_mut() {
    let returns = plugin.end_block(params)?;
    if returns.next_validator_set.is_some() {
      result.next_validator_set = returns.next_validator_set;
    }
  }
  Ok(result)
}

/// A tx is admitted only if every registered plugin's `check_tx`
/// returns `true` (base spec §4.5 "A tx accepted by one but rejected
/// by another is rejected").
pub fn check_tx_all(plugins: &[Box<dyn Plugin>], tx: &[u8]) -> Result<bool, String> {
  for plugin in plugins {
    if !plugin.check_tx(tx)? {
      return Ok(false);
    }
  }
  Ok(true)
}
