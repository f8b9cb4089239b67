//! Pending transaction pool (base spec §4.5).
//!
//! An ordered list of pending txs plus a dedup set, with a coarse
//! lock consensus holds for the duration of block assembly and
//! `update()` — mirrored here with a `tokio::sync::Mutex` rather than
//! a bespoke `Lock`/`Unlock` pair, since the engine only ever needs
//! `lock().await` around those two call sites.

use {
  crate::consensus::{tx_hash, Tx},
  multihash::Multihash,
  std::collections::HashSet,
};

/// `check_tx(bytes) -> (accept, reason)`, contributed by each
/// registered plugin. A tx rejected by any filter is rejected.
pub trait MempoolFilter: Send + Sync {
  fn check(&self, tx: &[u8]) -> Result<(), String>;
}

/// Wraps a plain closure as a [`MempoolFilter`], mirroring the
/// original `NewMempoolFilter(f func([]byte) (bool, error))`.
pub struct FnFilter<F>(F);

impl<F> FnFilter<F>
where
  F: Fn(&[u8]) -> Result<(), String> + Send + Sync,
{
  pub fn new(f: F) -> Self {
    Self(f)
  }
}

impl<F> MempoolFilter for FnFilter<F>
where
  F: Fn(&[u8]) -> Result<(), String> + Send + Sync,
{
  fn check(&self, tx: &[u8]) -> Result<(), String> {
    (self.0)(tx)
  }
}

pub struct Mempool {
  txs: Vec<Tx>,
  seen: HashSet<Multihash>,
  filters: Vec<Box<dyn MempoolFilter>>,
}

impl Mempool {
  pub fn new() -> Self {
    Self { txs: Vec::new(), seen: HashSet::new(), filters: Vec::new() }
  }

  pub fn register_filter(&mut self, filter: Box<dyn MempoolFilter>) {
    self.filters.push(filter);
  }

  /// Dedups by content hash, then runs every filter; appends on
  /// acceptance. Returns the rejection reason on the first filter
  /// that rejects.
  pub fn check_tx(&mut self, tx: Tx) -> Result<(), String> {
    let hash = tx_hash(&tx);
    if self.seen.contains(&hash) {
      return Err("duplicate transaction".to_string());
    }
    for filter in &self.filters {
      filter.check(&tx)?;
    }
    self.seen.insert(hash);
    self.txs.push(tx);
    Ok(())
  }

  /// Up to `max` txs in insertion order, without removing them.
  pub fn reap(&self, max: usize) -> Vec<Tx> {
    self.txs.iter().take(max).cloned().collect()
  }

  /// Removes committed txs (and anything that no longer passes the
  /// current filters, e.g. after a validator-set change) following a
  /// successful `ApplyBlock`.
  pub fn update(&mut self, committed: &[Tx]) {
    let committed_hashes: HashSet<Multihash> =
      committed.iter().map(|tx| tx_hash(tx)).collect();
    let filters = &self.filters;
    self.txs.retain(|tx| {
      let hash = tx_hash(tx);
      if committed_hashes.contains(&hash) {
        return false;
      }
      filters.iter().all(|f| f.check(tx).is_ok())
    });
    self.seen.retain(|hash| !committed_hashes.contains(hash));
  }

  pub fn len(&self) -> usize {
    self.txs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.txs.is_empty()
  }
}

impl Default for Mempool {
  fn default() -> Self {
    Self::new()
  }
}

/// A no-op mempool used while replaying blocks during crash recovery
/// (base spec §4.8): `ApplyBlock` must be a pure function of `(prior
/// state, block)` during replay, so `update()` here does nothing
/// rather than mutating a live pool out from under the real one.
pub struct MockMempool;

impl MockMempool {
  pub fn reap(&self, _max: usize) -> Vec<Tx> {
    Vec::new()
  }

  pub fn update(&mut self, _committed: &[Tx]) {}
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn duplicate_tx_is_rejected() {
    let mut mp = Mempool::new();
    mp.check_tx(vec![1, 2, 3]).unwrap();
    assert_eq!(mp.check_tx(vec![1, 2, 3]), Err("duplicate transaction".to_string()));
    assert_eq!(mp.len(), 1);
  }

  #[test]
  fn filter_rejection_prevents_admission() {
    let mut mp = Mempool::new();
    mp.register_filter(Box::new(FnFilter::new(|tx: &[u8]| {
      if tx.is_empty() {
        Err("empty tx".to_string())
      } else {
        Ok(())
      }
    })));
    assert!(mp.check_tx(vec![]).is_err());
    assert!(mp.check_tx(vec![9]).is_ok());
  }

  #[test]
  fn update_drops_committed_and_keeps_pending() {
    let mut mp = Mempool::new();
    mp.check_tx(vec![1]).unwrap();
    mp.check_tx(vec![2]).unwrap();
    mp.update(&[vec![1]]);
    assert_eq!(mp.reap(10), vec![vec![2]]);
  }
}
