//! Fast-sync blockchain reactor (base spec §4.6): while a node is
//! behind, this requests a sliding window of block heights from its
//! peers round-robin, retries requests that time out on a different
//! peer, and bans peers that consistently serve invalid blocks.
//!
//! Reuses [`super::SwarmResponder`] for the same reason the teacher
//! used it for block-replay requests: many heights are in flight at
//! once, and a timed-out request should fire exactly once rather than
//! on every poll of the retry loop.

use {
  super::responder::SwarmResponder,
  crate::{primitives::Pubkey, storage::RefuseList, consensus::Block},
  std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
  },
};

const WINDOW: u64 = 64;
const MAX_INFLIGHT_PER_PEER: usize = 4;
const REQUEST_RETRY_SLOT: Duration = Duration::from_millis(800);

#[derive(Debug, Clone)]
pub struct BlockRequest {
  pub height: u64,
  pub peer: Pubkey,
}

/// Tracks in-flight requests, buffered out-of-order arrivals, and
/// known peer heights for one fast-sync run. Applying a buffered
/// block (recomputing its validity against live consensus state)
/// stays the caller's job — this type only owns network-level
/// bookkeeping.
pub struct BlockPool {
  window: u64,
  max_inflight_per_peer: usize,
  our_height: u64,
  max_peer_height: u64,
  peer_heights: HashMap<Pubkey, u64>,
  connected: Vec<Pubkey>,
  next_peer: usize,
  in_flight: HashMap<u64, Pubkey>,
  per_peer_inflight: HashMap<Pubkey, usize>,
  buffered: BTreeMap<u64, (Block, Pubkey)>,
  retry: SwarmResponder<u64>,
  refuse_list: RefuseList,
}

impl BlockPool {
  pub fn new(our_height: u64, refuse_list: RefuseList) -> Self {
    Self {
      window: WINDOW,
      max_inflight_per_peer: MAX_INFLIGHT_PER_PEER,
      our_height,
      max_peer_height: our_height,
      peer_heights: HashMap::new(),
      connected: Vec::new(),
      next_peer: 0,
      in_flight: HashMap::new(),
      per_peer_inflight: HashMap::new(),
      buffered: BTreeMap::new(),
      retry: SwarmResponder::new(REQUEST_RETRY_SLOT, 1),
      refuse_list,
    }
  }

  /// The stream to poll (e.g. in a `tokio::select!` arm) for requests
  /// whose retry window elapsed without a block arriving.
  pub fn retry_stream(&mut self) -> &mut SwarmResponder<u64> {
    &mut self.retry
  }

  pub fn peer_connected(&mut self, peer: Pubkey) {
    if !self.connected.contains(&peer) {
      self.connected.push(peer);
    }
  }

  pub fn peer_disconnected(&mut self, peer: &Pubkey) {
    self.connected.retain(|p| p != peer);
    self.peer_heights.remove(peer);
    self.per_peer_inflight.remove(peer);
    let stuck: Vec<u64> =
      self.in_flight.iter().filter(|(_, p)| *p == peer).map(|(h, _)| *h).collect();
    for height in stuck {
      self.in_flight.remove(&height);
      self.retry.cancel(&height);
    }
  }

  /// Records a peer's advertised height, learned at admission time
  /// (base spec §4.6 uses this to decide when the pool is caught up).
  pub fn report_peer_height(&mut self, peer: Pubkey, height: u64) {
    self.max_peer_height = self.max_peer_height.max(height);
    self.peer_heights.insert(peer.clone(), height);
    self.peer_connected(peer);
  }

  fn next_peer_for_request(&mut self, exclude: Option<&Pubkey>) -> Option<Pubkey> {
    let n = self.connected.len();
    if n == 0 {
      return None;
    }
    for offset in 0..n {
      let idx = (self.next_peer + offset) % n;
      let candidate = self.connected[idx].clone();
      if Some(&candidate) == exclude {
        continue;
      }
      let inflight = *self.per_peer_inflight.get(&candidate).unwrap_or(&0);
      if inflight < self.max_inflight_per_peer {
        self.next_peer = (idx + 1) % n;
        return Some(candidate);
      }
    }
    None
  }

  /// Heights in `[our_height+1, our_height+window)` not yet requested
  /// or buffered, paired with the peer to ask next — round-robin
  /// across connected peers under a per-peer in-flight cap (base
  /// spec §4.6 "round-robin allocation with per-peer in-flight caps").
  pub fn requests_due(&mut self) -> Vec<BlockRequest> {
    let mut out = vec![];
    let upper = (self.our_height + self.window + 1).min(self.max_peer_height + 1);
    for height in (self.our_height + 1)..upper {
      if self.in_flight.contains_key(&height) || self.buffered.contains_key(&height) {
        continue;
      }
      if let Some(peer) = self.next_peer_for_request(None) {
        *self.per_peer_inflight.entry(peer.clone()).or_insert(0) += 1;
        self.in_flight.insert(height, peer.clone());
        self.retry.request(height);
        out.push(BlockRequest { height, peer });
      } else {
        break;
      }
    }
    out
  }

  /// A request's retry window elapsed. Reassigns it to a different
  /// peer, or does nothing if the block arrived in the meantime.
  pub fn reassign(&mut self, height: u64) -> Option<BlockRequest> {
    if self.buffered.contains_key(&height) || height <= self.our_height {
      return None;
    }
    let prior = self.in_flight.remove(&height);
    if let Some(peer) = &prior {
      if let Some(count) = self.per_peer_inflight.get_mut(peer) {
        *count = count.saturating_sub(1);
      }
    }
    let peer = self.next_peer_for_request(prior.as_ref())?;
    *self.per_peer_inflight.entry(peer.clone()).or_insert(0) += 1;
    self.in_flight.insert(height, peer.clone());
    self.retry.request(height);
    Some(BlockRequest { height, peer })
  }

  /// Buffers a block served by `peer`; stale (already-applied)
  /// heights are dropped.
  pub fn receive_block(&mut self, peer: Pubkey, block: Block) {
    let height = block.header.height;
    if height <= self.our_height {
      return;
    }
    if let Some(prior_peer) = self.in_flight.remove(&height) {
      if let Some(count) = self.per_peer_inflight.get_mut(&prior_peer) {
        *count = count.saturating_sub(1);
      }
    }
    self.retry.cancel(&height);
    self.buffered.insert(height, (block, peer));
  }

  /// The next sequentially-applicable block, if the immediate
  /// successor of `our_height` has already arrived and been buffered.
  pub fn pop_ready(&mut self) -> Option<(Block, Pubkey)> {
    let next = self.our_height + 1;
    self.buffered.remove(&next)
  }

  /// Called once a block returned by `pop_ready` has been validated
  /// and applied.
  pub fn advance(&mut self, applied_height: u64) {
    self.our_height = applied_height;
  }

  /// A block served by `peer` failed validation: ban it (base spec
  /// §4.6 "bans consistently faulty peers via the refuse list") and
  /// drop anything else attributed to it.
  pub fn punish(&mut self, peer: &Pubkey) {
    let _ = self.refuse_list.add(peer);
    self.peer_disconnected(peer);
    self.buffered.retain(|_, (_, served_by)| served_by != peer);
  }

  /// Fast-sync terminates when the pool's max known height is within
  /// one of our own (base spec §4.6), after which the consensus
  /// reactor takes over.
  pub fn is_caught_up(&self) -> bool {
    self.max_peer_height <= self.our_height + 1
  }

  pub fn our_height(&self) -> u64 {
    self.our_height
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn peer(seed: u8) -> Pubkey {
    let mut bytes = [0u8; 32];
    bytes[0] = seed;
    Pubkey::from_bytes(bytes)
  }

  fn pool(our_height: u64) -> BlockPool {
    let dir = tempfile::tempdir().unwrap();
    let store = crate::storage::Store::open(dir.path()).unwrap();
    BlockPool::new(our_height, store.refuse_list())
  }

  #[test]
  fn caught_up_when_peers_are_at_most_one_ahead() {
    let mut pool = pool(10);
    pool.report_peer_height(peer(1), 11);
    assert!(pool.is_caught_up());
    pool.report_peer_height(peer(2), 20);
    assert!(!pool.is_caught_up());
  }

  #[test]
  fn requests_round_robin_across_connected_peers() {
    let mut pool = pool(0);
    pool.report_peer_height(peer(1), 10);
    pool.report_peer_height(peer(2), 10);

    // each peer caps out at MAX_INFLIGHT_PER_PEER before the window
    // (heights 1..=10) is exhausted, so only 2 * cap requests go out.
    let requests = pool.requests_due();
    assert_eq!(requests.len(), 2 * MAX_INFLIGHT_PER_PEER);
    let peer1_count = requests.iter().filter(|r| r.peer == peer(1)).count();
    let peer2_count = requests.iter().filter(|r| r.peer == peer(2)).count();
    assert_eq!(peer1_count, MAX_INFLIGHT_PER_PEER);
    assert_eq!(peer2_count, MAX_INFLIGHT_PER_PEER);
  }

  #[test]
  fn punishing_a_peer_frees_its_buffered_and_inflight_heights() {
    let mut pool = pool(0);
    pool.report_peer_height(peer(1), 5);
    let requests = pool.requests_due();
    assert!(!requests.is_empty());

    pool.punish(&peer(1));
    assert!(pool.requests_due().is_empty(), "no peers left to reassign to");
  }
}
